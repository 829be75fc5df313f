//! Persistence seams for sessions, classes, ledger blocks and attendance
//!
//! Every mutation exposed here is a per-document conditional write
//! (set-if-active, add-to-set, insert-if-absent), so callers never need an
//! external lock to stay correct under concurrency.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::{AttendanceRecord, ClassRecord, LedgerBlock, Session};

#[derive(Error, Debug)]
pub enum StoreError {
    /// A write would violate an installed unique index
    #[error("Duplicate key on {collection}.{index}: {key}")]
    DuplicateKey {
        collection: Collection,
        index: String,
        key: String,
    },

    #[error("Index {name} already exists on {collection} with different options")]
    IndexConflict { collection: Collection, name: String },

    #[error("Index {name} not found on {collection}")]
    IndexNotFound { collection: Collection, name: String },

    #[error("Collection {collection} is append-only")]
    Immutable { collection: Collection },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Failed to read store snapshot from {path}")]
    SnapshotRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write store snapshot to {path}")]
    SnapshotWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store snapshot is corrupted or has an invalid format")]
    SnapshotParse {
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize store snapshot")]
    SnapshotSerialize {
        #[source]
        source: serde_json::Error,
    },
}

/// Replace `path` with `bytes` via a sibling temp file and a rename
///
/// Readers see either the old file or the new one, never a partial write.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Named entity sets, used by the index administration API
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Sessions,
    Classes,
    LedgerBlocks,
    Attendance,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Sessions => "sessions",
            Collection::Classes => "classes",
            Collection::LedgerBlocks => "ledger_blocks",
            Collection::Attendance => "attendance",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index definition over one or more fields of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(fields: &[&str], unique: bool) -> Self {
        Self {
            name: fields.join("_"),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique,
        }
    }

    pub fn unique(fields: &[&str]) -> Self {
        Self::new(fields, true)
    }

    pub fn covers(&self, fields: &[&str]) -> bool {
        self.fields.len() == fields.len() && self.fields.iter().zip(fields).all(|(a, b)| a == b)
    }
}

/// A document id with its creation time, as seen by duplicate scans
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// Documents sharing the same value for an index key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: Vec<String>,
    /// Ordered earliest first (ties broken by id)
    pub members: Vec<DocumentRef>,
}

/// Uniform field access for index enforcement and duplicate scans
pub trait Document {
    fn doc_id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn field(&self, name: &str) -> Option<String>;

    fn key(&self, fields: &[String]) -> Option<Vec<String>> {
        fields.iter().map(|f| self.field(f)).collect()
    }
}

/// Result of the ledger's insert-if-absent on `block_number`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockInsert {
    Inserted,
    /// Another writer already stored a block with this number
    Conflict,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: Session) -> Result<(), StoreError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Flip `active` to false; returns whether this call performed the flip
    async fn deactivate_if_active(&self, id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ClassStore: Send + Sync {
    async fn insert_class(&self, class: ClassRecord) -> Result<(), StoreError>;

    async fn get_class(&self, id: &str) -> Result<Option<ClassRecord>, StoreError>;

    /// Set-add enrollment; returns whether the student was newly added.
    /// `Ok(false)` is also returned when the class does not exist.
    async fn enroll(&self, class_id: &str, student_id: &str) -> Result<bool, StoreError>;

    /// Classes owned by a teacher, oldest first
    async fn classes_for_teacher(&self, teacher_id: &str) -> Result<Vec<ClassRecord>, StoreError>;

    /// Classes a student is enrolled in, oldest first
    async fn classes_for_student(&self, student_id: &str) -> Result<Vec<ClassRecord>, StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Highest-numbered block, if any
    async fn tail(&self) -> Result<Option<LedgerBlock>, StoreError>;

    /// Store the block only if its number is not taken yet
    async fn insert_block(&self, block: LedgerBlock) -> Result<BlockInsert, StoreError>;

    /// Blocks with `block_number >= from`, ascending, at most `limit`
    async fn blocks_from(&self, from: u64, limit: usize) -> Result<Vec<LedgerBlock>, StoreError>;

    async fn block_count(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn find_record(
        &self,
        student_id: &str,
        session_id: &str,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Insert honouring installed unique indexes
    async fn insert_record(&self, record: AttendanceRecord) -> Result<(), StoreError>;

    async fn records_for_student(&self, student_id: &str)
        -> Result<Vec<AttendanceRecord>, StoreError>;

    async fn records_for_class(&self, class_id: &str) -> Result<Vec<AttendanceRecord>, StoreError>;

    async fn record_ids(&self) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait IndexAdmin: Send + Sync {
    async fn indexes(&self, collection: Collection) -> Result<Vec<IndexSpec>, StoreError>;

    /// Install an index; a unique index is refused while duplicates exist
    async fn create_index(&self, collection: Collection, spec: IndexSpec)
        -> Result<(), StoreError>;

    async fn drop_index(&self, collection: Collection, name: &str) -> Result<(), StoreError>;

    async fn duplicate_groups(
        &self,
        collection: Collection,
        fields: &[String],
    ) -> Result<Vec<DuplicateGroup>, StoreError>;

    /// Delete documents by id; returns how many were removed
    async fn delete_many(&self, collection: Collection, ids: &[String])
        -> Result<usize, StoreError>;
}

/// Everything the check-in service needs from a backing store
pub trait CheckinStore:
    SessionStore + ClassStore + LedgerStore + AttendanceStore + IndexAdmin
{
}

impl<T> CheckinStore for T where
    T: SessionStore + ClassStore + LedgerStore + AttendanceStore + IndexAdmin
{
}

impl Document for Session {
    fn doc_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "class_id" => Some(self.class_id.clone()),
            "issuer_id" => Some(self.issuer_id.clone()),
            "secret_token" => Some(self.secret_token.clone()),
            "expires_at" => Some(self.expires_at.to_rfc3339()),
            "active" => Some(self.active.to_string()),
            _ => None,
        }
    }
}

impl Document for ClassRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "name" => Some(self.name.clone()),
            "code" => Some(self.code.clone()),
            "teacher_id" => Some(self.teacher_id.clone()),
            _ => None,
        }
    }
}

impl Document for LedgerBlock {
    fn doc_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "block_number" => Some(self.block_number.to_string()),
            "hash" => Some(self.hash.clone()),
            "previous_hash" => Some(self.previous_hash.clone()),
            _ => None,
        }
    }
}

impl Document for AttendanceRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "student_id" => Some(self.student_id.clone()),
            "class_id" => Some(self.class_id.clone()),
            "session_id" => Some(self.session_id.clone()),
            "blockchain_hash" => Some(self.blockchain_hash.clone()),
            "external_anchor_tx" => self.external_anchor_tx.clone(),
            "content_address_id" => self.content_address_id.clone(),
            _ => None,
        }
    }
}
