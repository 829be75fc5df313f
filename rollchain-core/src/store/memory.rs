//! In-memory store with JSON snapshot persistence
//!
//! All collections live behind one `RwLock`; each trait method takes the lock
//! once, so every conditional write is atomic with respect to other callers.
//! The lock is never held across an `.await` on anything but the lock itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    write_atomic, AttendanceStore, BlockInsert, ClassStore, Collection, Document, DocumentRef,
    DuplicateGroup, IndexAdmin, IndexSpec, LedgerStore, SessionStore, StoreError,
};
use crate::model::{AttendanceRecord, ClassRecord, LedgerBlock, Session};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    sessions: BTreeMap<String, Session>,
    #[serde(default)]
    classes: BTreeMap<String, ClassRecord>,
    #[serde(default)]
    blocks: BTreeMap<u64, LedgerBlock>,
    #[serde(default)]
    attendance: BTreeMap<String, AttendanceRecord>,
    #[serde(default)]
    indexes: BTreeMap<Collection, Vec<IndexSpec>>,
    #[cfg(test)]
    #[serde(skip)]
    fail_next_record_insert: bool,
}

impl StoreState {
    fn docs(&self, collection: Collection) -> Vec<&dyn Document> {
        match collection {
            Collection::Sessions => self.sessions.values().map(|d| d as &dyn Document).collect(),
            Collection::Classes => self.classes.values().map(|d| d as &dyn Document).collect(),
            Collection::LedgerBlocks => self.blocks.values().map(|d| d as &dyn Document).collect(),
            Collection::Attendance => {
                self.attendance.values().map(|d| d as &dyn Document).collect()
            }
        }
    }

    fn unique_indexes(&self, collection: Collection) -> Vec<IndexSpec> {
        self.indexes
            .get(&collection)
            .map(|specs| specs.iter().filter(|s| s.unique).cloned().collect())
            .unwrap_or_default()
    }

    /// First unique index that `candidate` would violate
    fn check_unique(
        &self,
        collection: Collection,
        candidate: &dyn Document,
    ) -> Result<(), StoreError> {
        for spec in self.unique_indexes(collection) {
            let Some(key) = candidate.key(&spec.fields) else {
                continue;
            };
            let clash = self
                .docs(collection)
                .into_iter()
                .any(|doc| {
                    doc.doc_id() != candidate.doc_id()
                        && doc.key(&spec.fields).as_ref() == Some(&key)
                });
            if clash {
                return Err(StoreError::DuplicateKey {
                    collection,
                    index: spec.name.clone(),
                    key: key.join("|"),
                });
            }
        }
        Ok(())
    }

    fn duplicate_groups(&self, collection: Collection, fields: &[String]) -> Vec<DuplicateGroup> {
        let mut groups: BTreeMap<Vec<String>, Vec<DocumentRef>> = BTreeMap::new();
        for doc in self.docs(collection) {
            if let Some(key) = doc.key(fields) {
                groups.entry(key).or_default().push(DocumentRef {
                    id: doc.doc_id().to_string(),
                    created_at: doc.created_at(),
                });
            }
        }

        groups
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(key, mut members)| {
                members.sort_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.id.cmp(&b.id))
                });
                DuplicateGroup { key, members }
            })
            .collect()
    }
}

/// Shared in-memory implementation of every store trait
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot; a missing file yields an empty store
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!("No store snapshot at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| StoreError::SnapshotRead {
                path: path.to_path_buf(),
                source,
            })?;
        let state: StoreState =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::SnapshotParse { source })?;

        debug!(
            "Store snapshot loaded: {} sessions, {} classes, {} blocks, {} records",
            state.sessions.len(),
            state.classes.len(),
            state.blocks.len(),
            state.attendance.len()
        );

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Write the snapshot atomically (temp file then rename)
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&*state)
                .map_err(|source| StoreError::SnapshotSerialize { source })?
        };

        write_atomic(path, &json)
            .await
            .map_err(|source| StoreError::SnapshotWrite {
                path: path.to_path_buf(),
                source,
            })?;

        debug!("Store snapshot written to {}", path.display());
        Ok(())
    }

    /// Make the next `insert_record` fail as if the backend were down
    #[cfg(test)]
    pub(crate) async fn fail_next_record_insert(&self) {
        self.state.write().await.fail_next_record_insert = true;
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: Session) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&session.id) {
            return Err(StoreError::DuplicateKey {
                collection: Collection::Sessions,
                index: "id".to_string(),
                key: session.id,
            });
        }
        state.check_unique(Collection::Sessions, &session)?;
        state.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.state.read().await.sessions.get(id).cloned())
    }

    async fn deactivate_if_active(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(id) {
            Some(session) if session.active => {
                session.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ClassStore for MemoryStore {
    async fn insert_class(&self, class: ClassRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.classes.contains_key(&class.id) {
            return Err(StoreError::DuplicateKey {
                collection: Collection::Classes,
                index: "id".to_string(),
                key: class.id,
            });
        }
        state.check_unique(Collection::Classes, &class)?;
        state.classes.insert(class.id.clone(), class);
        Ok(())
    }

    async fn get_class(&self, id: &str) -> Result<Option<ClassRecord>, StoreError> {
        Ok(self.state.read().await.classes.get(id).cloned())
    }

    async fn enroll(&self, class_id: &str, student_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        Ok(state
            .classes
            .get_mut(class_id)
            .map(|class| class.students_enrolled.insert(student_id.to_string()))
            .unwrap_or(false))
    }

    async fn classes_for_teacher(&self, teacher_id: &str) -> Result<Vec<ClassRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(oldest_first(&state.classes, |c| c.teacher_id == teacher_id))
    }

    async fn classes_for_student(&self, student_id: &str) -> Result<Vec<ClassRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(oldest_first(&state.classes, |c| c.students_enrolled.contains(student_id)))
    }
}

fn oldest_first(
    classes: &BTreeMap<String, ClassRecord>,
    keep: impl Fn(&ClassRecord) -> bool,
) -> Vec<ClassRecord> {
    let mut matched: Vec<ClassRecord> = classes.values().filter(|&c| keep(c)).cloned().collect();
    matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    matched
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn tail(&self) -> Result<Option<LedgerBlock>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .blocks
            .last_key_value()
            .map(|(_, block)| block.clone()))
    }

    async fn insert_block(&self, block: LedgerBlock) -> Result<BlockInsert, StoreError> {
        let mut state = self.state.write().await;
        if state.blocks.contains_key(&block.block_number) {
            return Ok(BlockInsert::Conflict);
        }
        state.blocks.insert(block.block_number, block);
        Ok(BlockInsert::Inserted)
    }

    async fn blocks_from(&self, from: u64, limit: usize) -> Result<Vec<LedgerBlock>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .blocks
            .range(from..)
            .take(limit)
            .map(|(_, block)| block.clone())
            .collect())
    }

    async fn block_count(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.blocks.len() as u64)
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn find_record(
        &self,
        student_id: &str,
        session_id: &str,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .attendance
            .values()
            .filter(|r| r.student_id == student_id && r.session_id == session_id)
            .min_by(|a, b| a.timestamp.cmp(&b.timestamp))
            .cloned())
    }

    async fn insert_record(&self, record: AttendanceRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        #[cfg(test)]
        if std::mem::take(&mut state.fail_next_record_insert) {
            return Err(StoreError::Unavailable {
                reason: "injected record insert failure".to_string(),
            });
        }

        if state.attendance.contains_key(&record.id) {
            return Err(StoreError::DuplicateKey {
                collection: Collection::Attendance,
                index: "id".to_string(),
                key: record.id,
            });
        }
        state.check_unique(Collection::Attendance, &record)?;
        state.attendance.insert(record.id.clone(), record);
        Ok(())
    }

    async fn records_for_student(
        &self,
        student_id: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut records: Vec<_> = self
            .state
            .read()
            .await
            .attendance
            .values()
            .filter(|r| r.student_id == student_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    async fn records_for_class(&self, class_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut records: Vec<_> = self
            .state
            .read()
            .await
            .attendance
            .values()
            .filter(|r| r.class_id == class_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    async fn record_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.read().await.attendance.keys().cloned().collect())
    }
}

#[async_trait]
impl IndexAdmin for MemoryStore {
    async fn indexes(&self, collection: Collection) -> Result<Vec<IndexSpec>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .indexes
            .get(&collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_index(
        &self,
        collection: Collection,
        spec: IndexSpec,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .indexes
            .get(&collection)
            .and_then(|specs| specs.iter().find(|s| s.name == spec.name))
        {
            if *existing == spec {
                return Ok(());
            }
            return Err(StoreError::IndexConflict {
                collection,
                name: spec.name,
            });
        }

        if spec.unique {
            if let Some(group) = state.duplicate_groups(collection, &spec.fields).first() {
                return Err(StoreError::DuplicateKey {
                    collection,
                    index: spec.name,
                    key: group.key.join("|"),
                });
            }
        }

        debug!("Creating index {} on {}", spec.name, collection);
        state.indexes.entry(collection).or_default().push(spec);
        Ok(())
    }

    async fn drop_index(&self, collection: Collection, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let specs = state.indexes.entry(collection).or_default();
        let before = specs.len();
        specs.retain(|s| s.name != name);
        if specs.len() == before {
            return Err(StoreError::IndexNotFound {
                collection,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn duplicate_groups(
        &self,
        collection: Collection,
        fields: &[String],
    ) -> Result<Vec<DuplicateGroup>, StoreError> {
        Ok(self.state.read().await.duplicate_groups(collection, fields))
    }

    async fn delete_many(
        &self,
        collection: Collection,
        ids: &[String],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let removed = match collection {
            Collection::LedgerBlocks => return Err(StoreError::Immutable { collection }),
            Collection::Sessions => ids
                .iter()
                .filter(|id| state.sessions.remove(*id).is_some())
                .count(),
            Collection::Classes => ids
                .iter()
                .filter(|id| state.classes.remove(*id).is_some())
                .count(),
            Collection::Attendance => ids
                .iter()
                .filter(|id| state.attendance.remove(*id).is_some())
                .count(),
        };
        Ok(removed)
    }
}
