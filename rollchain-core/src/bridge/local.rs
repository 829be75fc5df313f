//! In-process bridge implementations
//!
//! `LocalTrustAnchor` mirrors the anchoring contract: a session is valid
//! until its remote deadline, and each `(session, claimant)` pair may be
//! recorded once. `LocalContentStore` addresses blobs by the SHA-256 of
//! their canonical JSON. Both can be snapshotted to disk so the CLI keeps
//! remote state between runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AnchorReceipt, BridgeError, ContentStore, SessionValidity, TrustAnchor};
use crate::clock::{Clock, SystemClock};
use crate::ledger::hasher::{canonical_serialize, sha256_hex};
use crate::store::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteSession {
    class_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AnchorState {
    #[serde(default)]
    sessions: BTreeMap<String, RemoteSession>,
    /// session id -> claimant ids already recorded
    #[serde(default)]
    attendance: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    tx_count: u64,
}

impl AnchorState {
    fn next_tx(&mut self, action: &str, parts: &[&str]) -> String {
        self.tx_count += 1;
        let material = format!("{}|{}|{}", action, parts.join("|"), self.tx_count);
        format!("0x{}", sha256_hex(material.as_bytes()))
    }

    fn is_valid(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| now <= s.expires_at)
    }
}

/// In-process trust anchor
pub struct LocalTrustAnchor {
    state: Mutex<AnchorState>,
    clock: Arc<dyn Clock>,
}

impl Default for LocalTrustAnchor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTrustAnchor {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(AnchorState::default()),
            clock,
        }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let anchor = Self::new();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let bytes = tokio::fs::read(path).await?;
            *anchor.state.lock().await = serde_json::from_slice(&bytes)?;
            debug!("Loaded local trust anchor state from {}", path.display());
        }
        Ok(anchor)
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(&*self.state.lock().await)?;
        write_atomic(path, &json).await?;
        Ok(())
    }
}

#[async_trait]
impl TrustAnchor for LocalTrustAnchor {
    async fn create_remote_session(
        &self,
        session_id: &str,
        class_id: &str,
        ttl_minutes: i64,
    ) -> Result<AnchorReceipt, BridgeError> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(session_id) {
            return Err(BridgeError::Rejected {
                operation: "createSession".to_string(),
                reason: format!("session {session_id} already exists"),
            });
        }
        state.sessions.insert(
            session_id.to_string(),
            RemoteSession {
                class_id: class_id.to_string(),
                expires_at: self.clock.now() + Duration::minutes(ttl_minutes),
            },
        );
        let tx = state.next_tx("createSession", &[session_id, class_id]);
        Ok(AnchorReceipt {
            success: true,
            tx_hash: Some(tx),
        })
    }

    async fn is_remote_session_valid(
        &self,
        session_id: &str,
    ) -> Result<SessionValidity, BridgeError> {
        let state = self.state.lock().await;
        Ok(SessionValidity {
            success: true,
            is_valid: state.is_valid(session_id, self.clock.now()),
        })
    }

    async fn record_attendance(
        &self,
        session_id: &str,
        claimant_id: &str,
        class_id: &str,
    ) -> Result<AnchorReceipt, BridgeError> {
        let mut state = self.state.lock().await;
        let rejected = |reason: &str| BridgeError::Rejected {
            operation: "markAttendance".to_string(),
            reason: reason.to_string(),
        };

        if !state.is_valid(session_id, self.clock.now()) {
            return Err(rejected("session is invalid or expired"));
        }
        if state
            .sessions
            .get(session_id)
            .is_some_and(|s| s.class_id != class_id)
        {
            return Err(rejected("class does not match session"));
        }

        let attendees = state.attendance.entry(session_id.to_string()).or_default();
        if attendees.iter().any(|id| id == claimant_id) {
            return Err(rejected("attendance already marked for this session"));
        }
        attendees.push(claimant_id.to_string());

        let tx = state.next_tx("markAttendance", &[session_id, claimant_id, class_id]);
        Ok(AnchorReceipt {
            success: true,
            tx_hash: Some(tx),
        })
    }

    async fn has_attended(&self, session_id: &str, claimant_id: &str) -> Result<bool, BridgeError> {
        Ok(self
            .state
            .lock()
            .await
            .attendance
            .get(session_id)
            .is_some_and(|ids| ids.iter().any(|id| id == claimant_id)))
    }

    fn name(&self) -> &'static str {
        "local-anchor"
    }
}

/// In-process content-addressed store
#[derive(Default)]
pub struct LocalContentStore {
    blobs: Mutex<BTreeMap<String, Value>>,
}

impl LocalContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address a blob would be stored under
    pub fn address_of(blob: &Value) -> String {
        format!("sha256-{}", sha256_hex(canonical_serialize(blob).as_bytes()))
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let store = Self::new();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let bytes = tokio::fs::read(path).await?;
            *store.blobs.lock().await = serde_json::from_slice(&bytes)?;
        }
        Ok(store)
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(&*self.blobs.lock().await)?;
        write_atomic(path, &json).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn publish(&self, blob: &Value) -> Result<Option<String>, BridgeError> {
        let address = Self::address_of(blob);
        self.blobs.lock().await.insert(address.clone(), blob.clone());
        Ok(Some(address))
    }

    async fn fetch(&self, address: &str) -> Result<Option<Value>, BridgeError> {
        Ok(self.blobs.lock().await.get(address).cloned())
    }

    fn name(&self) -> &'static str {
        "local-content"
    }
}
