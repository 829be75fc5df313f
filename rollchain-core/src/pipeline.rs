//! Attendance verification pipeline
//!
//! `mark_attendance` runs a fixed sequence of steps. Local validation and the
//! remote validity re-check are fatal; content publishing and remote
//! attendance anchoring are best effort and only degrade the optional fields
//! of the result. Nothing is written to the ledger or the record store until
//! every fatal check has passed, and a record is only written after its block.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bridge::{with_timeout, ContentStore, TrustAnchor};
use crate::clock::Clock;
use crate::error::{remote_invalid, CheckinError};
use crate::ledger::LedgerEngine;
use crate::model::{
    AttendanceBlob, AttendanceEvent, AttendanceRecord, Claimant, ClassRecord, Session,
    ATTENDANCE_MARKED,
};
use crate::session::SessionManager;
use crate::store::{AttendanceStore, ClassStore, StoreError};

const BLOB_KIND: &str = "attendance_record";

/// What a successful claim produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceReceipt {
    pub record_id: String,
    pub block_number: u64,
    pub block_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_address: Option<String>,
}

/// Result of `mark_attendance`; a repeated claim is a success, not an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttendanceOutcome {
    Recorded(AttendanceReceipt),
    Duplicate {
        record_id: String,
        block_hash: String,
    },
}

impl AttendanceOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AttendanceOutcome::Duplicate { .. })
    }

    pub fn block_hash(&self) -> &str {
        match self {
            AttendanceOutcome::Recorded(receipt) => &receipt.block_hash,
            AttendanceOutcome::Duplicate { block_hash, .. } => block_hash,
        }
    }

    fn duplicate_of(record: &AttendanceRecord) -> Self {
        AttendanceOutcome::Duplicate {
            record_id: record.id.clone(),
            block_hash: record.blockchain_hash.clone(),
        }
    }
}

pub struct AttendancePipeline {
    sessions: SessionManager,
    classes: Arc<dyn ClassStore>,
    attendance: Arc<dyn AttendanceStore>,
    ledger: LedgerEngine,
    anchor: Arc<dyn TrustAnchor>,
    content: Option<Arc<dyn ContentStore>>,
    clock: Arc<dyn Clock>,
    bridge_timeout: Duration,
}

impl AttendancePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: SessionManager,
        classes: Arc<dyn ClassStore>,
        attendance: Arc<dyn AttendanceStore>,
        ledger: LedgerEngine,
        anchor: Arc<dyn TrustAnchor>,
        content: Option<Arc<dyn ContentStore>>,
        clock: Arc<dyn Clock>,
        bridge_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            classes,
            attendance,
            ledger,
            anchor,
            content,
            clock,
            bridge_timeout,
        }
    }

    /// Verify a claim against `secret_token` and record it
    pub async fn mark_attendance(
        &self,
        secret_token: &str,
        claimant: &Claimant,
    ) -> Result<AttendanceOutcome, CheckinError> {
        let token = self.sessions.parse(secret_token)?;
        let session = self.sessions.validate(&token.session_id).await?;
        if session.class_id != token.class_id {
            return Err(CheckinError::MalformedToken {
                reason: format!(
                    "token names class {} but session {} belongs to {}",
                    token.class_id, session.id, session.class_id
                ),
            });
        }

        if let Some(existing) = self.attendance.find_record(&claimant.id, &session.id).await? {
            debug!(
                "Claimant {} already recorded for session {}",
                claimant.id, session.id
            );
            return Ok(AttendanceOutcome::duplicate_of(&existing));
        }

        let class = self.resolve_class(&session, claimant).await?;
        self.check_remote_validity(&session.id).await?;

        let attendance_id = uuid::Uuid::new_v4().to_string();
        let timestamp = self.clock.now();

        let content_address = self
            .publish_blob(&AttendanceBlob {
                kind: BLOB_KIND.to_string(),
                attendance_id: attendance_id.clone(),
                student_id: claimant.id.clone(),
                student_name: claimant.name.clone(),
                class_id: class.id.clone(),
                class_name: class.name.clone(),
                session_id: session.id.clone(),
                timestamp,
            })
            .await;
        let anchor_tx = self.anchor_attendance(&session, claimant).await;

        let event = AttendanceEvent {
            action: ATTENDANCE_MARKED.to_string(),
            attendance_id: attendance_id.clone(),
            student_id: claimant.id.clone(),
            student_wallet: claimant.wallet.clone(),
            class_id: class.id.clone(),
            session_id: session.id.clone(),
            timestamp,
            content_address: content_address.clone(),
        };
        let block = self.ledger.append_event(&event).await.map_err(|e| {
            let err = CheckinError::from(e);
            err.log_if_integrity_critical();
            err
        })?;

        let record = AttendanceRecord {
            id: attendance_id,
            student_id: claimant.id.clone(),
            class_id: class.id.clone(),
            session_id: session.id.clone(),
            timestamp,
            verified: true,
            blockchain_hash: block.hash.clone(),
            external_anchor_tx: anchor_tx.clone(),
            content_address_id: content_address.clone(),
        };

        if let Err(source) = self.attendance.insert_record(record.clone()).await {
            if matches!(source, StoreError::DuplicateKey { .. }) {
                // A concurrent claim by the same claimant won the insert
                if let Some(existing) =
                    self.attendance.find_record(&claimant.id, &session.id).await?
                {
                    warn!(
                        "Concurrent claim for ({}, {}) won; block {} is orphaned",
                        claimant.id, session.id, block.block_number
                    );
                    return Ok(AttendanceOutcome::duplicate_of(&existing));
                }
            }
            return Err(self.persist_failed(&block.hash, source));
        }

        info!(
            "Attendance recorded: student={} session={} block={} hash={}",
            claimant.id, session.id, block.block_number, block.hash
        );

        Ok(AttendanceOutcome::Recorded(AttendanceReceipt {
            record_id: record.id,
            block_number: block.block_number,
            block_hash: block.hash,
            anchor_tx,
            content_address,
        }))
    }

    async fn resolve_class(
        &self,
        session: &Session,
        claimant: &Claimant,
    ) -> Result<ClassRecord, CheckinError> {
        let class = self
            .classes
            .get_class(&session.class_id)
            .await?
            .ok_or_else(|| CheckinError::UnknownClass {
                class_id: session.class_id.clone(),
            })?;

        if !class.students_enrolled.contains(&claimant.id)
            && self.classes.enroll(&class.id, &claimant.id).await?
        {
            info!("Auto-enrolled {} in class {}", claimant.id, class.id);
        }
        Ok(class)
    }

    async fn check_remote_validity(&self, session_id: &str) -> Result<(), CheckinError> {
        let validity = with_timeout(
            self.bridge_timeout,
            "isRemoteSessionValid",
            self.anchor.is_remote_session_valid(session_id),
        )
        .await
        .map_err(|e| {
            warn!("Remote validity check failed for {}: {}", session_id, e);
            remote_invalid(session_id, &e)
        })?;

        if !(validity.success && validity.is_valid) {
            warn!("Trust anchor reports session {} invalid", session_id);
            return Err(CheckinError::RemoteSessionInvalid {
                session_id: session_id.to_string(),
                reason: "trust anchor reports the session invalid or expired".to_string(),
            });
        }
        Ok(())
    }

    async fn publish_blob(&self, blob: &AttendanceBlob) -> Option<String> {
        let store = self.content.as_ref()?;
        let value = match serde_json::to_value(blob) {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not serialize attendance blob: {}", e);
                return None;
            }
        };

        match with_timeout(self.bridge_timeout, "publish", store.publish(&value)).await {
            Ok(Some(address)) => Some(address),
            Ok(None) => {
                warn!("{} returned no content address", store.name());
                None
            }
            Err(e) => {
                warn!("Content publish via {} failed, continuing without: {}", store.name(), e);
                None
            }
        }
    }

    async fn anchor_attendance(&self, session: &Session, claimant: &Claimant) -> Option<String> {
        let outcome = with_timeout(
            self.bridge_timeout,
            "recordAttendance",
            self.anchor
                .record_attendance(&session.id, &claimant.id, &session.class_id),
        )
        .await;

        match outcome {
            Ok(receipt) if receipt.success => receipt.tx_hash,
            Ok(_) => {
                warn!(
                    "Trust anchor did not confirm attendance for ({}, {})",
                    claimant.id, session.id
                );
                None
            }
            Err(e) => {
                warn!("Remote attendance anchoring failed, continuing without: {}", e);
                None
            }
        }
    }

    fn persist_failed(&self, block_hash: &str, source: StoreError) -> CheckinError {
        let err = CheckinError::RecordPersist {
            block_hash: block_hash.to_string(),
            source,
        };
        err.log_if_integrity_critical();
        err
    }
}
