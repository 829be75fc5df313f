//! Caller-visible error taxonomy for check-in operations
//!
//! Each layer keeps its own error enum (`LedgerError`, `StoreError`,
//! `BridgeError`, `ReconcileError`); this module folds them into the outcome
//! classes collaborators act on.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::bridge::BridgeError;
use crate::ledger::LedgerError;
use crate::reconcile::ReconcileError;
use crate::store::StoreError;

/// Errors surfaced by session issuance and attendance marking
#[derive(Error, Debug)]
pub enum CheckinError {
    /// Token does not split into `classId|sessionId|expiresAtEpoch`
    #[error("Malformed session token: {reason}")]
    MalformedToken { reason: String },

    /// No active session with this id
    #[error("Session {session_id} is unknown or no longer active")]
    UnknownOrInactiveSession { session_id: String },

    /// Session exists but its lifetime has elapsed (now latched inactive)
    #[error("Session {session_id} expired at {expired_at}")]
    ExpiredSession {
        session_id: String,
        expired_at: DateTime<Utc>,
    },

    /// Class referenced by a session or issuance request does not exist
    #[error("Class not found: {class_id}")]
    UnknownClass { class_id: String },

    /// Trust anchor could not confirm the session is still valid upstream
    #[error("Remote trust anchor rejected session {session_id}: {reason}")]
    RemoteSessionInvalid { session_id: String, reason: String },

    /// Trust anchor failed to co-create the remote session at issuance
    #[error("Failed to anchor session {session_id} remotely: {reason}")]
    ExternalAnchor { session_id: String, reason: String },

    /// Ledger append lost the race too many times; safe to retry the claim
    #[error("Ledger append gave up after {attempts} contended attempts")]
    LedgerContention { attempts: u32 },

    /// Ledger append failed for a non-contention reason
    #[error("Failed to append ledger block")]
    LedgerAppend {
        #[source]
        source: LedgerError,
    },

    /// Block was appended but the attendance record could not be stored.
    /// The block stays in the ledger as an orphaned audit entry.
    #[error("Attendance record could not be persisted (orphaned block {block_hash})")]
    RecordPersist {
        block_hash: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl CheckinError {
    /// Whether the whole claim can be retried by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CheckinError::LedgerContention { .. } | CheckinError::RecordPersist { .. }
        )
    }

    /// Short machine-readable kind, used by the CLI's JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            CheckinError::MalformedToken { .. } => "malformed_token",
            CheckinError::UnknownOrInactiveSession { .. } => "unknown_or_inactive_session",
            CheckinError::ExpiredSession { .. } => "expired_session",
            CheckinError::UnknownClass { .. } => "unknown_class",
            CheckinError::RemoteSessionInvalid { .. } => "remote_session_invalid",
            CheckinError::ExternalAnchor { .. } => "external_anchor",
            CheckinError::LedgerContention { .. } => "ledger_contention",
            CheckinError::LedgerAppend { .. } => "ledger_append",
            CheckinError::RecordPersist { .. } => "record_persist",
            CheckinError::Store(_) => "store",
            CheckinError::Reconcile(_) => "reconcile",
        }
    }

    /// Log ledger and reconciliation failures on the integrity target
    pub fn log_if_integrity_critical(&self) {
        match self {
            CheckinError::LedgerAppend { .. }
            | CheckinError::RecordPersist { .. }
            | CheckinError::Reconcile(_) => {
                tracing::error!(target: "integrity", "INTEGRITY FAILURE: {}", self);
            }
            _ => {}
        }
    }
}

impl From<LedgerError> for CheckinError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Contention { attempts } => CheckinError::LedgerContention { attempts },
            other => CheckinError::LedgerAppend { source: other },
        }
    }
}

/// Helper for mapping a bridge failure into the remote-validity error
pub(crate) fn remote_invalid(session_id: &str, err: &BridgeError) -> CheckinError {
    CheckinError::RemoteSessionInvalid {
        session_id: session_id.to_string(),
        reason: err.to_string(),
    }
}
