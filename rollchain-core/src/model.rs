//! Persisted entities: sessions, classes, ledger blocks and attendance records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// `previousHash` of the first block in the chain
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Action kind recorded in the payload of attendance blocks
pub const ATTENDANCE_MARKED: &str = "attendance_marked";

/// A time-bound, token-identified authorization to submit attendance claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub class_id: String,
    pub issuer_id: String,
    /// `classId|id|expiresAtEpoch`, rendered as the QR payload
    pub secret_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A class that sessions are issued for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRecord {
    pub id: String,
    pub name: String,
    pub code: String,
    pub teacher_id: String,
    #[serde(default)]
    pub students_enrolled: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

/// One immutable, sequentially linked ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerBlock {
    pub id: String,
    /// 1-based, strictly increasing, gapless
    pub block_number: u64,
    pub hash: String,
    pub previous_hash: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub nonce: u64,
}

/// The person submitting an attendance claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claimant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
}

impl Claimant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            wallet: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// An accepted attendance claim, created once per `(studentId, sessionId)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub verified: bool,
    pub blockchain_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_anchor_tx: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_address_id: Option<String>,
}

/// Canonical event description stored as the payload of an attendance block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub action: String,
    pub attendance_id: String,
    pub student_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_wallet: Option<String>,
    pub class_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_address: Option<String>,
}

/// Blob published to the content-addressed store for each accepted claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceBlob {
    #[serde(rename = "type")]
    pub kind: String,
    pub attendance_id: String,
    pub student_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    pub class_id: String,
    pub class_name: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_session_expiry_is_strict() {
        let now = Utc::now();
        let session = Session {
            id: "s".to_string(),
            class_id: "c".to_string(),
            issuer_id: "t".to_string(),
            secret_token: "c|s|0".to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(5),
            active: true,
        };
        assert!(!session.is_expired_at(session.expires_at));
        assert!(session.is_expired_at(session.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn test_record_serializes_camel_case_and_skips_absent_fields() {
        let record = AttendanceRecord {
            id: "r1".to_string(),
            student_id: "S1".to_string(),
            class_id: "C1".to_string(),
            session_id: "x".to_string(),
            timestamp: Utc::now(),
            verified: true,
            blockchain_hash: "abc".to_string(),
            external_anchor_tx: None,
            content_address_id: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["studentId"], "S1");
        assert!(json.get("contentAddressId").is_none());
    }
}
