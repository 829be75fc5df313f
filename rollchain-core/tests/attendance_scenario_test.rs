//! End-to-end claim scenarios through the service facade

mod common;

use chrono::Duration;
use pretty_assertions::assert_eq;
use rollchain_core::bridge::fake::FakeBehavior;
use rollchain_core::model::Claimant;
use rollchain_core::store::{AttendanceStore, LedgerStore};
use rollchain_core::{AttendanceOutcome, CheckinError};

#[tokio::test]
async fn test_issue_claim_duplicate_then_expire() {
    common::init_test_logging();
    let h = common::start().await;

    let class = h.service.create_class("Databases", "C1", "T1").await.unwrap();
    let session = h.service.issue_session(&class.id, "T1").await.unwrap();
    assert_eq!(session.expires_at - session.created_at, Duration::minutes(5));

    let first = h
        .service
        .mark_attendance(&session.secret_token, &Claimant::new("S1"))
        .await
        .unwrap();
    let AttendanceOutcome::Recorded(receipt) = &first else {
        panic!("expected a recorded outcome, got {first:?}");
    };
    assert_eq!(receipt.block_number, 1);

    let genesis = h.store.blocks_from(1, 1).await.unwrap().remove(0);
    assert_eq!(genesis.previous_hash, "0");
    let record = h.store.find_record("S1", &session.id).await.unwrap().unwrap();
    assert!(record.verified);

    let second = h
        .service
        .mark_attendance(&session.secret_token, &Claimant::new("S1"))
        .await
        .unwrap();
    assert!(second.is_duplicate());
    assert_eq!(h.store.block_count().await.unwrap(), 1);

    h.clock.advance(Duration::minutes(5) + Duration::seconds(1));
    let err = h
        .service
        .mark_attendance(&session.secret_token, &Claimant::new("S2"))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckinError::ExpiredSession { .. }));
    assert_eq!(h.store.block_count().await.unwrap(), 1);
    assert!(h.store.find_record("S2", &session.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_tokens_fail_before_bridges() {
    let h = common::start().await;
    let before = h.anchor.calls().len();

    for token in ["garbage", "a|b", "a|b|c|d", "a||1"] {
        let err = h
            .service
            .mark_attendance(token, &Claimant::new("S1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "malformed_token", "token {token:?}");
    }

    assert_eq!(h.anchor.calls().len(), before);
    assert_eq!(h.content.publish_count(), 0);
}

#[tokio::test]
async fn test_publish_failure_still_records() {
    let h = common::start().await;
    let class = h.service.create_class("Networks", "C1", "T1").await.unwrap();
    let session = h.service.issue_session(&class.id, "T1").await.unwrap();
    h.content.set_behavior(FakeBehavior::Fail);

    let outcome = h
        .service
        .mark_attendance(&session.secret_token, &Claimant::new("S1"))
        .await
        .unwrap();

    let AttendanceOutcome::Recorded(receipt) = outcome else {
        panic!("expected a recorded outcome");
    };
    assert!(receipt.content_address.is_none());
    let record = h.store.find_record("S1", &session.id).await.unwrap().unwrap();
    assert!(record.content_address_id.is_none());
}

#[tokio::test]
async fn test_remote_invalid_writes_nothing() {
    let h = common::start().await;
    let class = h.service.create_class("Networks", "C1", "T1").await.unwrap();
    let session = h.service.issue_session(&class.id, "T1").await.unwrap();
    h.anchor.on_validity(FakeBehavior::Refuse);

    let err = h
        .service
        .mark_attendance(&session.secret_token, &Claimant::new("S1"))
        .await
        .unwrap_err();

    assert!(matches!(err, CheckinError::RemoteSessionInvalid { .. }));
    assert!(!err.is_retryable());
    assert_eq!(h.store.block_count().await.unwrap(), 0);
    assert!(h.store.record_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_issuance_fails_closed_when_anchor_unavailable() {
    let h = common::start().await;
    let class = h.service.create_class("Networks", "C1", "T1").await.unwrap();
    h.anchor.on_create(FakeBehavior::Fail);

    let err = h.service.issue_session(&class.id, "T1").await.unwrap_err();
    let CheckinError::ExternalAnchor { session_id, .. } = err else {
        panic!("expected ExternalAnchor, got {err:?}");
    };

    // The persisted session was flipped inactive, so its token is dead
    let token = format!("{}|{}|0", class.id, session_id);
    let err = h
        .service
        .mark_attendance(&token, &Claimant::new("S1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckinError::UnknownOrInactiveSession { .. }));
}
