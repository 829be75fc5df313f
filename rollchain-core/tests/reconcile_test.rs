//! Startup reconciliation against pre-existing data

mod common;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use rollchain_core::model::{AttendanceRecord, ClassRecord};
use rollchain_core::store::{
    AttendanceStore, ClassStore, Collection, IndexAdmin, IndexSpec, MemoryStore,
};
use rollchain_core::bridge::LocalTrustAnchor;
use rollchain_core::clock::SystemClock;
use rollchain_core::{CheckinConfig, CheckinError, CheckinService};
use std::sync::Arc;

fn record(id: &str, student: &str, session: &str, at: chrono::DateTime<Utc>) -> AttendanceRecord {
    AttendanceRecord {
        id: id.to_string(),
        student_id: student.to_string(),
        class_id: "C1".to_string(),
        session_id: session.to_string(),
        timestamp: at,
        verified: true,
        blockchain_hash: format!("hash-{id}"),
        external_anchor_tx: None,
        content_address_id: None,
    }
}

#[tokio::test]
async fn test_three_duplicates_collapse_to_earliest() {
    common::init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let t0 = Utc::now();
    store.insert_record(record("r2", "S1", "sessionX", t0 + Duration::seconds(2))).await.unwrap();
    store.insert_record(record("r0", "S1", "sessionX", t0)).await.unwrap();
    store.insert_record(record("r1", "S1", "sessionX", t0 + Duration::seconds(1))).await.unwrap();

    let h = common::start_with_store(store.clone(), common::test_config()).await;

    let report = h.service.startup_report();
    assert_eq!(report.duplicate_groups, 1);
    assert_eq!(report.deleted, 2);
    assert_eq!(store.record_ids().await.unwrap(), vec!["r0".to_string()]);

    let specs = store.indexes(Collection::Attendance).await.unwrap();
    assert!(specs
        .iter()
        .any(|s| s.unique && s.covers(&["student_id", "session_id"])));
}

#[tokio::test]
async fn test_plain_indexes_upgraded_at_startup() {
    let store = Arc::new(MemoryStore::new());
    store
        .create_index(Collection::Classes, IndexSpec::new(&["id"], false))
        .await
        .unwrap();
    store
        .create_index(
            Collection::Attendance,
            IndexSpec::new(&["student_id", "session_id"], false),
        )
        .await
        .unwrap();
    store
        .insert_class(ClassRecord {
            id: "C1".to_string(),
            name: "Algorithms".to_string(),
            code: "CS-1".to_string(),
            teacher_id: "T1".to_string(),
            students_enrolled: Default::default(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let t0 = Utc::now();
    store.insert_record(record("a", "S1", "x", t0)).await.unwrap();
    store.insert_record(record("b", "S1", "x", t0 + Duration::seconds(1))).await.unwrap();

    let h = common::start_with_store(store.clone(), CheckinConfig::default()).await;
    assert_eq!(h.service.startup_report().deleted, 1);

    let classes = store.indexes(Collection::Classes).await.unwrap();
    assert!(classes.iter().any(|s| s.unique && s.covers(&["id"])));
    let attendance = store.indexes(Collection::Attendance).await.unwrap();
    assert!(attendance
        .iter()
        .filter(|s| s.covers(&["student_id", "session_id"]))
        .all(|s| s.unique));
}

#[tokio::test]
async fn test_reconcile_failure_halts_startup() {
    let store = Arc::new(MemoryStore::new());
    // Same name as the compound index but a different shape
    store
        .create_index(
            Collection::Attendance,
            IndexSpec {
                name: "student_id_session_id".to_string(),
                fields: vec!["student_id".to_string()],
                unique: false,
            },
        )
        .await
        .unwrap();

    let result = CheckinService::start(
        CheckinConfig::default(),
        store,
        Arc::new(LocalTrustAnchor::new()),
        None,
        Arc::new(SystemClock),
    )
    .await;
    assert!(matches!(result, Err(CheckinError::Reconcile(_))));
}
