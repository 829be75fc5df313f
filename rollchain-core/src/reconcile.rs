//! Startup integrity reconciliation
//!
//! Runs before the pipeline accepts claims. Attendance duplicates on
//! `(student_id, session_id)` are collapsed to their earliest member and the
//! compound unique index is installed. Single-field identity indexes are
//! promoted to unique, refusing to start when existing data would violate
//! them.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{Collection, IndexAdmin, IndexSpec, StoreError};

/// Fields whose pair identifies one attendance claim
pub const ATTENDANCE_KEY: [&str; 2] = ["student_id", "session_id"];

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Cannot make {collection}.{field} unique: duplicate values exist (e.g. {example})")]
    DuplicateValues {
        collection: Collection,
        field: String,
        example: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts from one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub duplicate_groups: usize,
    pub deleted: usize,
    pub unique_indexes: Vec<String>,
}

/// Collapse duplicate attendance claims and install the compound unique index
pub async fn reconcile_attendance(
    admin: &dyn IndexAdmin,
) -> Result<ReconcileReport, ReconcileError> {
    let fields: Vec<String> = ATTENDANCE_KEY.iter().map(|f| f.to_string()).collect();
    info!("Checking attendance for duplicate (student_id, session_id) pairs");

    let groups = admin.duplicate_groups(Collection::Attendance, &fields).await?;
    let mut doomed = Vec::new();
    for group in &groups {
        let Some((keep, rest)) = group.members.split_first() else {
            continue;
        };
        info!(
            "Duplicate group {:?}: keep {}, delete {}",
            group.key,
            keep.id,
            rest.len()
        );
        doomed.extend(rest.iter().map(|m| m.id.clone()));
    }

    let deleted = if doomed.is_empty() {
        debug!("No duplicate attendance records found");
        0
    } else {
        let n = admin.delete_many(Collection::Attendance, &doomed).await?;
        warn!("Deleted {} duplicate attendance records", n);
        n
    };

    // Duplicates are gone, so a plain compound index can be replaced
    for stale in admin
        .indexes(Collection::Attendance)
        .await?
        .into_iter()
        .filter(|s| !s.unique && s.covers(&ATTENDANCE_KEY))
    {
        debug!("Dropping non-unique attendance index {}", stale.name);
        admin.drop_index(Collection::Attendance, &stale.name).await?;
    }

    let spec = IndexSpec::unique(&ATTENDANCE_KEY);
    let name = spec.name.clone();
    admin
        .create_index(Collection::Attendance, spec)
        .await
        .map_err(|e| duplicate_or_store(e, Collection::Attendance, &name))?;
    info!("Unique index {} installed on attendance", name);

    Ok(ReconcileReport {
        duplicate_groups: groups.len(),
        deleted,
        unique_indexes: vec![format!("{}.{}", Collection::Attendance, name)],
    })
}

/// Make sure `collection.field` carries a unique index
///
/// An existing non-unique index is only upgraded when no duplicate values
/// exist; otherwise this fails rather than dropping data.
pub async fn ensure_unique_index(
    admin: &dyn IndexAdmin,
    collection: Collection,
    field: &str,
) -> Result<(), ReconcileError> {
    let existing = admin
        .indexes(collection)
        .await?
        .into_iter()
        .find(|spec| spec.covers(&[field]));

    match existing {
        Some(spec) if spec.unique => {
            debug!("{}.{} index already unique ({})", collection, field, spec.name);
            return Ok(());
        }
        Some(spec) => {
            let groups = admin
                .duplicate_groups(collection, &[field.to_string()])
                .await?;
            if let Some(group) = groups.first() {
                return Err(ReconcileError::DuplicateValues {
                    collection,
                    field: field.to_string(),
                    example: group.key.join("|"),
                });
            }
            info!(
                "Dropping non-unique index {} on {}.{} to recreate as unique",
                spec.name, collection, field
            );
            admin.drop_index(collection, &spec.name).await?;
        }
        None => {}
    }

    admin
        .create_index(collection, IndexSpec::unique(&[field]))
        .await
        .map_err(|e| duplicate_or_store(e, collection, field))?;
    info!("Unique index created on {}.{}", collection, field);
    Ok(())
}

/// Full startup routine; any error must halt initialization
pub async fn run_startup(admin: &dyn IndexAdmin) -> Result<ReconcileReport, ReconcileError> {
    let identity = [
        (Collection::Sessions, "id"),
        (Collection::Classes, "id"),
        (Collection::LedgerBlocks, "block_number"),
        (Collection::Attendance, "id"),
    ];
    let mut unique_indexes = Vec::new();
    for (collection, field) in identity {
        ensure_unique_index(admin, collection, field).await?;
        unique_indexes.push(format!("{collection}.{field}"));
    }

    for (collection, field) in [
        (Collection::Classes, "teacher_id"),
        (Collection::Attendance, "student_id"),
        (Collection::Attendance, "class_id"),
    ] {
        admin
            .create_index(collection, IndexSpec::new(&[field], false))
            .await?;
    }

    let mut report = reconcile_attendance(admin).await?;
    unique_indexes.append(&mut report.unique_indexes);
    report.unique_indexes = unique_indexes;

    info!(
        "Reconciliation complete: {} duplicate groups, {} records deleted",
        report.duplicate_groups, report.deleted
    );
    Ok(report)
}

fn duplicate_or_store(err: StoreError, collection: Collection, field: &str) -> ReconcileError {
    match err {
        StoreError::DuplicateKey { key, .. } => ReconcileError::DuplicateValues {
            collection,
            field: field.to_string(),
            example: key,
        },
        other => ReconcileError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttendanceRecord, ClassRecord};
    use crate::store::{AttendanceStore, ClassStore, MemoryStore};
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    fn record(id: &str, student: &str, session: &str, offset_secs: i64) -> AttendanceRecord {
        AttendanceRecord {
            id: id.to_string(),
            student_id: student.to_string(),
            class_id: "C1".to_string(),
            session_id: session.to_string(),
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            verified: true,
            blockchain_hash: format!("hash-{id}"),
            external_anchor_tx: None,
            content_address_id: None,
        }
    }

    fn class(id: &str, code: &str) -> ClassRecord {
        ClassRecord {
            id: id.to_string(),
            name: "Algorithms".to_string(),
            code: code.to_string(),
            teacher_id: "T1".to_string(),
            students_enrolled: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicates_collapse_to_earliest() {
        let store = MemoryStore::new();
        store.insert_record(record("late", "S1", "x", 20)).await.unwrap();
        store.insert_record(record("early", "S1", "x", 0)).await.unwrap();
        store.insert_record(record("mid", "S1", "x", 10)).await.unwrap();
        store.insert_record(record("other", "S2", "x", 5)).await.unwrap();

        let report = reconcile_attendance(&store).await.unwrap();
        assert_eq!(report.duplicate_groups, 1);
        assert_eq!(report.deleted, 2);

        let kept = store.find_record("S1", "x").await.unwrap().unwrap();
        assert_eq!(kept.id, "early");
        assert_eq!(store.record_ids().await.unwrap().len(), 2);

        // The index now rejects a fresh duplicate
        assert!(matches!(
            store.insert_record(record("again", "S1", "x", 30)).await,
            Err(StoreError::DuplicateKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = MemoryStore::new();
        store.insert_record(record("a", "S1", "x", 0)).await.unwrap();

        let first = run_startup(&store).await.unwrap();
        let second = run_startup(&store).await.unwrap();
        assert_eq!(first.deleted, 0);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_non_unique_index_upgraded_when_clean() {
        let store = MemoryStore::new();
        store
            .create_index(Collection::Classes, IndexSpec::new(&["code"], false))
            .await
            .unwrap();
        store.insert_class(class("C1", "CS-1")).await.unwrap();
        store.insert_class(class("C2", "CS-2")).await.unwrap();

        ensure_unique_index(&store, Collection::Classes, "code").await.unwrap();

        let specs = store.indexes(Collection::Classes).await.unwrap();
        let code = specs.iter().find(|s| s.covers(&["code"])).unwrap();
        assert!(code.unique);
    }

    #[tokio::test]
    async fn test_non_unique_index_with_duplicates_is_fatal() {
        let store = MemoryStore::new();
        store
            .create_index(Collection::Classes, IndexSpec::new(&["code"], false))
            .await
            .unwrap();
        store.insert_class(class("C1", "CS-1")).await.unwrap();
        store.insert_class(class("C2", "CS-1")).await.unwrap();

        let err = ensure_unique_index(&store, Collection::Classes, "code")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::DuplicateValues { .. }));

        // Nothing was dropped
        let specs = store.indexes(Collection::Classes).await.unwrap();
        assert!(specs.iter().any(|s| s.covers(&["code"]) && !s.unique));
    }
}
