//! Check-in service facade
//!
//! Owns every piece of state the operations need (store handles, bridges,
//! clock, configuration) as explicit fields. Nothing is process-wide, so two
//! services in one process are fully isolated.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::bridge::{with_timeout, BridgeError, ContentStore, TrustAnchor};
use crate::clock::Clock;
use crate::config::CheckinConfig;
use crate::error::CheckinError;
use crate::ledger::{self, ChainReport, LedgerEngine};
use crate::model::{AttendanceRecord, Claimant, ClassRecord, LedgerBlock, Session};
use crate::pipeline::{AttendanceOutcome, AttendancePipeline};
use crate::reconcile::{self, ReconcileReport};
use crate::session::{SessionManager, SessionToken};
use crate::store::{AttendanceStore, CheckinStore, ClassStore, LedgerStore, StoreError};

/// Whether a claimant is on record for a session, locally and remotely
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceStatus {
    pub session_id: String,
    pub student_id: String,
    /// Block hash of the stored record, if any
    pub block_hash: Option<String>,
    /// Trust anchor's answer; `None` when it could not be reached
    pub anchored: Option<bool>,
}

impl AttendanceStatus {
    pub fn is_recorded(&self) -> bool {
        self.block_hash.is_some()
    }
}

pub struct CheckinService {
    config: CheckinConfig,
    classes: Arc<dyn ClassStore>,
    attendance: Arc<dyn AttendanceStore>,
    blocks: Arc<dyn LedgerStore>,
    content: Option<Arc<dyn ContentStore>>,
    anchor: Arc<dyn TrustAnchor>,
    clock: Arc<dyn Clock>,
    sessions: SessionManager,
    pipeline: AttendancePipeline,
    startup: ReconcileReport,
}

impl CheckinService {
    /// Reconcile the store, then build a service ready for claims
    ///
    /// Fails without serving anything if reconciliation fails.
    pub async fn start<S>(
        config: CheckinConfig,
        store: Arc<S>,
        anchor: Arc<dyn TrustAnchor>,
        content: Option<Arc<dyn ContentStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CheckinError>
    where
        S: CheckinStore + 'static,
    {
        let startup = reconcile::run_startup(store.as_ref()).await.map_err(|e| {
            let err = CheckinError::from(e);
            err.log_if_integrity_critical();
            err
        })?;

        let timeout = config.bridges.timeout();
        let sessions = SessionManager::new(store.clone(), anchor.clone(), clock.clone(), timeout);
        let ledger = LedgerEngine::with_clock(store.clone(), config.ledger.clone(), clock.clone());
        let pipeline = AttendancePipeline::new(
            sessions.clone(),
            store.clone(),
            store.clone(),
            ledger,
            anchor.clone(),
            content.clone(),
            clock.clone(),
            timeout,
        );

        info!(
            "Check-in service started (anchor: {}, content store: {})",
            anchor.name(),
            content.as_ref().map(|c| c.name()).unwrap_or("disabled")
        );

        Ok(Self {
            config,
            classes: store.clone(),
            attendance: store.clone(),
            blocks: store,
            content,
            anchor,
            clock,
            sessions,
            pipeline,
            startup,
        })
    }

    pub fn config(&self) -> &CheckinConfig {
        &self.config
    }

    /// What reconciliation did when the service started
    pub fn startup_report(&self) -> &ReconcileReport {
        &self.startup
    }

    pub async fn create_class(
        &self,
        name: &str,
        code: &str,
        teacher_id: &str,
    ) -> Result<ClassRecord, CheckinError> {
        let class = ClassRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            code: code.to_string(),
            teacher_id: teacher_id.to_string(),
            students_enrolled: Default::default(),
            created_at: self.clock.now(),
        };
        self.classes.insert_class(class.clone()).await?;
        info!("Created class {} ({})", class.id, class.code);
        Ok(class)
    }

    pub async fn get_class(&self, class_id: &str) -> Result<ClassRecord, CheckinError> {
        self.classes
            .get_class(class_id)
            .await?
            .ok_or_else(|| CheckinError::UnknownClass {
                class_id: class_id.to_string(),
            })
    }

    /// Add a student to a class; `Ok(false)` when already enrolled
    pub async fn enroll(&self, class_id: &str, student_id: &str) -> Result<bool, CheckinError> {
        self.get_class(class_id).await?;
        Ok(self.classes.enroll(class_id, student_id).await?)
    }

    /// Classes owned by `teacher_id`
    pub async fn classes_for_teacher(
        &self,
        teacher_id: &str,
    ) -> Result<Vec<ClassRecord>, CheckinError> {
        Ok(self.classes.classes_for_teacher(teacher_id).await?)
    }

    /// Classes `student_id` is enrolled in
    pub async fn classes_for_student(
        &self,
        student_id: &str,
    ) -> Result<Vec<ClassRecord>, CheckinError> {
        Ok(self.classes.classes_for_student(student_id).await?)
    }

    /// Enrolled student ids of a class
    pub async fn class_roster(&self, class_id: &str) -> Result<BTreeSet<String>, CheckinError> {
        Ok(self.get_class(class_id).await?.students_enrolled)
    }

    /// Issue a session for an existing class with the configured lifetime
    pub async fn issue_session(
        &self,
        class_id: &str,
        issuer_id: &str,
    ) -> Result<Session, CheckinError> {
        self.get_class(class_id).await?;
        self.sessions
            .issue(class_id, issuer_id, self.config.session.ttl())
            .await
    }

    pub async fn mark_attendance(
        &self,
        secret_token: &str,
        claimant: &Claimant,
    ) -> Result<AttendanceOutcome, CheckinError> {
        self.pipeline.mark_attendance(secret_token, claimant).await
    }

    /// Check a token's shape without looking anything up
    pub fn validate_token_format(&self, secret_token: &str) -> Result<SessionToken, CheckinError> {
        self.sessions.parse(secret_token)
    }

    /// Look a claim up in the record store and on the trust anchor
    ///
    /// An unreachable anchor leaves `anchored` empty instead of failing.
    pub async fn attendance_status(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<AttendanceStatus, CheckinError> {
        let record = self.attendance.find_record(student_id, session_id).await?;
        let anchored = match with_timeout(
            self.config.bridges.timeout(),
            "hasAttended",
            self.anchor.has_attended(session_id, student_id),
        )
        .await
        {
            Ok(attended) => Some(attended),
            Err(e) => {
                warn!("{} could not answer hasAttended: {}", self.anchor.name(), e);
                None
            }
        };

        Ok(AttendanceStatus {
            session_id: session_id.to_string(),
            student_id: student_id.to_string(),
            block_hash: record.map(|r| r.blockchain_hash),
            anchored,
        })
    }

    pub async fn attendance_for_student(
        &self,
        student_id: &str,
    ) -> Result<Vec<AttendanceRecord>, CheckinError> {
        Ok(self.attendance.records_for_student(student_id).await?)
    }

    pub async fn attendance_for_class(
        &self,
        class_id: &str,
    ) -> Result<Vec<AttendanceRecord>, CheckinError> {
        self.get_class(class_id).await?;
        Ok(self.attendance.records_for_class(class_id).await?)
    }

    /// Retrieve a published blob; `Ok(None)` when publishing is disabled
    pub async fn fetch_content(&self, address: &str) -> Result<Option<Value>, BridgeError> {
        match &self.content {
            Some(store) => {
                with_timeout(self.config.bridges.timeout(), "fetch", store.fetch(address)).await
            }
            None => Ok(None),
        }
    }

    pub async fn ledger_blocks(
        &self,
        from: u64,
        limit: usize,
    ) -> Result<Vec<LedgerBlock>, StoreError> {
        self.blocks.blocks_from(from, limit).await
    }

    pub async fn verify_chain(&self) -> Result<ChainReport, StoreError> {
        ledger::verify_chain(self.blocks.as_ref()).await
    }

    pub async fn orphaned_blocks(&self) -> Result<Vec<LedgerBlock>, StoreError> {
        ledger::orphaned_blocks(self.blocks.as_ref(), self.attendance.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{LocalContentStore, LocalTrustAnchor};
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::Utc;

    async fn service() -> (CheckinService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = CheckinService::start(
            CheckinConfig::default(),
            store.clone(),
            Arc::new(LocalTrustAnchor::with_clock(clock.clone())),
            Some(Arc::new(LocalContentStore::new()) as Arc<dyn ContentStore>),
            clock,
        )
        .await
        .unwrap();
        (service, store)
    }

    #[tokio::test]
    async fn test_issue_requires_existing_class() {
        let (service, _) = service().await;
        assert!(matches!(
            service.issue_session("nope", "T1").await,
            Err(CheckinError::UnknownClass { .. })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_with_local_bridges() {
        let (service, _) = service().await;
        let class = service.create_class("Networks", "CS-330", "T1").await.unwrap();
        let session = service.issue_session(&class.id, "T1").await.unwrap();

        let token = service.validate_token_format(&session.secret_token).unwrap();
        assert_eq!(token.session_id, session.id);

        let outcome = service
            .mark_attendance(&session.secret_token, &Claimant::new("S1").with_name("Grace"))
            .await
            .unwrap();
        let AttendanceOutcome::Recorded(receipt) = outcome else {
            panic!("expected a recorded outcome");
        };

        let blob = service
            .fetch_content(receipt.content_address.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blob["student_name"], "Grace");
        assert_eq!(blob["class_name"], "Networks");

        assert_eq!(service.attendance_for_class(&class.id).await.unwrap().len(), 1);
        assert_eq!(service.attendance_for_student("S1").await.unwrap().len(), 1);
        assert!(service.verify_chain().await.unwrap().is_valid());
        assert!(service.orphaned_blocks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_class_listing_and_roster() {
        let (service, _) = service().await;
        let compilers = service.create_class("Compilers", "CS-440", "T1").await.unwrap();
        let networks = service.create_class("Networks", "CS-330", "T1").await.unwrap();
        let other = service.create_class("Databases", "CS-350", "T2").await.unwrap();
        service.enroll(&networks.id, "S1").await.unwrap();
        service.enroll(&networks.id, "S2").await.unwrap();
        service.enroll(&other.id, "S1").await.unwrap();

        let owned: BTreeSet<String> = service
            .classes_for_teacher("T1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(owned, BTreeSet::from([compilers.id.clone(), networks.id.clone()]));

        let enrolled = service.classes_for_student("S1").await.unwrap();
        assert_eq!(enrolled.len(), 2);
        assert!(!enrolled.iter().any(|c| c.id == compilers.id));

        let roster = service.class_roster(&networks.id).await.unwrap();
        assert_eq!(roster, BTreeSet::from(["S1".to_string(), "S2".to_string()]));
        assert!(service.class_roster(&compilers.id).await.unwrap().is_empty());
        assert!(matches!(
            service.class_roster("missing").await,
            Err(CheckinError::UnknownClass { .. })
        ));
    }

    #[tokio::test]
    async fn test_attendance_status_checks_store_and_anchor() {
        let (service, _) = service().await;
        let class = service.create_class("Networks", "CS-330", "T1").await.unwrap();
        let session = service.issue_session(&class.id, "T1").await.unwrap();

        let before = service.attendance_status(&session.id, "S1").await.unwrap();
        assert!(!before.is_recorded());
        assert_eq!(before.anchored, Some(false));

        let outcome = service
            .mark_attendance(&session.secret_token, &Claimant::new("S1"))
            .await
            .unwrap();

        let after = service.attendance_status(&session.id, "S1").await.unwrap();
        assert_eq!(after.block_hash.as_deref(), Some(outcome.block_hash()));
        assert_eq!(after.anchored, Some(true));
    }

    #[tokio::test]
    async fn test_enroll_is_set_add() {
        let (service, _) = service().await;
        let class = service.create_class("Compilers", "CS-440", "T1").await.unwrap();
        assert!(service.enroll(&class.id, "S1").await.unwrap());
        assert!(!service.enroll(&class.id, "S1").await.unwrap());
        assert!(matches!(
            service.enroll("missing", "S1").await,
            Err(CheckinError::UnknownClass { .. })
        ));
    }
}
