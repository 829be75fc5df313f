//! Scriptable bridge doubles
//!
//! Each operation is driven by a [`FakeBehavior`] that tests can change
//! between calls, and every call is recorded so tests can assert which
//! external operations ran.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

use super::local::LocalContentStore;
use super::{AnchorReceipt, BridgeError, ContentStore, SessionValidity, TrustAnchor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Answer positively
    Succeed,
    /// Answer, but negatively (`success: false` / `isValid: false` / no address)
    Refuse,
    /// Return a bridge error
    Fail,
    /// Never answer; exercises the caller's timeout
    Hang,
}

fn lock<T: Copy>(slot: &Mutex<T>) -> T {
    *slot.lock().unwrap_or_else(|p| p.into_inner())
}

fn set<T>(slot: &Mutex<T>, value: T) {
    *slot.lock().unwrap_or_else(|p| p.into_inner()) = value;
}

fn failure(operation: &str) -> BridgeError {
    BridgeError::Unavailable {
        bridge: "fake",
        reason: format!("{operation} scripted to fail"),
    }
}

/// Trust anchor whose answers are scripted per operation
pub struct ScriptedTrustAnchor {
    create: Mutex<FakeBehavior>,
    validity: Mutex<FakeBehavior>,
    record: Mutex<FakeBehavior>,
    calls: Mutex<Vec<String>>,
}

impl Default for ScriptedTrustAnchor {
    fn default() -> Self {
        Self {
            create: Mutex::new(FakeBehavior::Succeed),
            validity: Mutex::new(FakeBehavior::Succeed),
            record: Mutex::new(FakeBehavior::Succeed),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedTrustAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(&self, behavior: FakeBehavior) {
        set(&self.create, behavior);
    }

    pub fn on_validity(&self, behavior: FakeBehavior) {
        set(&self.validity, behavior);
    }

    pub fn on_record(&self, behavior: FakeBehavior) {
        set(&self.record, behavior);
    }

    /// Operation names in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| *c == operation).count()
    }

    fn note(&self, operation: &str) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(operation.to_string());
    }

    async fn receipt(
        &self,
        operation: &str,
        behavior: FakeBehavior,
    ) -> Result<AnchorReceipt, BridgeError> {
        self.note(operation);
        match behavior {
            FakeBehavior::Succeed => Ok(AnchorReceipt {
                success: true,
                tx_hash: Some(format!("0xfake-{operation}")),
            }),
            FakeBehavior::Refuse => Ok(AnchorReceipt::default()),
            FakeBehavior::Fail => Err(failure(operation)),
            FakeBehavior::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl TrustAnchor for ScriptedTrustAnchor {
    async fn create_remote_session(
        &self,
        _session_id: &str,
        _class_id: &str,
        _ttl_minutes: i64,
    ) -> Result<AnchorReceipt, BridgeError> {
        self.receipt("createSession", lock(&self.create)).await
    }

    async fn is_remote_session_valid(
        &self,
        _session_id: &str,
    ) -> Result<SessionValidity, BridgeError> {
        self.note("isSessionValid");
        match lock(&self.validity) {
            FakeBehavior::Succeed => Ok(SessionValidity {
                success: true,
                is_valid: true,
            }),
            FakeBehavior::Refuse => Ok(SessionValidity {
                success: true,
                is_valid: false,
            }),
            FakeBehavior::Fail => Err(failure("isSessionValid")),
            FakeBehavior::Hang => std::future::pending().await,
        }
    }

    async fn record_attendance(
        &self,
        _session_id: &str,
        _claimant_id: &str,
        _class_id: &str,
    ) -> Result<AnchorReceipt, BridgeError> {
        self.receipt("markAttendance", lock(&self.record)).await
    }

    async fn has_attended(
        &self,
        _session_id: &str,
        _claimant_id: &str,
    ) -> Result<bool, BridgeError> {
        self.note("hasAttended");
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "scripted-anchor"
    }
}

/// Content store that can be told to fail, answer empty, or hang
pub struct FakeContentStore {
    behavior: Mutex<FakeBehavior>,
    inner: LocalContentStore,
    publishes: Mutex<usize>,
}

impl FakeContentStore {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            inner: LocalContentStore::new(),
            publishes: Mutex::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        set(&self.behavior, behavior);
    }

    pub fn publish_count(&self) -> usize {
        lock(&self.publishes)
    }
}

#[async_trait]
impl ContentStore for FakeContentStore {
    async fn publish(&self, blob: &Value) -> Result<Option<String>, BridgeError> {
        *self.publishes.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        match lock(&self.behavior) {
            FakeBehavior::Succeed => self.inner.publish(blob).await,
            FakeBehavior::Refuse => Ok(None),
            FakeBehavior::Fail => Err(failure("publish")),
            FakeBehavior::Hang => std::future::pending().await,
        }
    }

    async fn fetch(&self, address: &str) -> Result<Option<Value>, BridgeError> {
        match lock(&self.behavior) {
            FakeBehavior::Fail => Err(failure("fetch")),
            FakeBehavior::Hang => std::future::pending().await,
            _ => self.inner.fetch(address).await,
        }
    }

    fn name(&self) -> &'static str {
        "fake-content"
    }
}
