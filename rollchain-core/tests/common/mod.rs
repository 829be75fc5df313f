//! Shared helpers for rollchain-core integration tests

#![allow(dead_code)]

use chrono::Utc;
use rollchain_core::bridge::fake::{FakeBehavior, FakeContentStore, ScriptedTrustAnchor};
use rollchain_core::bridge::ContentStore;
use rollchain_core::clock::ManualClock;
use rollchain_core::config::LedgerConfig;
use rollchain_core::store::MemoryStore;
use rollchain_core::{CheckinConfig, CheckinService};
use std::sync::{Arc, Once};

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A service wired to in-memory state and scriptable bridges
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub anchor: Arc<ScriptedTrustAnchor>,
    pub content: Arc<FakeContentStore>,
    pub clock: Arc<ManualClock>,
    pub service: CheckinService,
}

pub fn test_config() -> CheckinConfig {
    let mut config = CheckinConfig::default();
    config.bridges.timeout_seconds = 1;
    config
}

/// Ledger settings that let dozens of writers contend without giving up
pub fn contended_ledger() -> LedgerConfig {
    LedgerConfig {
        max_append_attempts: 500,
        backoff_base_ms: 1,
        backoff_max_ms: 8,
    }
}

pub async fn start_with_store(store: Arc<MemoryStore>, config: CheckinConfig) -> Harness {
    let anchor = Arc::new(ScriptedTrustAnchor::new());
    let content = Arc::new(FakeContentStore::new(FakeBehavior::Succeed));
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let service = CheckinService::start(
        config,
        store.clone(),
        anchor.clone(),
        Some(content.clone() as Arc<dyn ContentStore>),
        clock.clone(),
    )
    .await
    .expect("service should start");

    Harness {
        store,
        anchor,
        content,
        clock,
        service,
    }
}

pub async fn start() -> Harness {
    start_with_store(Arc::new(MemoryStore::new()), test_config()).await
}
