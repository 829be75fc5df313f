//! Optimistic, linearizable ledger append
//!
//! Each attempt reads the tail, builds block `tail + 1` linked to the tail's
//! hash, and hands it to the store's insert-if-absent. Losing the race means
//! some other writer now owns that number: re-read and try again after an
//! exponential, jittered backoff. No lock is held between attempts.

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::hasher::block_hash;
use super::LedgerError;
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::model::{LedgerBlock, GENESIS_PREVIOUS_HASH};
use crate::store::{BlockInsert, LedgerStore};

/// Sole writer of block numbers and hashes
#[derive(Clone)]
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn LedgerStore>,
        config: LedgerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Append `payload` as the next block in the chain
    pub async fn append(&self, payload: Value) -> Result<LedgerBlock, LedgerError> {
        let max_attempts = self.config.max_append_attempts.max(1);

        for attempt in 1..=max_attempts {
            let tail = self.store.tail().await?;
            let candidate = self.next_block(tail.as_ref(), &payload);
            let block_number = candidate.block_number;

            match self.store.insert_block(candidate.clone()).await? {
                BlockInsert::Inserted => {
                    debug!(
                        block_number,
                        attempt,
                        hash = %candidate.hash,
                        "Ledger block appended"
                    );
                    return Ok(candidate);
                }
                BlockInsert::Conflict => {
                    debug!(block_number, attempt, "Ledger append lost the race, retrying");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        warn!(
            attempts = max_attempts,
            "Ledger append exhausted its retry budget under contention"
        );
        Err(LedgerError::Contention {
            attempts: max_attempts,
        })
    }

    /// Serialize an event and append it
    pub async fn append_event<T: Serialize>(&self, event: &T) -> Result<LedgerBlock, LedgerError> {
        let payload =
            serde_json::to_value(event).map_err(|source| LedgerError::Payload { source })?;
        self.append(payload).await
    }

    fn next_block(&self, tail: Option<&LedgerBlock>, payload: &Value) -> LedgerBlock {
        let (block_number, previous_hash) = match tail {
            Some(tail) => (tail.block_number + 1, tail.hash.clone()),
            None => (1, GENESIS_PREVIOUS_HASH.to_string()),
        };

        LedgerBlock {
            id: uuid::Uuid::new_v4().to_string(),
            block_number,
            hash: block_hash(payload, &previous_hash),
            previous_hash,
            payload: payload.clone(),
            created_at: self.clock.now(),
            nonce: rand::thread_rng().gen_range(0..1_000_000),
        }
    }

    /// Full-jitter exponential backoff: uniform in `[d/2, d]`, `d = base * 2^(attempt-1)`
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << (attempt - 1).min(20))
            .min(self.config.backoff_max_ms)
            .max(1);
        let jittered = rand::thread_rng().gen_range(exp / 2..=exp);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::verify_chain;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use serde_json::json;

    /// Store where every block number is always already taken
    struct AlwaysTaken;

    #[async_trait]
    impl LedgerStore for AlwaysTaken {
        async fn tail(&self) -> Result<Option<LedgerBlock>, StoreError> {
            Ok(None)
        }

        async fn insert_block(&self, _block: LedgerBlock) -> Result<BlockInsert, StoreError> {
            Ok(BlockInsert::Conflict)
        }

        async fn blocks_from(
            &self,
            _from: u64,
            _limit: usize,
        ) -> Result<Vec<LedgerBlock>, StoreError> {
            Ok(vec![])
        }

        async fn block_count(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn fast_config(attempts: u32) -> LedgerConfig {
        LedgerConfig {
            max_append_attempts: attempts,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
        }
    }

    #[tokio::test]
    async fn test_first_block_links_to_genesis() {
        let engine = LedgerEngine::new(Arc::new(MemoryStore::new()), fast_config(3));
        let block = engine.append(json!({"action": "attendance_marked"})).await.unwrap();

        assert_eq!(block.block_number, 1);
        assert_eq!(block.previous_hash, "0");
        assert_eq!(block.hash, block_hash(&block.payload, "0"));
        assert!(block.nonce < 1_000_000);
    }

    #[tokio::test]
    async fn test_sequential_appends_link_hashes() {
        let store = Arc::new(MemoryStore::new());
        let engine = LedgerEngine::new(store.clone(), fast_config(3));

        let first = engine.append(json!({"n": 1})).await.unwrap();
        let second = engine.append(json!({"n": 2})).await.unwrap();

        assert_eq!(second.block_number, 2);
        assert_eq!(second.previous_hash, first.hash);

        let report = verify_chain(store.as_ref()).await.unwrap();
        assert!(report.is_valid());
        assert_eq!(report.blocks_checked, 2);
    }

    #[tokio::test]
    async fn test_contention_is_bounded() {
        let engine = LedgerEngine::new(Arc::new(AlwaysTaken), fast_config(4));
        let err = engine.append(json!({})).await.unwrap_err();
        assert!(matches!(err, LedgerError::Contention { attempts: 4 }));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = LedgerEngine::new(store, fast_config(0));
        assert!(engine.append(json!({})).await.is_ok());
    }

    #[test]
    fn test_backoff_stays_within_cap() {
        let engine = LedgerEngine::new(Arc::new(AlwaysTaken), LedgerConfig::default());
        for attempt in 1..=30 {
            let delay = engine.backoff(attempt);
            assert!(delay <= Duration::from_millis(640));
        }
    }
}
