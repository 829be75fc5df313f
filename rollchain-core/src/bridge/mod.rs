//! External bridge contracts - trust anchor and content-addressed store
//!
//! The core never assumes a transport. Implementations:
//! - `local`: in-process anchor and content store
//! - `process`: out-of-process trust-anchor runner (`<cmd> <action> <json>`)
//! - `ipfs`: HTTP content store (feature `ipfs`)
//! - `fake`: scriptable doubles for tests
//!
//! Every call made by the core goes through [`with_timeout`]; a timeout is
//! just another [`BridgeError`] and follows the same fatal/non-fatal policy
//! as an explicit failure.

pub mod fake;
pub mod ipfs;
pub mod local;
pub mod process;

pub use local::{LocalContentStore, LocalTrustAnchor};
pub use process::ProcessTrustAnchor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::{ContentStoreBackend, ContentStoreConfig};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{bridge} is unavailable: {reason}")]
    Unavailable { bridge: &'static str, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{operation} was rejected: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("{operation} returned an unreadable response: {reason}")]
    Protocol { operation: String, reason: String },
}

/// Reply to `createRemoteSession` and `recordAttendance`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReceipt {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// Reply to `isRemoteSessionValid`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionValidity {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub is_valid: bool,
}

/// External trust-anchoring ledger
#[async_trait]
pub trait TrustAnchor: Send + Sync {
    async fn create_remote_session(
        &self,
        session_id: &str,
        class_id: &str,
        ttl_minutes: i64,
    ) -> Result<AnchorReceipt, BridgeError>;

    async fn is_remote_session_valid(&self, session_id: &str)
        -> Result<SessionValidity, BridgeError>;

    async fn record_attendance(
        &self,
        session_id: &str,
        claimant_id: &str,
        class_id: &str,
    ) -> Result<AnchorReceipt, BridgeError>;

    async fn has_attended(&self, session_id: &str, claimant_id: &str) -> Result<bool, BridgeError>;

    /// Bridge identifier for logging
    fn name(&self) -> &'static str;
}

/// Content-addressed blob store
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Publish a JSON blob; `Ok(None)` when the store accepted nothing usable
    async fn publish(&self, blob: &Value) -> Result<Option<String>, BridgeError>;

    async fn fetch(&self, address: &str) -> Result<Option<Value>, BridgeError>;

    fn name(&self) -> &'static str;
}

/// Run a bridge call with an upper time bound
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, call: F) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout {
            operation: operation.to_string(),
            after: limit,
        }),
    }
}

/// Build the configured content store; `None` when publishing is disabled
pub fn content_store_from_config(
    config: &ContentStoreConfig,
    timeout: Duration,
) -> anyhow::Result<Option<Arc<dyn ContentStore>>> {
    match config.backend {
        ContentStoreBackend::Disabled => {
            info!("Content store disabled");
            Ok(None)
        }
        ContentStoreBackend::Local => Ok(Some(Arc::new(LocalContentStore::new()))),
        ContentStoreBackend::Ipfs => {
            #[cfg(feature = "ipfs")]
            {
                info!("Using IPFS content store at {}", config.api_url);
                Ok(Some(Arc::new(ipfs::IpfsContentStore::new(
                    &config.api_url,
                    &config.gateway_url,
                    timeout,
                )?)))
            }

            #[cfg(not(feature = "ipfs"))]
            {
                let _ = timeout;
                tracing::warn!(
                    "Content store backend 'ipfs' is configured but the 'ipfs' feature is not compiled in"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed_to_timeout() {
        let result: Result<(), BridgeError> = with_timeout(
            Duration::from_millis(10),
            "isRemoteSessionValid",
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(BridgeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout(Duration::from_secs(1), "publish", async {
            Ok::<_, BridgeError>(Some("cid".to_string()))
        })
        .await
        .unwrap();
        assert_eq!(result.as_deref(), Some("cid"));
    }

    #[test]
    fn test_receipt_parses_runner_json() {
        let raw = r#"{"success": true, "txHash": "0xabc", "blockNumber": 12}"#;
        let receipt: AnchorReceipt = serde_json::from_str(raw).unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.tx_hash.as_deref(), Some("0xabc"));

        let raw = r#"{"success": true, "sessionCode": "s", "isValid": false}"#;
        let validity: SessionValidity = serde_json::from_str(raw).unwrap();
        assert!(validity.success);
        assert!(!validity.is_valid);
    }

    #[test]
    fn test_disabled_content_store_builds_none() {
        let config = ContentStoreConfig {
            backend: ContentStoreBackend::Disabled,
            ..Default::default()
        };
        assert!(content_store_from_config(&config, Duration::from_secs(1))
            .unwrap()
            .is_none());
    }
}
