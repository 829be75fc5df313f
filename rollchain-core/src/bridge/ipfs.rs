//! IPFS content store over the HTTP API
//!
//! Publishing posts the canonical JSON to `/api/v0/add?pin=true`; fetching
//! reads `/ipfs/<cid>` from the configured gateway.

use serde_json::Value;

/// Extract the CID from an `ipfs add` response
///
/// The API answers with NDJSON; older nodes report `{"Hash": "Qm.."}`,
/// newer ones `{"Cid": {"/": "bafy.."}}` or `{"Cid": "bafy.."}`. The last
/// line carrying an identifier wins.
pub fn parse_add_response(body: &str) -> Option<String> {
    let mut cid = None;
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(hash) = obj.get("Hash").and_then(|h| h.as_str()).filter(|h| !h.is_empty()) {
            cid = Some(hash.to_string());
        } else if let Some(value) = obj.get("Cid") {
            let found = match value {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => map.get("/").and_then(|v| v.as_str()).map(str::to_string),
                _ => None,
            };
            if found.is_some() {
                cid = found;
            }
        }
    }
    cid
}

#[cfg(feature = "ipfs")]
pub use client::IpfsContentStore;

#[cfg(feature = "ipfs")]
mod client {
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;
    use tracing::{debug, info, warn};

    use super::parse_add_response;
    use crate::bridge::{BridgeError, ContentStore};
    use crate::ledger::hasher::canonical_serialize;

    const BRIDGE: &str = "ipfs";

    pub struct IpfsContentStore {
        client: reqwest::Client,
        api_url: String,
        gateway_url: String,
    }

    impl IpfsContentStore {
        pub fn new(api_url: &str, gateway_url: &str, timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to create HTTP client")?;

            Ok(Self {
                client,
                api_url: api_url.trim_end_matches('/').to_string(),
                gateway_url: gateway_url.trim_end_matches('/').to_string(),
            })
        }

        fn unavailable(e: reqwest::Error) -> BridgeError {
            BridgeError::Unavailable {
                bridge: BRIDGE,
                reason: e.to_string(),
            }
        }
    }

    #[async_trait]
    impl ContentStore for IpfsContentStore {
        async fn publish(&self, blob: &Value) -> Result<Option<String>, BridgeError> {
            let bytes = canonical_serialize(blob).into_bytes();
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name("data.json")
                .mime_str("application/json")
                .map_err(Self::unavailable)?;
            let form = reqwest::multipart::Form::new().part("file", part);

            let response = self
                .client
                .post(format!("{}/api/v0/add?pin=true", self.api_url))
                .multipart(form)
                .send()
                .await
                .map_err(Self::unavailable)?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!("IPFS add failed: {} - {}", status, body);
                return Err(BridgeError::Rejected {
                    operation: "publish".to_string(),
                    reason: format!("{status}: {body}"),
                });
            }

            let body = response.text().await.map_err(Self::unavailable)?;
            let cid = parse_add_response(&body);
            match &cid {
                Some(cid) => info!("Published blob to IPFS -> {}", cid),
                None => warn!("Could not parse CID from ipfs add response: {}", body),
            }
            Ok(cid)
        }

        async fn fetch(&self, address: &str) -> Result<Option<Value>, BridgeError> {
            if address.is_empty() {
                return Ok(None);
            }
            let url = format!("{}/ipfs/{}", self.gateway_url, address);
            let response = self.client.get(&url).send().await.map_err(Self::unavailable)?;

            if !response.status().is_success() {
                debug!("Gateway {} returned status {}", url, response.status());
                return Ok(None);
            }

            let body = response.text().await.map_err(Self::unavailable)?;
            serde_json::from_str(body.trim())
                .map(Some)
                .map_err(|e| BridgeError::Protocol {
                    operation: "fetch".to_string(),
                    reason: e.to_string(),
                })
        }

        fn name(&self) -> &'static str {
            BRIDGE
        }
    }
}
