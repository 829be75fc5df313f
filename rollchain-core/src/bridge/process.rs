//! Out-of-process trust anchor
//!
//! Each call spawns the configured runner as
//! `<command> <args..> <action> <json payload>` and expects a single JSON
//! object on stdout. A non-zero exit, empty or non-JSON stdout, or running
//! past the timeout are all bridge failures.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AnchorReceipt, BridgeError, SessionValidity, TrustAnchor};

const BRIDGE: &str = "process-anchor";

pub struct ProcessTrustAnchor {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessTrustAnchor {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, action: &str, payload: Value) -> Result<Value, BridgeError> {
        debug!("Invoking anchor runner: {} {}", self.command, action);

        let child = Command::new(&self.command)
            .args(&self.args)
            .arg(action)
            .arg(payload.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Unavailable {
                bridge: BRIDGE,
                reason: format!("failed to spawn {}: {e}", self.command),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BridgeError::Timeout {
                operation: action.to_string(),
                after: self.timeout,
            })?
            .map_err(|e| BridgeError::Unavailable {
                bridge: BRIDGE,
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(
                "Anchor runner exited with code {} for {}. stderr: {}",
                exit_code,
                action,
                stderr.trim()
            );
            return Err(BridgeError::Rejected {
                operation: action.to_string(),
                reason: format!("runner exited with code {exit_code}: {}", stderr.trim()),
            });
        }
        if !stderr.trim().is_empty() {
            debug!("Anchor runner stderr (exit 0): {}", stderr.trim());
        }

        parse_runner_output(action, stdout.trim())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        payload: Value,
    ) -> Result<T, BridgeError> {
        let value = self.run(action, payload).await?;
        serde_json::from_value(value).map_err(|e| BridgeError::Protocol {
            operation: action.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Parse the runner's stdout; the last non-empty line must be a JSON object
pub fn parse_runner_output(action: &str, stdout: &str) -> Result<Value, BridgeError> {
    let protocol = |reason: String| BridgeError::Protocol {
        operation: action.to_string(),
        reason,
    };

    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| protocol("empty stdout".to_string()))?;

    let value: Value = serde_json::from_str(line).map_err(|e| protocol(e.to_string()))?;
    if !value.is_object() {
        return Err(protocol(format!("expected a JSON object, got {line}")));
    }
    if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
        return Err(BridgeError::Rejected {
            operation: action.to_string(),
            reason: error.to_string(),
        });
    }
    Ok(value)
}

#[async_trait]
impl TrustAnchor for ProcessTrustAnchor {
    async fn create_remote_session(
        &self,
        session_id: &str,
        class_id: &str,
        ttl_minutes: i64,
    ) -> Result<AnchorReceipt, BridgeError> {
        self.call(
            "createSession",
            json!({"sessionCode": session_id, "classId": class_id, "durationMinutes": ttl_minutes}),
        )
        .await
    }

    async fn is_remote_session_valid(
        &self,
        session_id: &str,
    ) -> Result<SessionValidity, BridgeError> {
        self.call("isSessionValid", json!({"sessionCode": session_id}))
            .await
    }

    async fn record_attendance(
        &self,
        session_id: &str,
        claimant_id: &str,
        class_id: &str,
    ) -> Result<AnchorReceipt, BridgeError> {
        self.call(
            "markAttendance",
            json!({"sessionCode": session_id, "studentId": claimant_id, "classId": class_id}),
        )
        .await
    }

    async fn has_attended(&self, session_id: &str, claimant_id: &str) -> Result<bool, BridgeError> {
        let value = self
            .run(
                "hasAttended",
                json!({"sessionCode": session_id, "studentId": claimant_id}),
            )
            .await?;
        Ok(value
            .get("hasAttended")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    fn name(&self) -> &'static str {
        BRIDGE
    }
}
