//! Session lifecycle: issuance, token parsing, validation and expiry latching

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bridge::{with_timeout, TrustAnchor};
use crate::clock::Clock;
use crate::error::CheckinError;
use crate::model::Session;
use crate::store::SessionStore;

const TOKEN_SEPARATOR: char = '|';

/// Parsed form of a session's secret token: `classId|sessionId|expiresAtEpoch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub class_id: String,
    pub session_id: String,
    pub expires_at_epoch: i64,
}

impl SessionToken {
    pub fn new(class_id: &str, session_id: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            class_id: class_id.to_string(),
            session_id: session_id.to_string(),
            expires_at_epoch: expires_at.timestamp(),
        }
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.class_id,
            self.session_id,
            self.expires_at_epoch,
            sep = TOKEN_SEPARATOR
        )
    }
}

impl FromStr for SessionToken {
    type Err = CheckinError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: String| CheckinError::MalformedToken { reason };

        let parts: Vec<&str> = token.trim().split(TOKEN_SEPARATOR).collect();
        if parts.len() != 3 {
            return Err(malformed(format!(
                "expected 3 '|'-separated fields, found {}",
                parts.len()
            )));
        }
        if let Some(idx) = parts.iter().position(|p| p.trim().is_empty()) {
            return Err(malformed(format!("field {} is empty", idx + 1)));
        }

        let expires_at_epoch = parts[2]
            .trim()
            .parse::<i64>()
            .map_err(|_| malformed(format!("expiry '{}' is not an epoch timestamp", parts[2])))?;

        Ok(SessionToken {
            class_id: parts[0].trim().to_string(),
            session_id: parts[1].trim().to_string(),
            expires_at_epoch,
        })
    }
}

/// Issues and validates single-use session tokens
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    anchor: Arc<dyn TrustAnchor>,
    clock: Arc<dyn Clock>,
    bridge_timeout: std::time::Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        anchor: Arc<dyn TrustAnchor>,
        clock: Arc<dyn Clock>,
        bridge_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            anchor,
            clock,
            bridge_timeout,
        }
    }

    /// Issue a session and co-create its remote record
    ///
    /// The session is persisted active first; if the trust anchor fails or
    /// refuses, it is flipped inactive before the error is returned.
    pub async fn issue(
        &self,
        class_id: &str,
        issuer_id: &str,
        ttl: Duration,
    ) -> Result<Session, CheckinError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = self.clock.now();
        let expires_at = created_at + ttl;
        let secret_token = SessionToken::new(class_id, &id, expires_at).to_string();

        let session = Session {
            id: id.clone(),
            class_id: class_id.to_string(),
            issuer_id: issuer_id.to_string(),
            secret_token,
            created_at,
            expires_at,
            active: true,
        };
        self.store.insert_session(session.clone()).await?;
        debug!("Session {} persisted for class {}", id, class_id);

        let ttl_minutes = remote_ttl_minutes(ttl);
        let outcome = with_timeout(
            self.bridge_timeout,
            "createRemoteSession",
            self.anchor.create_remote_session(&id, class_id, ttl_minutes),
        )
        .await;

        let failure = match outcome {
            Ok(receipt) if receipt.success => {
                info!(
                    "Issued session {} for class {} (expires {}, anchor tx {:?})",
                    id, class_id, expires_at, receipt.tx_hash
                );
                return Ok(session);
            }
            Ok(_) => "trust anchor reported failure".to_string(),
            Err(e) => e.to_string(),
        };

        warn!(
            "Remote session creation failed for {} via {}: {}",
            id,
            self.anchor.name(),
            failure
        );
        self.store.deactivate_if_active(&id).await?;
        Err(CheckinError::ExternalAnchor {
            session_id: id,
            reason: failure,
        })
    }

    /// Split a token into its fields without touching any store
    pub fn parse(&self, secret_token: &str) -> Result<SessionToken, CheckinError> {
        secret_token.parse()
    }

    /// Return the active, unexpired session; latches expiry on first sight
    pub async fn validate(&self, session_id: &str) -> Result<Session, CheckinError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .filter(|s| s.active)
            .ok_or_else(|| CheckinError::UnknownOrInactiveSession {
                session_id: session_id.to_string(),
            })?;

        if session.is_expired_at(self.clock.now()) {
            if self.store.deactivate_if_active(session_id).await? {
                info!("Session {} expired; marked inactive", session_id);
            }
            return Err(CheckinError::ExpiredSession {
                session_id: session_id.to_string(),
                expired_at: session.expires_at,
            });
        }

        Ok(session)
    }
}

/// Whole minutes for the remote record, rounded up, at least one
fn remote_ttl_minutes(ttl: Duration) -> i64 {
    let secs = ttl.num_seconds().max(1);
    ((secs + 59) / 60).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::{FakeBehavior, ScriptedTrustAnchor};
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn manager(
        anchor: Arc<ScriptedTrustAnchor>,
        clock: Arc<ManualClock>,
    ) -> (SessionManager, MemoryStore) {
        let store = MemoryStore::new();
        let manager = SessionManager::new(
            Arc::new(store.clone()),
            anchor,
            clock,
            std::time::Duration::from_millis(200),
        );
        (manager, store)
    }

    #[test]
    fn test_token_round_trip() {
        let token: SessionToken = "C1|abc-123|1700000000".parse().unwrap();
        assert_eq!(token.class_id, "C1");
        assert_eq!(token.session_id, "abc-123");
        assert_eq!(token.expires_at_epoch, 1_700_000_000);
        assert_eq!(token.to_string(), "C1|abc-123|1700000000");
    }

    #[test]
    fn test_token_rejects_wrong_shapes() {
        for bad in ["", "C1|s1", "C1|s1|1|extra", "C1||1", "|s1|1", "C1|s1|", "C1|s1|soon"] {
            let err = bad.parse::<SessionToken>().unwrap_err();
            assert!(
                matches!(err, CheckinError::MalformedToken { .. }),
                "expected malformed for {bad:?}"
            );
        }
    }

    #[test]
    fn test_remote_ttl_rounds_up() {
        assert_eq!(remote_ttl_minutes(Duration::minutes(5)), 5);
        assert_eq!(remote_ttl_minutes(Duration::seconds(61)), 2);
        assert_eq!(remote_ttl_minutes(Duration::seconds(0)), 1);
    }

    #[tokio::test]
    async fn test_issue_builds_self_describing_token() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (manager, _) = manager(Arc::new(ScriptedTrustAnchor::new()), clock.clone());

        let session = manager.issue("C1", "T1", Duration::minutes(5)).await.unwrap();
        assert!(session.active);
        assert_eq!(session.expires_at, clock.now() + Duration::minutes(5));

        let token = manager.parse(&session.secret_token).unwrap();
        assert_eq!(token.class_id, "C1");
        assert_eq!(token.session_id, session.id);
        assert_eq!(token.expires_at_epoch, session.expires_at.timestamp());
    }

    #[tokio::test]
    async fn test_issue_deactivates_when_anchor_refuses() {
        let anchor = Arc::new(ScriptedTrustAnchor::new());
        anchor.on_create(FakeBehavior::Refuse);
        let (manager, store) = manager(anchor, Arc::new(ManualClock::new(Utc::now())));

        let err = manager.issue("C1", "T1", Duration::minutes(5)).await.unwrap_err();
        let CheckinError::ExternalAnchor { session_id, .. } = err else {
            panic!("expected ExternalAnchor, got {err:?}");
        };
        let stored = store.get_session(&session_id).await.unwrap().unwrap();
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn test_issue_deactivates_when_anchor_hangs() {
        let anchor = Arc::new(ScriptedTrustAnchor::new());
        anchor.on_create(FakeBehavior::Hang);
        let (manager, store) = manager(anchor, Arc::new(ManualClock::new(Utc::now())));

        let err = manager.issue("C1", "T1", Duration::minutes(5)).await.unwrap_err();
        let CheckinError::ExternalAnchor { session_id, reason } = err else {
            panic!("expected ExternalAnchor");
        };
        assert!(reason.contains("timed out"));
        assert!(!store.get_session(&session_id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_validate_latches_expiry() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (manager, store) = manager(Arc::new(ScriptedTrustAnchor::new()), clock.clone());
        let session = manager.issue("C1", "T1", Duration::minutes(5)).await.unwrap();

        assert!(manager.validate(&session.id).await.is_ok());

        clock.advance(Duration::minutes(5) + Duration::seconds(1));
        assert!(matches!(
            manager.validate(&session.id).await,
            Err(CheckinError::ExpiredSession { .. })
        ));
        assert!(!store.get_session(&session.id).await.unwrap().unwrap().active);

        // Once latched, the session reads as inactive even if time rewinds
        clock.advance(Duration::minutes(-10));
        assert!(matches!(
            manager.validate(&session.id).await,
            Err(CheckinError::UnknownOrInactiveSession { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_unknown_session() {
        let (manager, _) = manager(
            Arc::new(ScriptedTrustAnchor::new()),
            Arc::new(ManualClock::new(Utc::now())),
        );
        assert!(matches!(
            manager.validate("missing").await,
            Err(CheckinError::UnknownOrInactiveSession { .. })
        ));
    }
}
