//! Per-container bearer token registry.
//!
//! Tokens live only in memory. Registration happens before a container's
//! health probe starts; revocation happens synchronously before the
//! container is stopped, and removes the rate-limit state with it. Every
//! proxy request re-checks the registry, so a revoked token is dead on the
//! next call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::limits::RateWindow;

struct TokenEntry {
    job_id: String,
    created_at: DateTime<Utc>,
    window: RateWindow,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok { job_id: String },
    UnknownToken,
    RateLimited { retry_after: Duration },
}

/// Shared token registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct TokenRegistry {
    inner: Arc<RwLock<HashMap<String, TokenEntry>>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly generated container token.
    pub async fn register(&self, token: &str, job_id: &str) {
        let mut map = self.inner.write().await;
        map.insert(
            token.to_string(),
            TokenEntry {
                job_id: job_id.to_string(),
                created_at: Utc::now(),
                window: RateWindow::new(),
            },
        );
        tracing::debug!(job_id, tokens = map.len(), "Registered container token");
    }

    /// Remove a token. Returns whether it was registered.
    pub async fn revoke(&self, token: &str) -> bool {
        let removed = self.inner.write().await.remove(token);
        if let Some(entry) = &removed {
            tracing::debug!(job_id = %entry.job_id, "Revoked container token");
        }
        removed.is_some()
    }

    /// Validate a bearer and consume one rate-window slot.
    pub async fn authorize(&self, token: &str, rate_limit: u32) -> AuthOutcome {
        let mut map = self.inner.write().await;
        match map.get_mut(token) {
            None => AuthOutcome::UnknownToken,
            Some(entry) => {
                if entry.window.check_and_record(rate_limit) {
                    AuthOutcome::Ok {
                        job_id: entry.job_id.clone(),
                    }
                } else {
                    AuthOutcome::RateLimited {
                        retry_after: entry.window.retry_after(),
                    }
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_registered(&self, token: &str) -> bool {
        self.inner.read().await.contains_key(token)
    }

    /// Age of a token's registration (diagnostics).
    pub async fn registered_at(&self, token: &str) -> Option<DateTime<Utc>> {
        self.inner.read().await.get(token).map(|e| e.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_authorize_revoke() {
        let registry = TokenRegistry::new();
        registry.register("tok-a", "job-1").await;
        assert_eq!(registry.len().await, 1);

        assert_eq!(
            registry.authorize("tok-a", 10).await,
            AuthOutcome::Ok {
                job_id: "job-1".to_string()
            }
        );
        assert_eq!(registry.authorize("tok-b", 10).await, AuthOutcome::UnknownToken);

        assert!(registry.revoke("tok-a").await);
        assert!(!registry.revoke("tok-a").await);
        assert_eq!(registry.authorize("tok-a", 10).await, AuthOutcome::UnknownToken);
    }

    #[tokio::test]
    async fn rate_limit_enforced_per_token() {
        let registry = TokenRegistry::new();
        registry.register("tok-a", "job-1").await;
        registry.register("tok-b", "job-2").await;

        assert!(matches!(
            registry.authorize("tok-a", 2).await,
            AuthOutcome::Ok { .. }
        ));
        assert!(matches!(
            registry.authorize("tok-a", 2).await,
            AuthOutcome::Ok { .. }
        ));
        assert!(matches!(
            registry.authorize("tok-a", 2).await,
            AuthOutcome::RateLimited { .. }
        ));
        // Other tokens keep their own window.
        assert!(matches!(
            registry.authorize("tok-b", 2).await,
            AuthOutcome::Ok { .. }
        ));
    }

    #[tokio::test]
    async fn revocation_clears_rate_state() {
        let registry = TokenRegistry::new();
        registry.register("tok-a", "job-1").await;
        let _ = registry.authorize("tok-a", 1).await;
        assert!(matches!(
            registry.authorize("tok-a", 1).await,
            AuthOutcome::RateLimited { .. }
        ));

        registry.revoke("tok-a").await;
        registry.register("tok-a", "job-1").await;
        // Fresh registration starts a fresh window.
        assert!(matches!(
            registry.authorize("tok-a", 1).await,
            AuthOutcome::Ok { .. }
        ));
    }
}
