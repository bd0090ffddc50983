//! Shared upload credentials with serialized renewal
//!
//! All workers read the same credential snapshot. When one of them sees an
//! authorization failure it asks for a refresh, passing the generation it
//! was using. Refreshes run one at a time behind an async mutex; a caller
//! whose generation is already stale gets the newer snapshot back without
//! another backend call. N concurrent failures therefore cost one renewal.

use crate::backend::Backend;
use crate::error::{IngestError, Result};
use crate::retry::{retry, with_timeout, RetryPolicy};
use crate::types::{Credentials, JobId};
use chrono::Utc;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Credentials tagged with the renewal that produced them
#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    pub generation: u64,
    pub credentials: Arc<Credentials>,
}

pub struct CredentialManager {
    job_id: JobId,
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
    timeout: Duration,
    lifetime: Duration,
    current: RwLock<CredentialSnapshot>,
    refresh_gate: Mutex<()>,
}

impl CredentialManager {
    pub fn new(
        job_id: JobId,
        backend: Arc<dyn Backend>,
        initial: Credentials,
        policy: RetryPolicy,
        timeout: Duration,
        lifetime: Duration,
    ) -> Self {
        let initial = stamp_expiry(initial, lifetime);
        Self {
            job_id,
            backend,
            policy,
            timeout,
            lifetime,
            current: RwLock::new(CredentialSnapshot {
                generation: 0,
                credentials: Arc::new(initial),
            }),
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn current(&self) -> CredentialSnapshot {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, credentials: Credentials, generation: u64) -> CredentialSnapshot {
        let snapshot = CredentialSnapshot {
            generation,
            credentials: Arc::new(stamp_expiry(credentials, self.lifetime)),
        };
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot.clone(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
        }
        snapshot
    }

    /// Renew credentials that the caller observed at `observed_generation`.
    ///
    /// Returns immediately when someone else already renewed past that
    /// generation. Exhausting the retry budget yields
    /// [`IngestError::CredentialRenewalExhausted`], which fails the job.
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub async fn refresh(&self, observed_generation: u64) -> Result<CredentialSnapshot> {
        let _gate = self.refresh_gate.lock().await;

        let current = self.current();
        if current.generation != observed_generation {
            return Ok(current);
        }

        let mut attempts = 0u32;
        let result = retry(&self.policy, "renew_credentials", None, || {
            attempts += 1;
            with_timeout("renew_credentials", self.timeout, async {
                let creds = self.backend.get_credentials(&self.job_id).await?;
                if creds.is_empty() {
                    return Err(IngestError::backend("backend issued empty credentials"));
                }
                Ok(creds)
            })
        })
        .await;

        match result {
            Ok(creds) => {
                let snapshot = self.install(creds, current.generation + 1);
                info!(generation = snapshot.generation, "Upload credentials renewed");
                Ok(snapshot)
            },
            Err(e) => {
                warn!(attempts = attempts, error = %e, "Credential renewal failed");
                Err(IngestError::CredentialRenewalExhausted {
                    attempts,
                    last_error: e.to_string(),
                })
            },
        }
    }

    /// Renew ahead of expiry. Returns the snapshot now in force.
    pub async fn refresh_if_expiring(&self, margin: Duration) -> Result<CredentialSnapshot> {
        let snapshot = self.current();
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::days(3650));
        if snapshot.credentials.expires_within(margin, Utc::now()) {
            info!(generation = snapshot.generation, "Upload credentials expiring soon, renewing");
            self.refresh(snapshot.generation).await
        } else {
            Ok(snapshot)
        }
    }
}

fn stamp_expiry(mut credentials: Credentials, lifetime: Duration) -> Credentials {
    if credentials.expires_at.is_none() {
        if let Ok(lifetime) = chrono::Duration::from_std(lifetime) {
            credentials.expires_at = Some(Utc::now() + lifetime);
        }
    }
    credentials
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::types::JobSession;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that only issues credentials, optionally failing first
    struct CredentialBackend {
        issued: AtomicU32,
        failures_before_success: u32,
        fatal: bool,
    }

    impl CredentialBackend {
        fn new(failures_before_success: u32) -> Self {
            Self {
                issued: AtomicU32::new(0),
                failures_before_success,
                fatal: false,
            }
        }
    }

    #[async_trait]
    impl Backend for CredentialBackend {
        async fn create_job(&self, _config: &JobConfig) -> Result<JobSession> {
            unimplemented!()
        }
        async fn join_job(&self, _job_id: &JobId) -> Result<JobSession> {
            unimplemented!()
        }
        async fn cancel_job(&self, _job_id: &JobId) -> Result<()> {
            unimplemented!()
        }
        async fn complete_job(&self, _job_id: &JobId) -> Result<()> {
            unimplemented!()
        }
        async fn get_credentials(&self, _job_id: &JobId) -> Result<Credentials> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fatal {
                return Err(IngestError::Unauthorized("token revoked".into()));
            }
            if n <= self.failures_before_success {
                return Err(IngestError::backend("503"));
            }
            Ok(creds(&format!("KEY{n}"), None))
        }
        async fn get_uploaded_count(&self, _job_id: &JobId) -> Result<u64> {
            Ok(0)
        }
        async fn get_expected_count(&self, _job_id: &JobId) -> Result<u64> {
            Ok(0)
        }
    }

    fn creds(key: &str, expires_at: Option<chrono::DateTime<Utc>>) -> Credentials {
        Credentials {
            access_key: key.into(),
            secret_key: "secret".into(),
            session_token: None,
            expires_at,
        }
    }

    fn manager(backend: Arc<CredentialBackend>, initial: Credentials) -> Arc<CredentialManager> {
        Arc::new(CredentialManager::new(
            JobId::from("7"),
            backend,
            initial,
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 4),
            Duration::from_secs(5),
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test]
    async fn test_missing_expiry_gets_default_lifetime() {
        let backend = Arc::new(CredentialBackend::new(0));
        let manager = manager(backend, creds("KEY0", None));
        let expires_at = manager.current().credentials.expires_at.unwrap();
        assert!(expires_at > Utc::now() + chrono::Duration::minutes(59));
    }

    #[tokio::test]
    async fn test_concurrent_failures_trigger_single_refresh() {
        let backend = Arc::new(CredentialBackend::new(0));
        let manager = manager(backend.clone(), creds("KEY0", None));
        let observed = manager.current().generation;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.refresh(observed).await })
            })
            .collect();
        for handle in handles {
            let snapshot = handle.await.unwrap().unwrap();
            assert_eq!(snapshot.generation, 1);
            assert_eq!(snapshot.credentials.access_key, "KEY1");
        }
        assert_eq!(backend.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_returns_current() {
        let backend = Arc::new(CredentialBackend::new(0));
        let manager = manager(backend.clone(), creds("KEY0", None));
        manager.refresh(0).await.unwrap();
        let again = manager.refresh(0).await.unwrap();
        assert_eq!(again.generation, 1);
        assert_eq!(backend.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_retries_transient_failures() {
        let backend = Arc::new(CredentialBackend::new(2));
        let manager = manager(backend.clone(), creds("KEY0", None));
        let snapshot = manager.refresh(0).await.unwrap();
        assert_eq!(snapshot.credentials.access_key, "KEY3");
        assert_eq!(backend.issued.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refresh_exhaustion_is_reported() {
        let backend = Arc::new(CredentialBackend::new(100));
        let manager = manager(backend.clone(), creds("KEY0", None));
        let err = manager.refresh(0).await.unwrap_err();
        assert!(matches!(err, IngestError::CredentialRenewalExhausted { attempts: 4, .. }));
        assert_eq!(manager.current().generation, 0);
    }

    #[tokio::test]
    async fn test_fatal_backend_error_is_not_retried() {
        let backend = Arc::new(CredentialBackend {
            issued: AtomicU32::new(0),
            failures_before_success: 0,
            fatal: true,
        });
        let manager = manager(backend.clone(), creds("KEY0", None));
        let err = manager.refresh(0).await.unwrap_err();
        assert!(matches!(err, IngestError::CredentialRenewalExhausted { attempts: 1, .. }));
        assert_eq!(backend.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_if_expiring() {
        let backend = Arc::new(CredentialBackend::new(0));
        let fresh = manager(backend.clone(), creds("KEY0", Some(Utc::now() + chrono::Duration::hours(1))));
        assert_eq!(fresh.refresh_if_expiring(Duration::from_secs(300)).await.unwrap().generation, 0);
        assert_eq!(backend.issued.load(Ordering::SeqCst), 0);

        let stale = manager(backend.clone(), creds("KEY0", Some(Utc::now() + chrono::Duration::minutes(2))));
        assert_eq!(stale.refresh_if_expiring(Duration::from_secs(300)).await.unwrap().generation, 1);
        assert_eq!(backend.issued.load(Ordering::SeqCst), 1);
    }
}
