//! Completion detection
//!
//! Queue depth is approximate and reads zero while items are leased, so a
//! single empty sample proves nothing. The detector completes a job only
//! after several consecutive zero samples and a backend upload count that
//! matches the expected unit count.

use crate::backend::Backend;
use crate::controller::{CompletionRequest, DrainCertificate, JobController};
use crate::credentials::CredentialManager;
use crate::error::{ErrorClass, IngestError, Result};
use crate::queue::QueueClient;
use crate::retry::{retry, with_timeout, RetryPolicy};
use crate::settings::EngineSettings;
use crate::types::JobId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Counts consecutive zero-depth samples
#[derive(Debug, Clone)]
pub struct DrainTracker {
    consecutive_zero: u32,
    required: u32,
}

impl DrainTracker {
    pub fn new(required: u32) -> Self {
        Self {
            consecutive_zero: 0,
            required: required.max(1),
        }
    }

    /// Record a depth sample. Returns true while the zero streak meets the threshold.
    pub fn observe(&mut self, depth: u64) -> bool {
        if depth == 0 {
            self.consecutive_zero = self.consecutive_zero.saturating_add(1);
        } else {
            self.consecutive_zero = 0;
        }
        self.is_drained()
    }

    pub fn is_drained(&self) -> bool {
        self.consecutive_zero >= self.required
    }

    pub fn consecutive_zero(&self) -> u32 {
        self.consecutive_zero
    }

    pub fn reset(&mut self) {
        self.consecutive_zero = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorOutcome {
    /// The job was completed
    Completed,
    /// The stop signal fired first
    Stopped,
    /// The queue stayed empty but the backend never counted every unit
    Uncovered { uploaded: u64, expected: u64 },
}

pub struct CompletionDetector {
    job_id: JobId,
    controller: Arc<JobController>,
    backend: Arc<dyn Backend>,
    queue: QueueClient,
    credentials: Arc<CredentialManager>,
    interval: Duration,
    zero_samples: u32,
    max_unconfirmed: u32,
    retry: RetryPolicy,
    timeout: Duration,
    stop: CancellationToken,
}

impl CompletionDetector {
    pub fn new(
        job_id: JobId,
        controller: Arc<JobController>,
        backend: Arc<dyn Backend>,
        queue: QueueClient,
        credentials: Arc<CredentialManager>,
        settings: &EngineSettings,
    ) -> Self {
        let stop = controller.stop_token();
        Self {
            job_id,
            controller,
            backend,
            queue,
            credentials,
            interval: settings.completion_interval,
            zero_samples: settings.completion_zero_samples,
            max_unconfirmed: settings.completion_max_unconfirmed,
            retry: settings.operation_retry,
            timeout: settings.network_timeout,
            stop,
        }
    }

    /// Sample until `token` fires. Pass a child of the job stop token to keep both.
    pub fn with_stop(mut self, token: CancellationToken) -> Self {
        self.stop = token;
        self
    }

    async fn counts(&self) -> Result<(u64, u64)> {
        let uploaded = retry(&self.retry, "uploaded_count", Some(&self.stop), || {
            with_timeout("uploaded_count", self.timeout, self.backend.get_uploaded_count(&self.job_id))
        })
        .await?;
        let expected = retry(&self.retry, "expected_count", Some(&self.stop), || {
            with_timeout("expected_count", self.timeout, self.backend.get_expected_count(&self.job_id))
        })
        .await?;
        Ok((uploaded, expected))
    }

    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub async fn run(self) -> Result<DetectorOutcome> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tracker = DrainTracker::new(self.zero_samples);
        let mut unconfirmed = 0u32;
        let mut renewals = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(DetectorOutcome::Stopped),
                _ = ticker.tick() => {},
            }

            let observed = self.credentials.current().generation;
            let depth = match self.queue.approximate_depth().await {
                Ok(depth) => {
                    renewals = 0;
                    depth
                },
                Err(e) if e.class() == ErrorClass::Authorization => {
                    if renewals >= self.retry.max_attempts {
                        return Err(IngestError::Unauthorized(format!(
                            "queue kept rejecting renewed credentials: {e}"
                        )));
                    }
                    renewals += 1;
                    debug!(error = %e, "Queue depth rejected, renewing credentials");
                    self.credentials.refresh(observed).await?;
                    tracker.reset();
                    continue;
                },
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Queue depth sample failed");
                    tracker.reset();
                    continue;
                },
                Err(e) => return Err(e),
            };
            if depth > 0 {
                unconfirmed = 0;
            }
            if !tracker.observe(depth) {
                debug!(depth = depth, zero_streak = tracker.consecutive_zero(), "Queue sampled");
                continue;
            }

            let (uploaded, expected) = match self.counts().await {
                Ok(counts) => counts,
                Err(IngestError::Cancelled) => return Ok(DetectorOutcome::Stopped),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Could not read upload counts");
                    continue;
                },
                Err(e) => return Err(e),
            };

            if uploaded != expected {
                unconfirmed += 1;
                info!(
                    uploaded = uploaded,
                    expected = expected,
                    checks = unconfirmed,
                    "Queue drained but upload count does not match"
                );
                if unconfirmed >= self.max_unconfirmed {
                    warn!(uploaded = uploaded, expected = expected, "Giving up on automatic completion");
                    return Ok(DetectorOutcome::Uncovered { uploaded, expected });
                }
                continue;
            }

            let certificate = DrainCertificate::new(tracker.consecutive_zero(), uploaded, expected);
            match self
                .controller
                .complete(&self.job_id, CompletionRequest::Certified(certificate))
                .await
            {
                Ok(()) => return Ok(DetectorOutcome::Completed),
                Err(e @ IngestError::PrematureCompletion { .. }) => {
                    warn!(error = %e, "Completion refused, resuming sampling");
                    tracker.reset();
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{tests::tile_config_json, JobConfig};
    use crate::controller::ControllerSettings;
    use crate::memory::{MemoryBackend, MemoryQueue};
    use crate::queue::WorkQueue;
    use crate::types::{JobStatus, WorkItem};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_tracker_needs_consecutive_zeros() {
        let mut tracker = DrainTracker::new(3);
        assert!(!tracker.observe(0));
        assert!(!tracker.observe(0));
        assert!(!tracker.observe(4));
        assert!(!tracker.observe(0));
        assert!(!tracker.observe(0));
        assert!(tracker.observe(0));
        assert!(tracker.observe(0));
        tracker.reset();
        assert!(!tracker.is_drained());
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let mut tracker = DrainTracker::new(0);
        assert!(!tracker.observe(1));
        assert!(tracker.observe(0));
    }

    struct Setup {
        backend: Arc<MemoryBackend>,
        controller: Arc<JobController>,
        queue: Arc<MemoryQueue>,
        credentials: Arc<CredentialManager>,
        job_id: JobId,
        settings: EngineSettings,
    }

    async fn setup() -> Setup {
        let backend = Arc::new(MemoryBackend::new());
        let controller = Arc::new(JobController::new(backend.clone(), ControllerSettings::default()));
        let config = JobConfig::from_json(&tile_config_json()).unwrap();
        let job = controller.create(&config).await.unwrap();
        let queue = backend.queue(&job.id).unwrap();
        let settings = EngineSettings {
            completion_interval: Duration::from_secs(10),
            completion_zero_samples: 3,
            completion_max_unconfirmed: 4,
            ..EngineSettings::default()
        };
        let session = controller.session().unwrap();
        let credentials = Arc::new(CredentialManager::new(
            job.id.clone(),
            backend.clone() as Arc<dyn Backend>,
            session.credentials,
            settings.credential_retry,
            settings.network_timeout,
            settings.credential_lifetime,
        ));
        Setup {
            backend,
            controller,
            queue,
            credentials,
            job_id: job.id,
            settings,
        }
    }

    fn detector_on(s: &Setup, queue: Arc<dyn WorkQueue>) -> CompletionDetector {
        CompletionDetector::new(
            s.job_id.clone(),
            s.controller.clone(),
            s.backend.clone(),
            QueueClient::new(queue, Duration::from_secs(5)),
            s.credentials.clone(),
            &s.settings,
        )
    }

    fn detector(s: &Setup) -> CompletionDetector {
        detector_on(s, s.queue.clone())
    }

    /// Rejects the first `expired` depth reads as though the credentials lapsed
    struct ExpiringQueue {
        inner: Arc<MemoryQueue>,
        expired: AtomicU32,
    }

    #[async_trait]
    impl WorkQueue for ExpiringQueue {
        async fn dequeue(&self, max_items: u32, visibility_timeout: Duration) -> Result<Vec<WorkItem>> {
            self.inner.dequeue(max_items, visibility_timeout).await
        }

        async fn delete(&self, item: &WorkItem) -> Result<()> {
            self.inner.delete(item).await
        }

        async fn approximate_depth(&self) -> Result<u64> {
            let lapsed = self
                .expired
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lapsed {
                return Err(IngestError::authorization("ExpiredToken"));
            }
            self.inner.approximate_depth().await
        }
    }

    fn expiring(s: &Setup, expired: u32) -> Arc<dyn WorkQueue> {
        Arc::new(ExpiringQueue {
            inner: s.queue.clone(),
            expired: AtomicU32::new(expired),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_after_drain_and_full_count() {
        let s = setup().await;
        s.queue.purge();
        s.backend.mark_all_uploaded(&s.job_id);
        let outcome = detector(&s).run().await.unwrap();
        assert_eq!(outcome, DetectorOutcome::Completed);
        assert_eq!(s.controller.status(), Some(JobStatus::Complete));
        assert_eq!(s.backend.status_of(&s.job_id), Some(JobStatus::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_uploads_block_completion() {
        let s = setup().await;
        s.queue.purge();
        let outcome = detector(&s).run().await.unwrap();
        assert_eq!(
            outcome,
            DetectorOutcome::Uncovered {
                uploaded: 0,
                expected: 512
            }
        );
        assert_eq!(s.controller.status(), Some(JobStatus::Uploading));
        assert_eq!(s.backend.complete_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leased_items_keep_job_open() {
        let s = setup().await;
        // Every item leased: depth reads zero but the backend refuses completion
        let leased = s.queue.dequeue(1000, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(leased.len(), 512);
        s.backend.mark_all_uploaded(&s.job_id);

        let stop = CancellationToken::new();
        let handle = tokio::spawn(detector(&s).with_stop(stop.clone()).run());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(s.backend.complete_calls() >= 1);
        assert_eq!(s.controller.status(), Some(JobStatus::Uploading));

        stop.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), DetectorOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_ends_detector() {
        let s = setup().await;
        let d = detector(&s);
        s.controller.cancel(&s.job_id).await.unwrap();
        assert_eq!(d.run().await.unwrap(), DetectorOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credentials_on_depth_read_are_renewed() {
        let s = setup().await;
        s.queue.purge();
        s.backend.mark_all_uploaded(&s.job_id);
        let issued = s.backend.credential_issues();

        let outcome = detector_on(&s, expiring(&s, 1)).run().await.unwrap();
        assert_eq!(outcome, DetectorOutcome::Completed);
        assert_eq!(s.backend.credential_issues(), issued + 1);
        assert_eq!(s.credentials.current().generation, 1);
        assert_eq!(s.controller.status(), Some(JobStatus::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_credential_renewal_escapes_detector() {
        let s = setup().await;
        s.queue.purge();
        s.backend.fail_credentials(100);

        let err = detector_on(&s, expiring(&s, 1)).run().await.unwrap_err();
        assert!(matches!(err, IngestError::CredentialRenewalExhausted { .. }));
        assert_eq!(s.controller.status(), Some(JobStatus::Uploading));
    }
}
