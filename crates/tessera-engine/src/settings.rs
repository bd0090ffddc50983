//! Runtime tuning for the engine
//!
//! Defaults suit a single workstation uploading to a remote service. Every
//! field can be overridden from the environment (`TESSERA_*`) and the CLI
//! overrides a few of them again from flags.

use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Concurrent upload workers
    pub worker_count: usize,
    /// Delay between successive worker starts
    pub ramp_delay: Duration,
    /// Messages leased per dequeue call (1..=10)
    pub dequeue_batch: u32,
    /// Lease length requested on dequeue
    pub visibility_timeout: Duration,
    /// Long-poll wait on an empty queue
    pub receive_wait: Duration,
    /// Pause after an empty dequeue
    pub idle_delay: Duration,
    /// Consecutive empty polls before a worker exits when auto-complete is off
    pub max_idle_polls: u32,
    /// Backoff for rendering and uploading one item
    pub item_retry: RetryPolicy,
    /// Backoff for backend and queue operations
    pub operation_retry: RetryPolicy,
    /// Backoff for credential renewal
    pub credential_retry: RetryPolicy,
    /// Renew credentials this long before they expire
    pub renewal_margin: Duration,
    /// Assumed lifetime when the backend reports no expiry
    pub credential_lifetime: Duration,
    /// Bound on a single backend or queue call
    pub network_timeout: Duration,
    /// Bound on a single object upload
    pub upload_timeout: Duration,
    /// Queue depth sampling period for the completion detector
    pub completion_interval: Duration,
    /// Consecutive zero-depth samples required before checking coverage
    pub completion_zero_samples: u32,
    /// Drained-but-uncovered checks tolerated before the detector gives up
    pub completion_max_unconfirmed: u32,
    /// Period of progress reports and proactive credential checks
    pub progress_interval: Duration,
    /// Complete the job automatically once drained and covered
    pub auto_complete: bool,
    pub aws_region: String,
    /// Endpoint override for S3/SQS compatible services
    pub aws_endpoint: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_count: 1,
            ramp_delay: Duration::from_millis(500),
            dequeue_batch: 1,
            visibility_timeout: Duration::from_secs(120),
            receive_wait: Duration::from_secs(1),
            idle_delay: Duration::from_secs(10),
            max_idle_polls: 20,
            item_retry: RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 5),
            operation_retry: RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 6),
            credential_retry: RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 8),
            renewal_margin: Duration::from_secs(300),
            credential_lifetime: Duration::from_secs(3600),
            network_timeout: Duration::from_secs(60),
            upload_timeout: Duration::from_secs(120),
            completion_interval: Duration::from_secs(10),
            completion_zero_samples: 6,
            completion_max_unconfirmed: 30,
            progress_interval: Duration::from_secs(30),
            auto_complete: true,
            aws_region: "us-east-1".to_string(),
            aws_endpoint: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| IngestError::configuration(format!("{key} has invalid value '{raw}'"))),
        None => Ok(None),
    }
}

impl EngineSettings {
    /// Defaults overridden by `TESSERA_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut s = Self::default();
        let ms = Duration::from_millis;
        let secs = Duration::from_secs;

        if let Some(v) = env_parse(&lookup, "TESSERA_WORKERS")? {
            s.worker_count = v;
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_RAMP_DELAY_MS")? {
            s.ramp_delay = ms(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_DEQUEUE_BATCH")? {
            s.dequeue_batch = v;
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_VISIBILITY_TIMEOUT_SECS")? {
            s.visibility_timeout = secs(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_RECEIVE_WAIT_SECS")? {
            s.receive_wait = secs(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_IDLE_DELAY_MS")? {
            s.idle_delay = ms(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_MAX_IDLE_POLLS")? {
            s.max_idle_polls = v;
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_ITEM_RETRY_BASE_MS")? {
            s.item_retry.base_delay = ms(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_ITEM_RETRY_MAX_MS")? {
            s.item_retry.max_delay = ms(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_ITEM_RETRY_ATTEMPTS")? {
            s.item_retry.max_attempts = v;
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_RETRY_BASE_MS")? {
            s.operation_retry.base_delay = ms(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_RETRY_MAX_MS")? {
            s.operation_retry.max_delay = ms(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_RETRY_ATTEMPTS")? {
            s.operation_retry.max_attempts = v;
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_CREDENTIAL_RETRY_ATTEMPTS")? {
            s.credential_retry.max_attempts = v;
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_CREDENTIAL_RENEWAL_MARGIN_SECS")? {
            s.renewal_margin = secs(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_CREDENTIAL_LIFETIME_SECS")? {
            s.credential_lifetime = secs(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_NETWORK_TIMEOUT_SECS")? {
            s.network_timeout = secs(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_UPLOAD_TIMEOUT_SECS")? {
            s.upload_timeout = secs(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_COMPLETION_INTERVAL_SECS")? {
            s.completion_interval = secs(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_DRAIN_SAMPLES")? {
            s.completion_zero_samples = v;
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_COMPLETION_MAX_UNCONFIRMED")? {
            s.completion_max_unconfirmed = v;
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_PROGRESS_INTERVAL_SECS")? {
            s.progress_interval = secs(v);
        }
        if let Some(v) = env_parse(&lookup, "TESSERA_AUTO_COMPLETE")? {
            s.auto_complete = v;
        }
        if let Some(region) = lookup("TESSERA_AWS_REGION") {
            s.aws_region = region;
        }
        s.aws_endpoint = lookup("TESSERA_AWS_ENDPOINT").filter(|v| !v.trim().is_empty());

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(IngestError::configuration("worker count must be greater than 0"));
        }
        if !(1..=10).contains(&self.dequeue_batch) {
            return Err(IngestError::configuration("dequeue batch must be between 1 and 10"));
        }
        if self.visibility_timeout.is_zero() {
            return Err(IngestError::configuration("visibility timeout must be greater than 0"));
        }
        if self.completion_zero_samples == 0 {
            return Err(IngestError::configuration(
                "completion detector needs at least one zero-depth sample",
            ));
        }
        for (name, policy) in [
            ("item", &self.item_retry),
            ("operation", &self.operation_retry),
            ("credential", &self.credential_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(IngestError::configuration(format!(
                    "{name} retry policy must allow at least one attempt"
                )));
            }
            if policy.base_delay > policy.max_delay {
                return Err(IngestError::configuration(format!(
                    "{name} retry base delay exceeds its maximum"
                )));
            }
        }
        if self.network_timeout.is_zero() || self.upload_timeout.is_zero() {
            return Err(IngestError::configuration("network timeouts must be greater than 0"));
        }
        Ok(())
    }
}
