//! Ingest engine: wires the controller, workers, detector and monitor for one job

use crate::backend::Backend;
use crate::completion::{CompletionDetector, DetectorOutcome};
use crate::config::JobConfig;
use crate::connector::ResourceConnector;
use crate::controller::{CompletionRequest, ControllerSettings, JobController};
use crate::credentials::CredentialManager;
use crate::error::{IngestError, Result};
use crate::monitor::{ProgressMonitor, ProgressReport};
use crate::plugins::{PluginRegistry, Plugins};
use crate::pool::{PoolStats, StatsSnapshot, WorkerPool};
use crate::queue::QueueClient;
use crate::settings::EngineSettings;
use crate::storage::ObjectStore;
use crate::types::{IngestJob, JobId, JobSession, JobStatus};
use crate::worker::WorkerContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed { reason: String },
    /// Workers went idle with auto-completion disabled
    Drained,
    /// The queue drained but the backend never counted every unit
    Uncovered { uploaded: u64, expected: u64 },
    /// Engine shutdown requested before the job finished
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub job_id: JobId,
    pub status: JobStatus,
    pub expected: u64,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
    pub outcome: RunOutcome,
}

impl IngestSummary {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Failed { .. })
    }
}

/// Handles for one active upload run
struct Resources {
    credentials: Arc<CredentialManager>,
    queue: QueueClient,
    store: Arc<dyn ObjectStore>,
}

pub struct Engine {
    settings: Arc<EngineSettings>,
    backend: Arc<dyn Backend>,
    connector: Arc<dyn ResourceConnector>,
    registry: PluginRegistry,
    controller: Arc<JobController>,
    shutdown: CancellationToken,
    progress: Arc<watch::Sender<Option<ProgressReport>>>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        backend: Arc<dyn Backend>,
        connector: Arc<dyn ResourceConnector>,
        registry: PluginRegistry,
    ) -> Result<Self> {
        settings.validate()?;
        let controller = Arc::new(JobController::new(
            backend.clone(),
            ControllerSettings {
                retry: settings.operation_retry,
                network_timeout: settings.network_timeout,
                ..ControllerSettings::default()
            },
        ));
        let (progress, _) = watch::channel(None);
        Ok(Self {
            settings: Arc::new(settings),
            backend,
            connector,
            registry,
            controller,
            shutdown: CancellationToken::new(),
            progress: Arc::new(progress),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn controller(&self) -> Arc<JobController> {
        self.controller.clone()
    }

    /// Cancelling this token stops the workers without cancelling the job
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Option<ProgressReport>> {
        self.progress.subscribe()
    }

    pub async fn create(&self, config: &JobConfig) -> Result<IngestJob> {
        self.controller.create(config).await
    }

    pub async fn join(&self, job_id: &JobId) -> Result<IngestJob> {
        self.controller.join(job_id).await
    }

    pub async fn cancel(&self, job_id: &JobId) -> Result<()> {
        self.controller.cancel(job_id).await
    }

    /// Complete a job on operator request. The queue must read empty.
    #[instrument(skip(self))]
    pub async fn complete_manually(&self, job_id: &JobId) -> Result<()> {
        let joined = self
            .controller
            .session()
            .is_some_and(|s| &s.job.id == job_id);
        if !joined {
            self.controller.join(job_id).await?;
        }
        let session = self.active_session()?;
        let resources = self.connect(&session).await?;
        self.controller.attach_queue(resources.queue);
        self.controller
            .complete(job_id, CompletionRequest::Manual)
            .await
    }

    fn active_session(&self) -> Result<JobSession> {
        self.controller
            .session()
            .ok_or_else(|| IngestError::configuration("no ingest job is active"))
    }

    async fn connect(&self, session: &JobSession) -> Result<Resources> {
        if session.queues.upload.is_empty() {
            return Err(IngestError::configuration(format!(
                "job {} has no upload queue yet",
                session.job.id
            )));
        }
        let credentials = Arc::new(CredentialManager::new(
            session.job.id.clone(),
            self.backend.clone(),
            session.credentials.clone(),
            self.settings.credential_retry,
            self.settings.network_timeout,
            self.settings.credential_lifetime,
        ));
        let queue = self
            .connector
            .connect_queue(&session.queues.upload, credentials.clone())
            .await?;
        let store = self
            .connector
            .connect_store(&session.bucket, credentials.clone())
            .await?;
        Ok(Resources {
            credentials,
            queue: QueueClient::new(queue, self.settings.network_timeout),
            store,
        })
    }

    /// Create a job from `config`, or join `job_id`, then upload until the job ends.
    /// A `job_id` that is already active in this engine is uploaded without rejoining.
    #[instrument(skip(self, config))]
    pub async fn run(&self, config: &JobConfig, job_id: Option<&JobId>) -> Result<IngestSummary> {
        // Plugins resolve before any network call so a typo fails fast
        let plugins = Arc::new(self.registry.build(config)?);
        let active = self.controller.job();
        let job = match (job_id, active) {
            // Already joined, e.g. created and confirmed by the operator
            (Some(id), Some(job)) if &job.id == id => job,
            (Some(id), _) => self.controller.join(id).await?,
            (None, _) => self.controller.create(config).await?,
        };
        info!(job_id = %job.id, units = job.expected_units, "Starting upload");
        self.upload(plugins).await
    }

    async fn upload(&self, plugins: Arc<Plugins>) -> Result<IngestSummary> {
        let started = Instant::now();
        let session = self.active_session()?;
        let job = session.job.clone();
        if job.status != JobStatus::Uploading {
            return Err(IngestError::InvalidTransition {
                from: job.status,
                to: JobStatus::Uploading,
            });
        }

        let resources = match self.connect(&session).await {
            Ok(resources) => resources,
            Err(e) => {
                self.controller.fail(&e).await;
                return Err(e);
            },
        };
        self.controller.attach_queue(resources.queue.clone());

        let run_stop = self.controller.stop_token().child_token();
        let relay = {
            let shutdown = self.shutdown.clone();
            let run_stop = run_stop.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                run_stop.cancel();
            })
        };

        let stats = Arc::new(PoolStats::default());
        let ctx = Arc::new(WorkerContext {
            job_id: job.id.clone(),
            ingest_type: job.ingest_type,
            parameters: session.parameters.clone(),
            queue: resources.queue.clone(),
            store: resources.store,
            credentials: resources.credentials.clone(),
            plugins,
            controller: self.controller.clone(),
            settings: self.settings.clone(),
            stats: stats.clone(),
            stop: run_stop.clone(),
            exit_when_idle: !self.settings.auto_complete,
        });
        let pool = WorkerPool::spawn(ctx, self.settings.worker_count, self.settings.ramp_delay);

        let monitor = tokio::spawn(
            ProgressMonitor::new(
                resources.queue.clone(),
                resources.credentials.clone(),
                self.controller.clone(),
                stats,
                job.expected_units,
                &self.settings,
                self.progress.clone(),
            )
            .run(run_stop.clone()),
        );

        let mut detector_error = None;
        let detected = if self.settings.auto_complete {
            let result = CompletionDetector::new(
                job.id.clone(),
                self.controller.clone(),
                self.backend.clone(),
                resources.queue,
                resources.credentials,
                &self.settings,
            )
            .with_stop(run_stop.clone())
            .run()
            .await;
            run_stop.cancel();
            match result {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(error = %e, "Completion detector failed");
                    self.controller.fail(&e).await;
                    detector_error = Some(e);
                    None
                },
            }
        } else {
            None
        };

        let report = pool.join().await;
        run_stop.cancel();
        relay.abort();
        match monitor.await {
            Ok(Err(e)) => warn!(error = %e, "Progress monitor stopped"),
            Err(e) => warn!(error = %e, "Progress monitor task aborted"),
            Ok(Ok(())) => {},
        }

        let status = self.controller.status().unwrap_or(job.status);
        let outcome = match status {
            JobStatus::Complete => RunOutcome::Completed,
            JobStatus::Cancelled => RunOutcome::Cancelled,
            JobStatus::Failed => RunOutcome::Failed {
                reason: report
                    .error
                    .as_ref()
                    .or(detector_error.as_ref())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "job failed".to_string()),
            },
            _ if self.shutdown.is_cancelled() => RunOutcome::Interrupted,
            _ => match detected {
                Some(DetectorOutcome::Uncovered { uploaded, expected }) => {
                    RunOutcome::Uncovered { uploaded, expected }
                },
                _ => RunOutcome::Drained,
            },
        };

        let summary = IngestSummary {
            job_id: job.id,
            status,
            expected: job.expected_units,
            stats: report.stats,
            elapsed: started.elapsed(),
            outcome,
        };
        info!(
            job_id = %summary.job_id,
            status = %summary.status,
            uploaded = summary.stats.uploaded,
            skipped = summary.stats.skipped,
            elapsed_secs = summary.elapsed.as_secs(),
            "Upload run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::tests::tile_config_json;
    use crate::memory::{MemoryBackend, MemoryConnector};
    use serde_json::{json, Value};

    fn small_config() -> JobConfig {
        let mut value: Value = serde_json::from_str(&tile_config_json()).unwrap();
        value["ingest_job"]["extent"]["z"] = json!([0, 2]);
        value["client"]["tile_processor"]["params"] = json!({"payload_bytes": 16});
        JobConfig::from_json(&value.to_string()).unwrap()
    }

    fn engine(backend: &Arc<MemoryBackend>, settings: EngineSettings) -> Engine {
        Engine::new(
            settings,
            backend.clone(),
            Arc::new(MemoryConnector::new(backend.clone())),
            PluginRegistry::with_builtins(),
        )
        .unwrap()
    }

    fn fast_settings() -> EngineSettings {
        EngineSettings {
            worker_count: 2,
            ramp_delay: Duration::from_millis(10),
            idle_delay: Duration::from_millis(50),
            max_idle_polls: 2,
            completion_interval: Duration::from_secs(1),
            completion_zero_samples: 2,
            ..EngineSettings::default()
        }
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let settings = EngineSettings {
            worker_count: 0,
            ..EngineSettings::default()
        };
        assert!(Engine::new(
            settings,
            backend.clone(),
            Arc::new(MemoryConnector::new(backend)),
            PluginRegistry::with_builtins()
        )
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_small_job() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(&backend, fast_settings());
        let summary = engine.run(&small_config(), None).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.status, JobStatus::Complete);
        assert_eq!(summary.expected, 32);
        assert!(summary.stats.uploaded >= 32);
        assert_eq!(backend.store().object_count(), 32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_uploads_job_created_earlier() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(&backend, fast_settings());
        let config = small_config();
        let job = engine.create(&config).await.unwrap();
        let summary = engine.run(&config, Some(&job.id)).await.unwrap();
        assert_eq!(summary.job_id, job.id);
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(backend.job_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_plugin_fails_before_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = small_config();
        config.client.path_processor.class = "NoSuchProcessor".into();
        let err = engine(&backend, fast_settings())
            .run(&config, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Plugin { .. }));
        assert_eq!(backend.job_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_drains_then_completes_on_request() {
        let backend = Arc::new(MemoryBackend::new());
        let settings = EngineSettings {
            auto_complete: false,
            ..fast_settings()
        };
        let engine = engine(&backend, settings);
        let summary = engine.run(&small_config(), None).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Drained);
        assert_eq!(summary.status, JobStatus::Uploading);

        let other = self::engine(&backend, fast_settings());
        other.complete_manually(&summary.job_id).await.unwrap();
        assert_eq!(backend.status_of(&summary.job_id), Some(JobStatus::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_without_cancelling() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(&backend, fast_settings());
        engine.shutdown_token().cancel();
        let summary = engine.run(&small_config(), None).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Interrupted);
        assert_eq!(backend.status_of(&summary.job_id), Some(JobStatus::Uploading));
    }
}
