//! Job lifecycle owner
//!
//! The controller is the only component that changes a job's status. It
//! talks to the backend for create, join, cancel and complete, and it owns
//! the two signals the rest of the engine obeys: the stop token that ends
//! worker loops, and the delete gate that guarantees no queue item is
//! acknowledged after a cancel.

use crate::backend::Backend;
use crate::config::JobConfig;
use crate::error::{IngestError, Result};
use crate::queue::QueueClient;
use crate::retry::{retry, with_timeout, RetryPolicy};
use crate::types::{IngestJob, JobId, JobSession, JobStatus};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock as AsyncRwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub retry: RetryPolicy,
    /// Bound on cancel, complete and credential calls
    pub network_timeout: Duration,
    /// Bound on create and join, which may wait for the backend to prepare the job
    pub join_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            network_timeout: Duration::from_secs(60),
            join_timeout: Duration::from_secs(660),
        }
    }
}

/// Admits queue deletes until closed. Closing waits for deletes already in flight.
#[derive(Debug)]
pub struct DeleteGate {
    open: AsyncRwLock<bool>,
}

impl Default for DeleteGate {
    fn default() -> Self {
        Self {
            open: AsyncRwLock::new(true),
        }
    }
}

impl DeleteGate {
    /// Hold the returned guard for the duration of one delete. `None` once closed.
    pub async fn acquire(&self) -> Option<RwLockReadGuard<'_, bool>> {
        let guard = self.open.read().await;
        if *guard {
            Some(guard)
        } else {
            None
        }
    }

    pub async fn close(&self) {
        *self.open.write().await = false;
    }

    pub async fn is_open(&self) -> bool {
        *self.open.read().await
    }
}

/// Evidence that the queue was observed empty and the backend counted every unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainCertificate {
    zero_samples: u32,
    uploaded: u64,
    expected: u64,
}

impl DrainCertificate {
    pub(crate) fn new(zero_samples: u32, uploaded: u64, expected: u64) -> Self {
        Self {
            zero_samples,
            uploaded,
            expected,
        }
    }

    pub fn zero_samples(&self) -> u32 {
        self.zero_samples
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }
}

#[derive(Debug, Clone)]
pub enum CompletionRequest {
    /// Issued by the completion detector
    Certified(DrainCertificate),
    /// Operator request; the controller samples queue depth itself
    Manual,
}

pub struct JobController {
    backend: Arc<dyn Backend>,
    settings: ControllerSettings,
    session: RwLock<Option<JobSession>>,
    drain_probe: RwLock<Option<QueueClient>>,
    lifecycle: Mutex<()>,
    stop: CancellationToken,
    delete_gate: Arc<DeleteGate>,
}

impl JobController {
    pub fn new(backend: Arc<dyn Backend>, settings: ControllerSettings) -> Self {
        Self {
            backend,
            settings,
            session: RwLock::new(None),
            drain_probe: RwLock::new(None),
            lifecycle: Mutex::new(()),
            stop: CancellationToken::new(),
            delete_gate: Arc::new(DeleteGate::default()),
        }
    }

    pub fn session(&self) -> Option<JobSession> {
        read(&self.session).clone()
    }

    pub fn job(&self) -> Option<IngestJob> {
        read(&self.session).as_ref().map(|s| s.job.clone())
    }

    pub fn status(&self) -> Option<JobStatus> {
        read(&self.session).as_ref().map(|s| s.job.status)
    }

    /// Cancelled on cancel, failure and completion
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn delete_gate(&self) -> Arc<DeleteGate> {
        self.delete_gate.clone()
    }

    /// Queue used to verify drainage on manual completion
    pub fn attach_queue(&self, queue: QueueClient) {
        *write(&self.drain_probe) = Some(queue);
    }

    fn set_status(&self, next: JobStatus) -> Result<()> {
        let mut guard = write(&self.session);
        let session = guard
            .as_mut()
            .ok_or_else(|| IngestError::configuration("no ingest job is active"))?;
        let from = session.job.status;
        session.job.status = from.transition(next)?;
        info!(job_id = %session.job.id, from = %from, to = %next, "Job status changed");
        Ok(())
    }

    fn install(&self, mut session: JobSession) -> Result<IngestJob> {
        let backend_status = session.job.status;
        if backend_status.is_terminal() {
            return Err(IngestError::JobAlreadyComplete {
                job_id: session.job.id.clone(),
                status: backend_status,
            });
        }

        // Local lifecycle starts at Created and advances once uploads can begin
        session.job.status = match backend_status {
            JobStatus::Created | JobStatus::Uploading => JobStatus::Created,
            other => other,
        };
        let job = session.job.clone();
        let ready = !session.queues.upload.is_empty() && backend_status != JobStatus::Created;
        *write(&self.session) = Some(session);

        if ready && job.status == JobStatus::Created {
            self.set_status(JobStatus::Uploading)?;
        }
        self.job()
            .ok_or_else(|| IngestError::configuration(format!("job {} vanished", job.id)))
    }

    fn ensure_idle(&self) -> Result<()> {
        match read(&self.session).as_ref() {
            Some(s) if !s.job.status.is_terminal() => Err(IngestError::configuration(format!(
                "controller already manages active job {}",
                s.job.id
            ))),
            _ => Ok(()),
        }
    }

    /// Validate `config`, register a job, and wait until it accepts uploads
    #[instrument(skip(self, config))]
    pub async fn create(&self, config: &JobConfig) -> Result<IngestJob> {
        let _lifecycle = self.lifecycle.lock().await;
        config.validate()?;
        self.ensure_idle()?;

        // Not retried: a lost response could otherwise register a second job
        let session = with_timeout(
            "create_job",
            self.settings.join_timeout,
            self.backend.create_job(config),
        )
        .await?;
        info!(job_id = %session.job.id, units = session.job.expected_units, "Ingest job registered");
        self.install(session)
    }

    /// Reattach to an existing job
    #[instrument(skip(self))]
    pub async fn join(&self, job_id: &JobId) -> Result<IngestJob> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_idle()?;

        let session = retry(&self.settings.retry, "join_job", None, || {
            with_timeout("join_job", self.settings.join_timeout, self.backend.join_job(job_id))
        })
        .await?;
        info!(job_id = %job_id, status = %session.job.status, "Joined ingest job");
        self.install(session)
    }

    /// Cancel a job. Deletes stop before the backend purges the queue.
    ///
    /// Cancelling an already-cancelled job is a no-op. A job that is not
    /// active in this controller is cancelled on the backend directly.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let local = self
            .session()
            .filter(|s| &s.job.id == job_id)
            .map(|s| s.job.status);

        match local {
            Some(JobStatus::Cancelled) => return Ok(()),
            Some(status @ (JobStatus::Complete | JobStatus::Failed)) => {
                return Err(IngestError::JobAlreadyComplete {
                    job_id: job_id.clone(),
                    status,
                })
            },
            Some(status @ JobStatus::Completing) => {
                return Err(IngestError::InvalidTransition {
                    from: status,
                    to: JobStatus::Cancelled,
                })
            },
            Some(_) => {
                self.delete_gate.close().await;
                self.stop.cancel();
            },
            None => {},
        }

        let cancelled = retry(&self.settings.retry, "cancel_job", None, || {
            with_timeout("cancel_job", self.settings.network_timeout, self.backend.cancel_job(job_id))
        })
        .await;
        if let Err(e) = cancelled {
            // Workers are already stopped; the job cannot stay Uploading
            if local.is_some() {
                self.fail_locked(&e).await;
            }
            return Err(e);
        }

        if local.is_some() {
            self.set_status(JobStatus::Cancelled)?;
        }
        warn!(job_id = %job_id, "Ingest job cancelled");
        Ok(())
    }

    /// Mark the active job complete
    ///
    /// Fails with [`IngestError::PrematureCompletion`] while work remains queued.
    #[instrument(skip(self, request))]
    pub async fn complete(&self, job_id: &JobId, request: CompletionRequest) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let status = self
            .session()
            .filter(|s| &s.job.id == job_id)
            .map(|s| s.job.status)
            .ok_or_else(|| IngestError::configuration(format!("job {job_id} is not joined")))?;
        if status.is_terminal() {
            return Err(IngestError::JobAlreadyComplete {
                job_id: job_id.clone(),
                status,
            });
        }

        match request {
            CompletionRequest::Certified(certificate) => {
                if certificate.uploaded != certificate.expected {
                    return Err(IngestError::PrematureCompletion {
                        job_id: job_id.clone(),
                        reason: format!(
                            "{} of {} units uploaded",
                            certificate.uploaded, certificate.expected
                        ),
                    });
                }
            },
            CompletionRequest::Manual => {
                let probe = read(&self.drain_probe).clone().ok_or_else(|| {
                    IngestError::configuration("no upload queue attached to verify drainage")
                })?;
                let depth = probe.approximate_depth().await?;
                if depth > 0 {
                    return Err(IngestError::PrematureCompletion {
                        job_id: job_id.clone(),
                        reason: format!("{depth} items still queued"),
                    });
                }
            },
        }

        self.set_status(JobStatus::Completing)?;
        let result = retry(&self.settings.retry, "complete_job", None, || {
            with_timeout(
                "complete_job",
                self.settings.network_timeout,
                self.backend.complete_job(job_id),
            )
        })
        .await;

        match result {
            Ok(()) => {
                self.set_status(JobStatus::Complete)?;
                self.stop.cancel();
                info!(job_id = %job_id, "Ingest job complete");
                Ok(())
            },
            Err(e @ IngestError::PrematureCompletion { .. }) => {
                self.set_status(JobStatus::Uploading)?;
                warn!(job_id = %job_id, error = %e, "Backend refused completion");
                Err(e)
            },
            Err(e) => {
                self.fail_locked(&e).await;
                Err(e)
            },
        }
    }

    /// Move the active job to Failed and stop all work
    pub async fn fail(&self, reason: &IngestError) {
        let _lifecycle = self.lifecycle.lock().await;
        self.fail_locked(reason).await;
    }

    async fn fail_locked(&self, reason: &IngestError) {
        let Some(status) = self.status() else {
            return;
        };
        if status.is_terminal() {
            return;
        }
        self.delete_gate.close().await;
        self.stop.cancel();
        if let Err(e) = self.set_status(JobStatus::Failed) {
            warn!(error = %e, "Could not record job failure");
        }
        error!(error = %reason, "Ingest job failed");
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
