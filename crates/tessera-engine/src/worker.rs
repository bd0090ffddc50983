//! Upload worker
//!
//! Each worker leases items from the upload queue, renders the unit the
//! item names, writes it to object storage and acknowledges the item.
//! Failures are handled per item according to their [`ErrorClass`]; only
//! fatal errors escape the worker and fail the job.

use crate::controller::JobController;
use crate::credentials::CredentialManager;
use crate::error::{ErrorClass, IngestError, Result};
use crate::keys::TaskMessage;
use crate::plugins::Plugins;
use crate::pool::PoolStats;
use crate::queue::QueueClient;
use crate::retry::{retry, sleep_or_cancel, with_timeout};
use crate::settings::EngineSettings;
use crate::storage::{ObjectStore, UploadRequest};
use crate::types::{IngestType, JobId, TileCoord, WorkItem};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Everything a worker shares with its siblings
pub struct WorkerContext {
    pub job_id: JobId,
    pub ingest_type: IngestType,
    /// Job parameters echoed into upload metadata
    pub parameters: Value,
    pub queue: QueueClient,
    pub store: Arc<dyn ObjectStore>,
    pub credentials: Arc<CredentialManager>,
    pub plugins: Arc<Plugins>,
    pub controller: Arc<JobController>,
    pub settings: Arc<EngineSettings>,
    pub stats: Arc<PoolStats>,
    pub stop: CancellationToken,
    /// Exit after `max_idle_polls` consecutive empty polls
    pub exit_when_idle: bool,
}

/// What happened to one leased item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Written and acknowledged
    Uploaded,
    /// Could never succeed; acknowledged without upload
    Skipped,
    /// Left for the lease to lapse so the queue redelivers it
    Abandoned,
    /// Stop signal observed; not acknowledged
    Stopped,
}

pub struct UploadWorker {
    index: usize,
    worker_id: Uuid,
    hostname: String,
    ctx: Arc<WorkerContext>,
}

impl UploadWorker {
    pub fn new(index: usize, ctx: Arc<WorkerContext>) -> Self {
        Self {
            index,
            worker_id: Uuid::new_v4(),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            ctx,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Poll until stopped, idle (when allowed to idle out), or a fatal error
    #[instrument(skip(self), fields(worker = self.index, worker_id = %self.worker_id, host = %self.hostname))]
    pub async fn run(self) -> Result<()> {
        info!("Upload worker started");
        let settings = &self.ctx.settings;
        let mut idle_polls = 0u32;

        while !self.ctx.stop.is_cancelled() {
            self.ctx
                .credentials
                .refresh_if_expiring(settings.renewal_margin)
                .await?;

            let items = match self.lease().await {
                Ok(items) => items,
                Err(IngestError::Cancelled) => break,
                Err(e) => return Err(e),
            };

            if items.is_empty() {
                idle_polls += 1;
                if self.ctx.exit_when_idle && idle_polls >= settings.max_idle_polls {
                    info!(idle_polls = idle_polls, "Queue idle, worker exiting");
                    break;
                }
                if sleep_or_cancel(settings.idle_delay, Some(&self.ctx.stop)).await.is_err() {
                    break;
                }
                continue;
            }
            idle_polls = 0;

            for item in &items {
                if self.process_item(item).await? == ItemOutcome::Stopped {
                    info!("Upload worker stopped");
                    return Ok(());
                }
            }
        }

        info!("Upload worker stopped");
        Ok(())
    }

    /// Lease a batch, renewing credentials when the queue rejects them
    async fn lease(&self) -> Result<Vec<WorkItem>> {
        let settings = &self.ctx.settings;
        let mut renewals = 0u32;
        loop {
            let observed = self.ctx.credentials.current().generation;
            let result = retry(&settings.operation_retry, "dequeue", Some(&self.ctx.stop), || {
                self.ctx
                    .queue
                    .dequeue(settings.dequeue_batch, settings.visibility_timeout)
            })
            .await;

            match result {
                Ok(items) => {
                    self.ctx.stats.record_dequeued(items.len());
                    return Ok(items);
                },
                Err(e) if e.class() == ErrorClass::Authorization => {
                    if renewals >= settings.item_retry.max_attempts {
                        return Err(IngestError::Unauthorized(e.to_string()));
                    }
                    renewals += 1;
                    self.ctx.stats.record_auth_refresh();
                    self.ctx.credentials.refresh(observed).await?;
                },
                Err(e) if e.is_transient() => {
                    return Err(IngestError::queue(format!("dequeue kept failing: {e}")))
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Carry one item through render, upload and acknowledge
    #[instrument(skip(self, item), fields(message_id = %item.message_id))]
    pub async fn process_item(&self, item: &WorkItem) -> Result<ItemOutcome> {
        let task = match TaskMessage::parse(&item.body) {
            Ok(task) => task,
            Err(e) => return self.skip(item, &e).await,
        };
        let (key, coord) = match task
            .object_key(self.ctx.ingest_type)
            .and_then(|key| Ok((key.to_string(), task.decode(self.ctx.ingest_type)?.coord)))
        {
            Ok(decoded) => decoded,
            Err(e) => return self.skip(item, &e).await,
        };

        let settings = &self.ctx.settings;
        let mut backoff = settings.item_retry.start();
        let mut renewals = 0u32;
        let mut rendered: Option<Vec<u8>> = None;

        loop {
            let observed = self.ctx.credentials.current().generation;
            let attempt = tokio::select! {
                biased;
                _ = self.ctx.stop.cancelled() => return Ok(ItemOutcome::Stopped),
                result = self.attempt(item, &task, &key, &coord, &mut rendered) => result,
            };

            let err = match attempt {
                Ok(()) => break,
                Err(e) => e,
            };

            match err.class() {
                ErrorClass::Permanent => return self.skip(item, &err).await,
                ErrorClass::Authorization => {
                    if renewals >= settings.item_retry.max_attempts {
                        return Err(IngestError::Unauthorized(format!(
                            "storage kept rejecting renewed credentials: {err}"
                        )));
                    }
                    renewals += 1;
                    self.ctx.stats.record_auth_refresh();
                    debug!(error = %err, "Upload rejected, renewing credentials");
                    self.ctx.credentials.refresh(observed).await?;
                },
                ErrorClass::Transient => match backoff.next_delay() {
                    Some(delay) => {
                        self.ctx.stats.record_retry();
                        debug!(
                            attempt = backoff.failures(),
                            backoff_ms = delay.as_millis() as u64,
                            error = %err,
                            "Upload failed, retrying"
                        );
                        if sleep_or_cancel(delay, Some(&self.ctx.stop)).await.is_err() {
                            return Ok(ItemOutcome::Stopped);
                        }
                    },
                    None => {
                        warn!(key = %key, error = %err, "Upload abandoned; item will be redelivered");
                        self.ctx.stats.record_abandoned();
                        return Ok(ItemOutcome::Abandoned);
                    },
                },
                ErrorClass::Fatal => return Err(err),
            }
        }

        if !self.acknowledge(item).await {
            return Ok(ItemOutcome::Stopped);
        }
        self.ctx.stats.record_uploaded();
        Ok(ItemOutcome::Uploaded)
    }

    async fn attempt(
        &self,
        item: &WorkItem,
        task: &TaskMessage,
        key: &str,
        coord: &TileCoord,
        rendered: &mut Option<Vec<u8>>,
    ) -> Result<()> {
        let body = match rendered {
            Some(body) => body.clone(),
            None => {
                let body = self.ctx.plugins.render(coord).await?;
                *rendered = Some(body.clone());
                body
            },
        };

        let request = UploadRequest {
            key: key.to_string(),
            body,
            metadata: self.metadata(item, task),
        };
        with_timeout(
            "put_object",
            self.ctx.settings.upload_timeout,
            self.ctx.store.put_object(request),
        )
        .await
    }

    fn metadata(&self, item: &WorkItem, task: &TaskMessage) -> HashMap<String, String> {
        let job = json!({
            "chunk_key": task.chunk_key,
            "ingest_job": self.ctx.job_id.as_str(),
            "parameters": self.ctx.parameters,
        });
        HashMap::from([
            ("message_id".to_string(), item.message_id.clone()),
            ("receipt_handle".to_string(), item.receipt_handle.clone()),
            ("metadata".to_string(), job.to_string()),
        ])
    }

    /// Delete the item unless the job has been cancelled. Returns whether the gate admitted it.
    async fn acknowledge(&self, item: &WorkItem) -> bool {
        let gate = self.ctx.controller.delete_gate();
        let Some(_permit) = gate.acquire().await else {
            debug!("Delete gate closed, leaving item");
            return false;
        };

        let result = retry(&self.ctx.settings.item_retry, "delete", None, || {
            self.ctx.queue.delete(item)
        })
        .await;
        if let Err(e) = result {
            // The object is already written; redelivery will overwrite it
            warn!(error = %e, "Could not delete work item");
        }
        true
    }

    async fn skip(&self, item: &WorkItem, reason: &IngestError) -> Result<ItemOutcome> {
        warn!(reason = %reason, "Skipping unrecoverable work item");
        if !self.acknowledge(item).await {
            return Ok(ItemOutcome::Stopped);
        }
        self.ctx.stats.record_skipped();
        Ok(ItemOutcome::Skipped)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::{tests::tile_config_json, JobConfig};
    use crate::connector::ResourceConnector;
    use crate::controller::{ControllerSettings, JobController};
    use crate::memory::{FailureKind, MemoryBackend, MemoryConnector, MemoryQueue};
    use crate::plugins::PluginRegistry;
    use crate::queue::WorkQueue;
    use crate::retry::RetryPolicy;
    use crate::types::JobStatus;
    use std::time::Duration;

    struct Harness {
        backend: Arc<MemoryBackend>,
        queue: Arc<MemoryQueue>,
        worker: UploadWorker,
        ctx: Arc<WorkerContext>,
    }

    async fn harness() -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let config = JobConfig::from_json(&tile_config_json()).unwrap();
        let controller = Arc::new(JobController::new(backend.clone(), ControllerSettings::default()));
        let job = controller.create(&config).await.unwrap();
        let session = controller.session().unwrap();

        let settings = EngineSettings {
            item_retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 3),
            operation_retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 3),
            idle_delay: Duration::from_millis(1),
            max_idle_polls: 2,
            ..EngineSettings::default()
        };
        let credentials = Arc::new(CredentialManager::new(
            job.id.clone(),
            backend.clone() as Arc<dyn Backend>,
            session.credentials.clone(),
            settings.credential_retry,
            settings.network_timeout,
            settings.credential_lifetime,
        ));
        let connector = MemoryConnector::new(backend.clone());
        let queue = backend.queue(&job.id).unwrap();
        let store = connector
            .connect_store(&session.bucket, credentials.clone())
            .await
            .unwrap();
        let plugins = PluginRegistry::with_builtins().build(&config).unwrap();

        let ctx = Arc::new(WorkerContext {
            job_id: job.id.clone(),
            ingest_type: job.ingest_type,
            parameters: session.parameters.clone(),
            queue: QueueClient::new(queue.clone() as Arc<dyn WorkQueue>, Duration::from_secs(5)),
            store,
            credentials,
            plugins: Arc::new(plugins),
            stop: controller.stop_token(),
            controller,
            settings: Arc::new(settings),
            stats: Arc::new(PoolStats::default()),
            exit_when_idle: true,
        });
        Harness {
            backend,
            queue,
            worker: UploadWorker::new(0, ctx.clone()),
            ctx,
        }
    }

    async fn lease_one(h: &Harness) -> WorkItem {
        h.queue
            .dequeue(1, Duration::from_secs(60))
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_item_uploaded_and_acknowledged() {
        let h = harness().await;
        let item = lease_one(&h).await;
        assert_eq!(h.worker.process_item(&item).await.unwrap(), ItemOutcome::Uploaded);

        let task = TaskMessage::parse(&item.body).unwrap();
        let stored = h.backend.store().get(task.tile_key.as_deref().unwrap()).unwrap();
        assert!(!stored.body.is_empty());
        assert_eq!(stored.metadata["message_id"], item.message_id);
        let meta: Value = serde_json::from_str(&stored.metadata["metadata"]).unwrap();
        assert_eq!(meta["chunk_key"], task.chunk_key);
        assert_eq!(meta["ingest_job"], h.ctx.job_id.as_str());
        assert_eq!(h.queue.len(), 511);
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let h = harness().await;
        h.queue.purge();
        h.queue.push("not json");
        let item = lease_one(&h).await;
        assert_eq!(h.worker.process_item(&item).await.unwrap(), ItemOutcome::Skipped);
        assert!(h.queue.is_empty());
        assert_eq!(h.ctx.stats.snapshot().skipped, 1);
        assert_eq!(h.ctx.controller.status(), Some(JobStatus::Uploading));
    }

    #[tokio::test]
    async fn test_permanent_store_error_skips_without_failing_job() {
        let h = harness().await;
        h.backend.store().fail_next(FailureKind::Permanent, 1);
        let item = lease_one(&h).await;
        assert_eq!(h.worker.process_item(&item).await.unwrap(), ItemOutcome::Skipped);
        assert_eq!(h.queue.delete_count(), 1);
        assert_eq!(h.backend.store().object_count(), 0);
        assert_eq!(h.ctx.controller.status(), Some(JobStatus::Uploading));
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let h = harness().await;
        h.backend.store().fail_next(FailureKind::Transient, 2);
        let item = lease_one(&h).await;
        assert_eq!(h.worker.process_item(&item).await.unwrap(), ItemOutcome::Uploaded);
        assert_eq!(h.ctx.stats.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_transient_errors_abandon_item() {
        let h = harness().await;
        h.backend.store().fail_next(FailureKind::Transient, 10);
        let item = lease_one(&h).await;
        assert_eq!(h.worker.process_item(&item).await.unwrap(), ItemOutcome::Abandoned);
        assert_eq!(h.queue.len(), 512);
        assert_eq!(h.queue.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_authorization_failure_renews_once_and_retries() {
        let h = harness().await;
        let issued = h.backend.credential_issues();
        h.backend
            .store()
            .revoke(h.ctx.credentials.current().credentials.access_key.clone());
        let item = lease_one(&h).await;
        assert_eq!(h.worker.process_item(&item).await.unwrap(), ItemOutcome::Uploaded);
        assert_eq!(h.backend.credential_issues(), issued + 1);
        assert_eq!(h.ctx.credentials.current().generation, 1);
    }

    #[tokio::test]
    async fn test_closed_gate_blocks_delete() {
        let h = harness().await;
        let item = lease_one(&h).await;
        h.ctx.controller.delete_gate().close().await;
        assert_eq!(h.worker.process_item(&item).await.unwrap(), ItemOutcome::Stopped);
        assert_eq!(h.queue.delete_calls(), 0);
        // Written but never acknowledged, so not reported as uploaded
        assert_eq!(h.backend.store().put_count(), 1);
        assert_eq!(h.ctx.stats.snapshot().uploaded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_item_overwrites_same_object() {
        let h = harness().await;
        let lease = Duration::from_secs(30);
        let first = h.queue.dequeue(1, lease).await.unwrap().remove(0);
        tokio::time::advance(lease + Duration::from_secs(1)).await;
        let second = h.queue.dequeue(1, lease).await.unwrap().remove(0);
        assert_eq!(second.message_id, first.message_id);

        // The first lease lapsed, so its delete is a no-op and the item stays queued
        assert_eq!(h.worker.process_item(&first).await.unwrap(), ItemOutcome::Uploaded);
        assert_eq!(h.queue.len(), 512);
        let key = TaskMessage::parse(&first.body).unwrap().tile_key.unwrap();
        let written = h.backend.store().get(&key).unwrap().body;

        assert_eq!(h.worker.process_item(&second).await.unwrap(), ItemOutcome::Uploaded);
        assert_eq!(h.queue.len(), 511);
        assert_eq!(h.backend.store().put_count(), 2);
        assert_eq!(h.backend.store().object_count(), 1);
        assert_eq!(h.backend.store().get(&key).unwrap().body, written);
        assert_eq!(h.backend.get_uploaded_count(&h.ctx.job_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_exits_when_idle() {
        let h = harness().await;
        h.queue.purge();
        for _ in 0..3 {
            h.queue.push("garbage");
        }
        let Harness { worker, ctx, .. } = h;
        worker.run().await.unwrap();
        assert_eq!(ctx.stats.snapshot().skipped, 3);
    }

    #[tokio::test]
    async fn test_dequeue_outage_is_fatal() {
        let h = harness().await;
        h.queue.fail_dequeues(10);
        let err = h.worker.run().await.unwrap_err();
        assert!(matches!(err, IngestError::QueueUnavailable(_)));
    }
}
