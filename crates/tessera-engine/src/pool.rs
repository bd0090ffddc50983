//! Pool of concurrent upload workers

use crate::error::{IngestError, Result};
use crate::retry::sleep_or_cancel;
use crate::worker::{UploadWorker, WorkerContext};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Counters shared by every worker in a pool
#[derive(Debug, Default)]
pub struct PoolStats {
    uploaded: AtomicU64,
    skipped: AtomicU64,
    abandoned: AtomicU64,
    retries: AtomicU64,
    auth_refreshes: AtomicU64,
    dequeued: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uploaded: u64,
    pub skipped: u64,
    pub abandoned: u64,
    pub retries: u64,
    pub auth_refreshes: u64,
    pub dequeued: u64,
}

impl PoolStats {
    pub fn record_uploaded(&self) {
        self.uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_refresh(&self) {
        self.auth_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self, n: usize) {
        self.dequeued.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            auth_refreshes: self.auth_refreshes.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a pool once every worker has exited
#[derive(Debug)]
pub struct PoolReport {
    pub workers: usize,
    pub stats: StatsSnapshot,
    /// First fatal error raised by any worker
    pub error: Option<IngestError>,
}

pub struct WorkerPool {
    tasks: JoinSet<Result<()>>,
    ctx: Arc<WorkerContext>,
    workers: usize,
}

impl WorkerPool {
    /// Start `count` workers. Worker `i` waits `i * ramp` before its first poll.
    pub fn spawn(ctx: Arc<WorkerContext>, count: usize, ramp: Duration) -> Self {
        let mut tasks = JoinSet::new();
        for index in 0..count {
            let ctx = ctx.clone();
            let delay = ramp.saturating_mul(index as u32);
            tasks.spawn(async move {
                if sleep_or_cancel(delay, Some(&ctx.stop)).await.is_err() {
                    return Ok(());
                }
                let worker = UploadWorker::new(index, ctx.clone());
                match worker.run().await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        ctx.controller.fail(&e).await;
                        Err(e)
                    },
                }
            });
        }
        info!(workers = count, ramp_ms = ramp.as_millis() as u64, "Worker pool started");
        Self {
            tasks,
            ctx,
            workers: count,
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.ctx.stats.clone()
    }

    /// Wait for every worker to exit
    pub async fn join(mut self) -> PoolReport {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) => {
                    let e = IngestError::plugin(
                        "worker",
                        "upload",
                        format!("worker task aborted: {join_error}"),
                    );
                    self.ctx.controller.fail(&e).await;
                    Err(e)
                },
            };
            if let Err(e) = result {
                error!(error = %e, "Upload worker failed");
                first_error.get_or_insert(e);
            }
        }

        let stats = self.ctx.stats.snapshot();
        info!(
            uploaded = stats.uploaded,
            skipped = stats.skipped,
            abandoned = stats.abandoned,
            "Worker pool finished"
        );
        PoolReport {
            workers: self.workers,
            stats,
            error: first_error,
        }
    }
}
