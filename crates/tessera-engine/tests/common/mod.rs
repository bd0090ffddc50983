//! Shared fixtures for engine integration tests
//!
//! Every test runs the real engine against the in-process backend, queue
//! and object store, usually on a paused tokio clock.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_engine::credentials::CredentialManager;
use tessera_engine::memory::{MemoryBackend, MemoryConnector};
use tessera_engine::storage::UploadRequest;
use tessera_engine::{
    Engine, EngineSettings, JobConfig, ObjectStore, PluginRegistry, ResourceConnector, Result,
    RetryPolicy, WorkQueue,
};
use tokio::sync::Notify;

/// Tile job over a 2048x2048 plane in 512px tiles, `z` slices deep
pub fn tile_config(z: u64) -> JobConfig {
    let value = json!({
        "schema": {"name": "boss-v0.2-schema", "validator": "BossValidatorV02"},
        "client": {
            "backend": {"name": "boss", "class": "BossBackend", "host": "api.example.org"},
            "path_processor": {"class": "ingest.plugins.TestPathProcessor", "params": {}},
            "tile_processor": {"class": "ingest.plugins.TestTileProcessor", "params": {"payload_bytes": 64}}
        },
        "database": {"collection": "col1", "experiment": "exp1", "channel": "ch1"},
        "ingest_job": {
            "resolution": 0,
            "extent": {"x": [0, 2048], "y": [0, 2048], "z": [0, z], "t": [0, 1]},
            "tile_size": {"x": 512, "y": 512, "z": 1, "t": 1}
        }
    });
    JobConfig::from_json(&value.to_string()).unwrap()
}

pub fn fast_settings(workers: usize) -> EngineSettings {
    EngineSettings {
        worker_count: workers,
        ramp_delay: Duration::from_millis(5),
        idle_delay: Duration::from_millis(100),
        max_idle_polls: 3,
        item_retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(80), 4),
        operation_retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(80), 4),
        completion_interval: Duration::from_secs(1),
        completion_zero_samples: 3,
        completion_max_unconfirmed: 5,
        progress_interval: Duration::from_secs(5),
        ..EngineSettings::default()
    }
}

pub fn memory_engine(backend: &Arc<MemoryBackend>, settings: EngineSettings) -> Engine {
    Engine::new(
        settings,
        backend.clone(),
        Arc::new(MemoryConnector::new(backend.clone())),
        PluginRegistry::with_builtins(),
    )
    .unwrap()
}

/// Object store that hangs on write number `block_at` and signals when it gets there
pub struct GatedStore {
    inner: Arc<dyn ObjectStore>,
    puts: AtomicU64,
    block_at: u64,
    reached: Arc<Notify>,
}

#[async_trait]
impl ObjectStore for GatedStore {
    async fn put_object(&self, request: UploadRequest) -> Result<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.block_at {
            self.reached.notify_one();
            std::future::pending::<()>().await;
        }
        self.inner.put_object(request).await
    }
}

pub struct GatedConnector {
    inner: MemoryConnector,
    block_at: u64,
    pub reached: Arc<Notify>,
}

impl GatedConnector {
    pub fn new(backend: Arc<MemoryBackend>, block_at: u64) -> Self {
        Self {
            inner: MemoryConnector::new(backend),
            block_at,
            reached: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl ResourceConnector for GatedConnector {
    async fn connect_queue(
        &self,
        handle: &str,
        credentials: Arc<CredentialManager>,
    ) -> Result<Arc<dyn WorkQueue>> {
        self.inner.connect_queue(handle, credentials).await
    }

    async fn connect_store(
        &self,
        bucket: &str,
        credentials: Arc<CredentialManager>,
    ) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(GatedStore {
            inner: self.inner.connect_store(bucket, credentials).await?,
            puts: AtomicU64::new(0),
            block_at: self.block_at,
            reached: self.reached.clone(),
        }))
    }
}
