//! Tessera Ingest Engine
//!
//! Moves a large, regularly gridded dataset into object storage. A backend
//! service registers the job and fills a lease-based work queue with one
//! message per tile or chunk; a pool of workers drains the queue, renders
//! each unit through pluggable processors and uploads it with short-lived
//! credentials. The job completes only once the queue has been observed
//! empty repeatedly and the backend has counted every unit.
//!
//! # Overview
//!
//! - **Lifecycle**: [`JobController`] owns the job's status and the signals
//!   that stop work on cancel, failure or completion
//! - **Workers**: [`WorkerPool`] of [`worker::UploadWorker`]s
//! - **Credentials**: [`CredentialManager`] serializes renewals
//! - **Completion**: [`CompletionDetector`]
//! - **Adapters**: [`HttpBackend`], [`aws::SqsQueue`], [`aws::S3ObjectStore`],
//!   and the in-process [`memory`] set used for tests and dry runs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera_engine::memory::{MemoryBackend, MemoryConnector};
//! use tessera_engine::{Engine, EngineSettings, JobConfig, PluginRegistry};
//!
//! # async fn example() -> tessera_engine::Result<()> {
//! let config = JobConfig::from_file("job.json")?;
//! let backend = Arc::new(MemoryBackend::new());
//! let engine = Engine::new(
//!     EngineSettings::default(),
//!     backend.clone(),
//!     Arc::new(MemoryConnector::new(backend)),
//!     PluginRegistry::with_builtins(),
//! )?;
//! let summary = engine.run(&config, None).await?;
//! println!("{} units uploaded", summary.stats.uploaded);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod aws;
pub mod backend;
pub mod completion;
pub mod config;
pub mod connector;
pub mod controller;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod keys;
pub mod memory;
pub mod monitor;
pub mod plugins;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod settings;
pub mod storage;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use backend::{Backend, HttpBackend, HttpBackendOptions};
pub use completion::{CompletionDetector, DetectorOutcome, DrainTracker};
pub use config::JobConfig;
pub use connector::ResourceConnector;
pub use controller::{CompletionRequest, JobController};
pub use credentials::CredentialManager;
pub use engine::{Engine, IngestSummary, RunOutcome};
pub use error::{ErrorClass, IngestError, Result};
pub use monitor::ProgressReport;
pub use plugins::PluginRegistry;
pub use pool::{StatsSnapshot, WorkerPool};
pub use queue::{QueueClient, WorkQueue};
pub use retry::RetryPolicy;
pub use settings::EngineSettings;
pub use storage::ObjectStore;
pub use types::{ChunkSize, Extent, IngestJob, IngestType, JobId, JobStatus, TileCoord};
