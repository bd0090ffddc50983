//! Ingest service the engine reports to
//!
//! The backend owns job records, hands out queue handles and scoped storage
//! credentials, and counts what has landed in storage. The engine never
//! assumes the backend is local; every call may fail transiently.

mod http;

pub use http::{HttpBackend, HttpBackendOptions};

use crate::config::JobConfig;
use crate::error::Result;
use crate::types::{Credentials, JobId, JobSession};
use async_trait::async_trait;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Register a new job and wait until it is ready to receive uploads
    async fn create_job(&self, config: &JobConfig) -> Result<JobSession>;

    /// Reattach to an existing job from its identifier alone
    async fn join_job(&self, job_id: &JobId) -> Result<JobSession>;

    /// Cancel a job and purge its remaining work
    async fn cancel_job(&self, job_id: &JobId) -> Result<()>;

    /// Mark a job complete
    async fn complete_job(&self, job_id: &JobId) -> Result<()>;

    /// Issue fresh storage credentials for a job
    async fn get_credentials(&self, job_id: &JobId) -> Result<Credentials>;

    /// Distinct work units the backend has seen land in storage
    async fn get_uploaded_count(&self, job_id: &JobId) -> Result<u64>;

    /// Work units the job is expected to contain
    async fn get_expected_count(&self, job_id: &JobId) -> Result<u64>;
}
