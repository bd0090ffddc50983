//! Opens queue and storage clients for a joined job

use crate::credentials::CredentialManager;
use crate::error::Result;
use crate::queue::WorkQueue;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Builds clients from the handles a backend returns. Clients read
/// credentials from the manager on each call so renewals apply without
/// reconnecting.
#[async_trait]
pub trait ResourceConnector: Send + Sync {
    async fn connect_queue(
        &self,
        handle: &str,
        credentials: Arc<CredentialManager>,
    ) -> Result<Arc<dyn WorkQueue>>;

    async fn connect_store(
        &self,
        bucket: &str,
        credentials: Arc<CredentialManager>,
    ) -> Result<Arc<dyn ObjectStore>>;
}
