//! Object storage the rendered units are written to

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// One object write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub key: String,
    pub body: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object. Writing the same key twice overwrites, so retries are safe.
    async fn put_object(&self, request: UploadRequest) -> Result<()>;
}
