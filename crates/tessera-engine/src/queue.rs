//! Lease-based work queue
//!
//! Dequeue leases items for a visibility timeout. An item that is not
//! deleted before its lease lapses becomes visible again and is redelivered,
//! so every upload must tolerate running more than once.

use crate::error::Result;
use crate::retry::with_timeout;
use crate::types::WorkItem;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Lease up to `max_items`. An empty vec means nothing is visible right now.
    async fn dequeue(&self, max_items: u32, visibility_timeout: Duration) -> Result<Vec<WorkItem>>;

    /// Acknowledge an item. Deleting with an expired or already-used receipt succeeds.
    async fn delete(&self, item: &WorkItem) -> Result<()>;

    /// Approximate number of items still queued. May read zero while leases are outstanding.
    async fn approximate_depth(&self) -> Result<u64>;
}

/// Queue handle shared by workers, the completion detector and the monitor.
/// Bounds every call with a timeout.
#[derive(Clone)]
pub struct QueueClient {
    queue: Arc<dyn WorkQueue>,
    timeout: Duration,
}

impl QueueClient {
    pub fn new(queue: Arc<dyn WorkQueue>, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    #[instrument(skip(self))]
    pub async fn dequeue(&self, max_items: u32, visibility_timeout: Duration) -> Result<Vec<WorkItem>> {
        let items =
            with_timeout("dequeue", self.timeout, self.queue.dequeue(max_items, visibility_timeout))
                .await?;
        debug!(leased = items.len(), "Dequeued work items");
        Ok(items)
    }

    pub async fn delete(&self, item: &WorkItem) -> Result<()> {
        with_timeout("delete", self.timeout, self.queue.delete(item)).await
    }

    pub async fn approximate_depth(&self) -> Result<u64> {
        with_timeout("queue_depth", self.timeout, self.queue.approximate_depth()).await
    }
}
