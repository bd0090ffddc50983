use super::{sdk_credentials, sdk_error, AwsSettings, ClientCache};
use crate::credentials::CredentialManager;
use crate::error::{IngestError, Result};
use crate::queue::WorkQueue;
use crate::types::{Credentials, WorkItem};
use async_trait::async_trait;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::error::ProvideErrorMetadata;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// SQS caps a single receive at ten messages and a long poll at twenty seconds
const MAX_RECEIVE: u32 = 10;
const MAX_WAIT_SECS: u64 = 20;

pub struct SqsQueue {
    queue_url: String,
    credentials: Arc<CredentialManager>,
    settings: AwsSettings,
    receive_wait: Duration,
    clients: ClientCache<Client>,
}

impl SqsQueue {
    pub fn new(
        queue_url: impl Into<String>,
        credentials: Arc<CredentialManager>,
        settings: AwsSettings,
        receive_wait: Duration,
    ) -> Self {
        Self {
            queue_url: queue_url.into(),
            credentials,
            settings,
            receive_wait,
            clients: ClientCache::new(),
        }
    }

    fn client(&self) -> Client {
        let snapshot = self.credentials.current();
        self.clients.get(&snapshot, |creds| build_client(creds, &self.settings))
    }
}

fn build_client(credentials: &Credentials, settings: &AwsSettings) -> Client {
    let mut builder = aws_sdk_sqs::Config::builder()
        .credentials_provider(sdk_credentials(credentials))
        .region(Region::new(settings.region.clone()));
    if let Some(endpoint) = &settings.endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    debug!(region = %settings.region, "Building SQS client");
    Client::from_conf(builder.build())
}

/// Receive parameters clamped to what SQS accepts: (max messages, visibility secs, wait secs)
fn receive_limits(max_items: u32, visibility_timeout: Duration, wait: Duration) -> (i32, i32, i32) {
    let max = max_items.clamp(1, MAX_RECEIVE) as i32;
    let visibility = visibility_timeout.as_secs().min(i32::MAX as u64) as i32;
    let wait = wait.as_secs().min(MAX_WAIT_SECS) as i32;
    (max, visibility, wait)
}

/// Visible plus in-flight messages
fn depth_from_attributes(attributes: Option<&HashMap<QueueAttributeName, String>>) -> Result<u64> {
    let attributes =
        attributes.ok_or_else(|| IngestError::queue("queue attributes missing from response"))?;
    let read = |name: &QueueAttributeName| -> Result<u64> {
        match attributes.get(name) {
            Some(value) => value
                .parse::<u64>()
                .map_err(|e| IngestError::queue(format!("bad {name:?} value '{value}': {e}"))),
            None => Ok(0),
        }
    };
    Ok(read(&QueueAttributeName::ApproximateNumberOfMessages)?
        + read(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible)?)
}

fn is_stale_receipt(code: Option<&str>) -> bool {
    code.is_some_and(|c| c.ends_with("ReceiptHandleIsInvalid"))
}

#[async_trait]
impl WorkQueue for SqsQueue {
    #[instrument(skip(self), fields(queue = %self.queue_url))]
    async fn dequeue(&self, max_items: u32, visibility_timeout: Duration) -> Result<Vec<WorkItem>> {
        let (max, visibility, wait) = receive_limits(max_items, visibility_timeout, self.receive_wait);
        let output = self
            .client()
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max)
            .visibility_timeout(visibility)
            .wait_time_seconds(wait)
            .send()
            .await
            .map_err(|e| sdk_error("receive_message", e))?;

        let lease_deadline = Utc::now() + chrono::Duration::seconds(i64::from(visibility));
        let items = output
            .messages()
            .iter()
            .filter_map(|m| {
                Some(WorkItem {
                    message_id: m.message_id()?.to_string(),
                    receipt_handle: m.receipt_handle()?.to_string(),
                    body: m.body().unwrap_or_default().to_string(),
                    lease_deadline,
                })
            })
            .collect();
        Ok(items)
    }

    #[instrument(skip(self, item), fields(message_id = %item.message_id))]
    async fn delete(&self, item: &WorkItem) -> Result<()> {
        match self
            .client()
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&item.receipt_handle)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_stale_receipt(e.code()) => {
                debug!("Receipt handle no longer valid, treating as deleted");
                Ok(())
            },
            Err(e) => Err(sdk_error("delete_message", e)),
        }
    }

    async fn approximate_depth(&self) -> Result<u64> {
        let output = self
            .client()
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| sdk_error("get_queue_attributes", e))?;
        depth_from_attributes(output.attributes())
    }
}
