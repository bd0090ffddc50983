//! Amazon SQS and S3 adapters
//!
//! Clients are built from the job's short-lived credentials and rebuilt
//! whenever the credential manager installs a new generation.

mod s3;
mod sqs;

pub use s3::S3ObjectStore;
pub use sqs::SqsQueue;

use crate::connector::ResourceConnector;
use crate::credentials::{CredentialManager, CredentialSnapshot};
use crate::error::{IngestError, Result};
use crate::queue::WorkQueue;
use crate::settings::EngineSettings;
use crate::storage::ObjectStore;
use crate::types::Credentials;
use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

const PROVIDER_NAME: &str = "tessera";

/// Error codes meaning the credentials themselves were refused
const AUTH_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
    "InvalidSecurity",
    "TokenRefreshRequired",
];

const THROTTLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "SlowDown",
    "RequestThrottled",
    "RequestTimeout",
    "ServiceUnavailable",
    "InternalError",
];

const MISSING_RESOURCE_CODES: &[&str] = &[
    "NoSuchBucket",
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
];

/// Region and optional endpoint override shared by both clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSettings {
    pub region: String,
    pub endpoint: Option<String>,
}

impl From<&EngineSettings> for AwsSettings {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            region: settings.aws_region.clone(),
            endpoint: settings.aws_endpoint.clone(),
        }
    }
}

pub(crate) fn sdk_credentials(credentials: &Credentials) -> aws_credential_types::Credentials {
    aws_credential_types::Credentials::new(
        credentials.access_key.clone(),
        credentials.secret_key.clone(),
        credentials.session_token.clone(),
        credentials.expires_at.map(SystemTime::from),
        PROVIDER_NAME,
    )
}

/// Map an AWS error code and HTTP status onto the engine's error classes
pub(crate) fn classify(operation: &str, code: Option<&str>, status: Option<u16>, detail: String) -> IngestError {
    let message = format!("{operation}: {detail}");
    match code {
        Some(code) if AUTH_CODES.contains(&code) => return IngestError::authorization(message),
        Some(code) if THROTTLE_CODES.contains(&code) => return IngestError::transient(message),
        Some(code) if MISSING_RESOURCE_CODES.contains(&code) => {
            return IngestError::configuration(message)
        },
        _ => {},
    }
    match status {
        Some(401 | 403) => IngestError::authorization(message),
        Some(404) => IngestError::configuration(message),
        Some(408 | 429) | Some(500..=599) | None => IngestError::transient(message),
        Some(_) => IngestError::permanent(message),
    }
}

pub(crate) fn sdk_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> IngestError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            IngestError::transient(format!("{operation}: {detail}"))
        },
        SdkError::ConstructionFailure(_) => {
            IngestError::configuration(format!("{operation}: {detail}"))
        },
        _ => classify(
            operation,
            err.code(),
            err.raw_response().map(|r| r.status().as_u16()),
            detail,
        ),
    }
}

/// One client per credential generation
pub(crate) struct ClientCache<C> {
    slot: Mutex<Option<(u64, C)>>,
}

impl<C: Clone> ClientCache<C> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn get(&self, snapshot: &CredentialSnapshot, build: impl FnOnce(&Credentials) -> C) -> C {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.as_ref() {
            Some((generation, client)) if *generation == snapshot.generation => client.clone(),
            _ => {
                let client = build(&snapshot.credentials);
                *slot = Some((snapshot.generation, client.clone()));
                client
            },
        }
    }
}

/// Connects job handles to SQS queues and S3 buckets
#[derive(Debug, Clone)]
pub struct AwsConnector {
    settings: AwsSettings,
    receive_wait: Duration,
}

impl AwsConnector {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            settings: AwsSettings::from(settings),
            receive_wait: settings.receive_wait,
        }
    }
}

#[async_trait]
impl ResourceConnector for AwsConnector {
    async fn connect_queue(
        &self,
        handle: &str,
        credentials: Arc<CredentialManager>,
    ) -> Result<Arc<dyn WorkQueue>> {
        if !handle.starts_with("http") {
            return Err(IngestError::configuration(format!(
                "upload queue handle is not an SQS URL: {handle}"
            )));
        }
        Ok(Arc::new(SqsQueue::new(
            handle,
            credentials,
            self.settings.clone(),
            self.receive_wait,
        )))
    }

    async fn connect_store(
        &self,
        bucket: &str,
        credentials: Arc<CredentialManager>,
    ) -> Result<Arc<dyn ObjectStore>> {
        if bucket.is_empty() {
            return Err(IngestError::configuration("job has no upload bucket"));
        }
        Ok(Arc::new(S3ObjectStore::new(bucket, credentials, self.settings.clone())))
    }
}
