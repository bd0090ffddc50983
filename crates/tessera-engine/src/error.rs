//! Error taxonomy for the ingest engine
//!
//! Every failure the engine can observe maps onto one [`ErrorClass`]. Workers
//! and the controller decide what to do (retry, renew credentials, skip the
//! item, or fail the job) by class rather than by variant.

use crate::types::{JobId, JobStatus};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed or incomplete job configuration. Raised before any network call.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Ingest job {0} not found")]
    JobNotFound(JobId),

    #[error("Ingest job {job_id} is already {status}")]
    JobAlreadyComplete { job_id: JobId, status: JobStatus },

    /// Connection reset, timeout, throttling and similar
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Storage or queue rejected the current upload credentials
    #[error("Upload credentials rejected: {0}")]
    AuthorizationExpired(String),

    /// The item can never succeed (unreadable source, malformed key)
    #[error("Unrecoverable work item: {0}")]
    PermanentItem(String),

    #[error("Work queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Ingest backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend refused the API token itself
    #[error("Backend rejected the API token: {0}")]
    Unauthorized(String),

    #[error("Credential renewal failed after {attempts} attempts: {last_error}")]
    CredentialRenewalExhausted { attempts: u32, last_error: String },

    #[error("Cannot complete job {job_id}: {reason}")]
    PrematureCompletion { job_id: JobId, reason: String },

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Plugin error ({kind} '{name}'): {reason}")]
    Plugin {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Common(#[from] tessera_common::CommonError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How the engine reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff, bounded
    Transient,
    /// Renew credentials, then retry
    Authorization,
    /// Drop the work item and move on
    Permanent,
    /// Stop the job
    Fatal,
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::TransientNetwork(_)
            | IngestError::QueueUnavailable(_)
            | IngestError::BackendUnavailable(_)
            | IngestError::Timeout { .. }
            | IngestError::Io(_) => ErrorClass::Transient,
            IngestError::AuthorizationExpired(_) => ErrorClass::Authorization,
            IngestError::PermanentItem(_) | IngestError::Serialization(_) => ErrorClass::Permanent,
            IngestError::Configuration(_)
            | IngestError::JobNotFound(_)
            | IngestError::JobAlreadyComplete { .. }
            | IngestError::Unauthorized(_)
            | IngestError::CredentialRenewalExhausted { .. }
            | IngestError::PrematureCompletion { .. }
            | IngestError::InvalidTransition { .. }
            | IngestError::Plugin { .. }
            | IngestError::Cancelled
            | IngestError::Common(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentItem(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::AuthorizationExpired(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::QueueUnavailable(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn plugin(kind: &'static str, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Plugin {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }
}
