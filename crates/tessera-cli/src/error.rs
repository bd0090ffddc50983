//! Error types for the Tessera CLI
//!
//! Messages are shown to operators as-is, so each one says what to do next.

use tessera_engine::IngestError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Engine or backend failure
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// Invalid combination of flags
    #[error("Invalid arguments: {0}. Run 'tessera --help' for usage.")]
    Usage(String),

    /// No API token in the flags, the environment, or the intern config file
    #[error("No API token found. Pass --api-token, set INTERN_TOKEN, or add 'token' to the [Default] section of {0}.")]
    MissingToken(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// Interactive prompt could not be shown
    #[error("Prompt failed: {0}. Use --force to skip confirmations.")]
    Prompt(String),

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }
}

impl From<inquire::InquireError> for CliError {
    fn from(err: inquire::InquireError) -> Self {
        Self::Prompt(err.to_string())
    }
}
