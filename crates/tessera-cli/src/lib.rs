//! Tessera CLI Library
//!
//! Operator front end for the ingest engine.
//!
//! # Overview
//!
//! - **Upload**: create a job from a configuration file, or resume one with `--job-id`
//! - **Cancel**: stop a job and discard its remaining work (`--cancel`)
//! - **Complete**: finish a job uploaded with `--manual-complete` (`--complete`)
//! - **Dry runs**: `--local` runs against in-process queue, store and backend

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod app;
pub mod error;
pub mod estimate;
pub mod progress;
pub mod summary;
pub mod token;

pub use error::{CliError, Result};

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tessera_common::logging::{LogConfig, LogLevel};
use tessera_engine::{EngineSettings, JobId};

/// Tessera - upload tiled and volumetric image data through a managed ingest job
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Ingest job configuration file (JSON)
    pub config_file: Option<PathBuf>,

    /// Existing ingest job to resume, cancel or complete
    #[arg(short = 'j', long)]
    pub job_id: Option<String>,

    /// API token for the ingest service
    #[arg(short = 'a', long, env = "INTERN_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Cancel the job given by --job-id
    #[arg(short, long, requires = "job_id")]
    pub cancel: bool,

    /// Complete the job given by --job-id once its queue is empty
    #[arg(long, requires = "job_id", conflicts_with = "cancel")]
    pub complete: bool,

    /// Do not complete the job automatically when the queue drains
    #[arg(short, long, conflicts_with_all = ["cancel", "complete"])]
    pub manual_complete: bool,

    /// Skip all confirmation prompts
    #[arg(short, long)]
    pub force: bool,

    /// Number of concurrent upload workers
    #[arg(short = 'p', long = "processes-nb", visible_alias = "workers")]
    pub processes_nb: Option<usize>,

    /// Delay between successive worker starts, in milliseconds
    #[arg(long)]
    pub ramp_delay_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error). Defaults to LOG_LEVEL or warn.
    #[arg(short = 'v', long)]
    pub log_level: Option<String>,

    /// Also write logs to this file
    #[arg(short = 'l', long)]
    pub log_file: Option<PathBuf>,

    /// Run against in-process queue, object store and backend
    #[arg(long)]
    pub local: bool,

    /// Print the CLI reference as markdown
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}

impl Cli {
    pub fn job_id(&self) -> Option<JobId> {
        self.job_id.as_deref().map(JobId::from)
    }

    /// Apply flag overrides on top of environment-derived settings
    pub fn apply_overrides(&self, mut settings: EngineSettings) -> EngineSettings {
        if let Some(workers) = self.processes_nb {
            settings.worker_count = workers;
        }
        if let Some(ms) = self.ramp_delay_ms {
            settings.ramp_delay = Duration::from_millis(ms);
        }
        if self.manual_complete {
            settings.auto_complete = false;
        }
        settings
    }

    /// Logging from the environment, with --log-level and --log-file on top
    pub fn log_config(&self) -> Result<LogConfig> {
        let env_level = std::env::var("LOG_LEVEL").ok();
        let mut config = LogConfig::from_env().unwrap_or_default();
        config.level = match (&self.log_level, env_level) {
            (Some(level), _) => level
                .parse::<LogLevel>()
                .map_err(|e| CliError::Logging(e.to_string()))?,
            (None, Some(_)) => config.level,
            (None, None) => LogLevel::Warn,
        };
        if let Some(path) = &self.log_file {
            config = config.with_log_file(path);
        }
        Ok(config)
    }
}
