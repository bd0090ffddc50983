//! Logging configuration and initialization.
//!
//! Every Tessera binary routes diagnostics through `tracing`. This module
//! owns the subscriber setup so that console output, file output and the
//! JSON format behave the same everywhere.
//!
//! Console logs go to stderr. Stdout is reserved for progress bars and the
//! final run summary.
//!
//! # Example
//!
//! ```no_run
//! use tessera_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! let config = LogConfig::from_env()
//!     .unwrap_or_else(|_| LogConfig::builder().level(LogLevel::Warn).build());
//! let _guard = init_logging(&config).expect("logging");
//! tracing::info!(workers = 4, "Uploader started");
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_LOG_PREFIX: &str = "tessera";

/// Minimum severity that reaches the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "critical" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Where log lines are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(&self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(&self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" | "stderr" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            _ => Err(anyhow::anyhow!("Invalid log output: {}", s)),
        }
    }
}

impl fmt::Display for LogOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogOutput::Console => "console",
            LogOutput::File => "file",
            LogOutput::Both => "both",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// How log files are named and rotated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFile {
    /// `<dir>/<prefix>.YYYY-MM-DD`, rotated daily
    Daily { dir: PathBuf, prefix: String },
    /// A single file appended to for the life of the process
    Fixed(PathBuf),
}

impl Default for LogFile {
    fn default() -> Self {
        LogFile::Daily {
            dir: PathBuf::from(DEFAULT_LOG_DIR),
            prefix: DEFAULT_LOG_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file: LogFile,
    /// Extra directives such as `aws_smithy_runtime=warn,hyper=info`
    pub filter_directives: Option<String>,
    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            file: LogFile::default(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Load configuration from environment variables
    ///
    /// - `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`
    /// - `LOG_DIR`, `LOG_FILE_PREFIX` for daily files
    /// - `LOG_FILE` for a single fixed file (overrides the daily settings)
    /// - `LOG_FILTER`, `LOG_INCLUDE_LOCATION`, `LOG_INCLUDE_THREAD_IDS`, `LOG_INCLUDE_TARGETS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(level) = lookup("LOG_LEVEL") {
            config.level = level.parse()?;
        }
        if let Some(output) = lookup("LOG_OUTPUT") {
            config.output = output.parse()?;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            config.format = format.parse()?;
        }

        let dir = lookup("LOG_DIR");
        let prefix = lookup("LOG_FILE_PREFIX");
        if dir.is_some() || prefix.is_some() {
            config.file = LogFile::Daily {
                dir: dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
                prefix: prefix.unwrap_or_else(|| DEFAULT_LOG_PREFIX.to_string()),
            };
        }
        if let Some(path) = lookup("LOG_FILE") {
            config.file = LogFile::Fixed(PathBuf::from(path));
        }

        config.filter_directives = lookup("LOG_FILTER");
        let flag = |key: &str, default: bool| {
            lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        config.include_location = flag("LOG_INCLUDE_LOCATION", false);
        config.include_thread_ids = flag("LOG_INCLUDE_THREAD_IDS", false);
        config.include_targets = flag("LOG_INCLUDE_TARGETS", true);

        Ok(config)
    }

    /// Direct output to a single file in addition to the console
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = LogFile::Fixed(path.into());
        if self.output == LogOutput::Console {
            self.output = LogOutput::Both;
        }
        self
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter =
            EnvFilter::from_default_env().add_directive(self.level.to_tracing_level().into());
        if let Some(ref directives) = self.filter_directives {
            for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                filter = filter.add_directive(
                    directive
                        .parse()
                        .with_context(|| format!("Failed to parse filter directive '{}'", directive))?,
                );
            }
        }
        Ok(filter)
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn daily_file(mut self, dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.config.file = LogFile::Daily {
            dir: dir.into(),
            prefix: prefix.into(),
        };
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn include_location(mut self, include: bool) -> Self {
        self.config.include_location = include;
        self
    }

    pub fn include_thread_ids(mut self, include: bool) -> Self {
        self.config.include_thread_ids = include;
        self
    }

    pub fn include_targets(mut self, include: bool) -> Self {
        self.config.include_targets = include;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Keeps the background file writer alive. Dropping it flushes pending lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

type FilteredRegistry = tracing_subscriber::layer::Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync + 'static>;

/// Install the global subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.output.console() {
        layers.push(fmt_layer(config, std::io::stderr, true));
    }

    if config.output.file() {
        let appender = match &config.file {
            LogFile::Daily { dir, prefix } => {
                std::fs::create_dir_all(dir).context("Failed to create log directory")?;
                tracing_appender::rolling::daily(dir, prefix)
            },
            LogFile::Fixed(path) => {
                let (dir, name) = split_log_path(path)?;
                std::fs::create_dir_all(&dir).context("Failed to create log directory")?;
                tracing_appender::rolling::never(dir, name)
            },
        };
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config, writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _file: guard })
}

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

fn split_log_path(path: &Path) -> Result<(PathBuf, std::ffi::OsString)> {
    let name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?
        .to_os_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("critical".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_output_and_format_from_str() {
        assert_eq!("both".parse::<LogOutput>().unwrap(), LogOutput::Both);
        assert_eq!("stderr".parse::<LogOutput>().unwrap(), LogOutput::Console);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = LogConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.output, LogOutput::Console);
        assert_eq!(config.file, LogFile::default());
        assert!(config.include_targets);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = LogConfig::from_lookup(lookup(&[
            ("LOG_LEVEL", "debug"),
            ("LOG_OUTPUT", "file"),
            ("LOG_DIR", "/var/log/tessera"),
            ("LOG_INCLUDE_TARGETS", "false"),
        ]))
        .unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(
            config.file,
            LogFile::Daily {
                dir: PathBuf::from("/var/log/tessera"),
                prefix: "tessera".to_string()
            }
        );
        assert!(!config.include_targets);
    }

    #[test]
    fn test_fixed_file_overrides_daily() {
        let config = LogConfig::from_lookup(lookup(&[
            ("LOG_DIR", "/tmp"),
            ("LOG_FILE", "/tmp/run.log"),
        ]))
        .unwrap();
        assert_eq!(config.file, LogFile::Fixed(PathBuf::from("/tmp/run.log")));
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(LogConfig::from_lookup(lookup(&[("LOG_LEVEL", "verbose")])).is_err());
    }

    #[test]
    fn test_with_log_file_enables_both_outputs() {
        let config = LogConfig::builder()
            .level(LogLevel::Warn)
            .build()
            .with_log_file("ingest.log");
        assert_eq!(config.output, LogOutput::Both);
        assert_eq!(config.file, LogFile::Fixed(PathBuf::from("ingest.log")));
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("ingest.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "ingest.log");

        let (dir, name) = split_log_path(Path::new("/var/log/tessera/run.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/tessera"));
        assert_eq!(name, "run.log");

        assert!(split_log_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_bad_filter_directive() {
        let config = LogConfig::builder().filter_directives("tessera_engine=loudest").build();
        assert!(config.env_filter().is_err());
    }
}
