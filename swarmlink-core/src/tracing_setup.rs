//! Tracing setup for Swarmlink
//!
//! Console output follows the chosen level while a per-run log file captures
//! everything, so swarm churn can be reconstructed after the fact.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the trace-level log, overwritten on every run
pub const LOG_FILE_NAME: &str = "swarmlink-last-run.log";

/// Errors raised while installing the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("Cannot prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Installs console and file logging.
///
/// The console layer honours `RUST_LOG` when set, otherwise `console_level`.
/// The file layer writes every event to `<logs_dir>/swarmlink-last-run.log`
/// (`logs/` when no directory is given). Returns the log file path.
///
/// # Errors
/// - `TracingSetupError::LogFile` - Directory or file cannot be created
/// - `TracingSetupError::AlreadyInitialized` - Called twice in one process
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingSetupError> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    let log_file_path = logs_path.join(LOG_FILE_NAME);

    let log_file = create_dir_all(logs_path)
        .and_then(|_| File::create(&log_file_path))
        .map_err(|source| TracingSetupError::LogFile {
            path: log_file_path.clone(),
            source,
        })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={}, debug_file={}",
        console_level,
        log_file_path.display()
    );

    Ok(log_file_path)
}

/// Log levels selectable from a command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    /// Converts to the matching `tracing::Level`.
    ///
    /// ```
    /// use swarmlink_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Warn.as_tracing_level(), tracing::Level::WARN);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(CliLogLevel::Error),
            "warn" | "warning" => Ok(CliLogLevel::Warn),
            "info" => Ok(CliLogLevel::Info),
            "debug" => Ok(CliLogLevel::Debug),
            "trace" => Ok(CliLogLevel::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CliLogLevel::Error => "error",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Info => "info",
            CliLogLevel::Debug => "debug",
            CliLogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}
