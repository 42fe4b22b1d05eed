//! Structured logging setup with stderr and optional file output.
//!
//! Provides:
//! - Stderr output, keeping stdout free for command results
//! - An optional append-only log file (never rotated)
//! - Build-type conditional log levels
//! - Console-only fallback when the log file cannot be opened
//! - Environment variable override via QUARRY_LOG or RUST_LOG

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// File name used inside the log directory.
const LOG_FILE_NAME: &str = "quarry.log";

/// Logging configuration.
pub struct LogConfig {
    /// Directory for the log file; stderr only when `None`
    pub log_dir: Option<PathBuf>,
    /// Whether stderr is a terminal (enables ANSI colors)
    pub is_tty: bool,
    /// Optional custom log filter
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Stderr-only logging.
    pub fn stderr() -> Self {
        Self { log_dir: None, is_tty: atty::is(atty::Stream::Stderr), log_filter: None }
    }

    /// Also append to `log_dir/quarry.log`.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Guard that must be held for the lifetime of the application.
///
/// Dropping this guard flushes pending log entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Initialize logging with the given configuration.
///
/// If the log file cannot be opened, falls back to stderr only.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let Some(log_dir) = config.log_dir.as_ref() else {
        return init_stderr_logging(&config);
    };

    match init_file_logging(&config, log_dir) {
        Ok(guard) => LoggingGuard { _worker_guard: Some(guard) },
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {}. Using console only.", e);
            init_stderr_logging(&config)
        }
    }
}

/// Initialize stderr-only logging with defaults (convenience function).
pub fn init_logging_default() -> LoggingGuard {
    init_logging(LogConfig::stderr())
}

fn init_stderr_logging(config: &LogConfig) -> LoggingGuard {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(build_env_filter(config.log_filter.as_deref()))
        .with_ansi(config.is_tty)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    LoggingGuard { _worker_guard: None }
}

/// Initialize file + stderr logging.
fn init_file_logging(
    config: &LogConfig,
    log_dir: &Path,
) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_NAME)
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stderr = std::io::stderr.with_max_level(tracing::Level::INFO);
    let combined = stderr.and(non_blocking);

    tracing_subscriber::fmt()
        .with_writer(combined)
        .with_env_filter(build_env_filter(config.log_filter.as_deref()))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    Ok(guard)
}

/// Build the environment filter from config or defaults.
fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    // Priority: custom filter > QUARRY_LOG > RUST_LOG > default
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env("QUARRY_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Get the default log filter based on build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "info,quarry=debug,quarry_core=debug,tokio_postgres=warn,mysql_async=warn,russh=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "warn,quarry=info,quarry_core=info,tokio_postgres=warn,mysql_async=warn,russh=warn"
    }
}

/// Get the default log directory under the platform data dir.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("quarry"))
        .unwrap_or_else(|| PathBuf::from(".quarry"))
        .join("logs")
}
