//! Logging setup for embedding applications.
//!
//! The library itself only emits `tracing` events. An application calls
//! [`init_logging`] once to route them:
//! - to `<directory>/<file>` (truncated at start-up) through a non-blocking
//!   writer
//! - optionally to stdout with ANSI colors
//! - filtered by `RUST_LOG`, defaulting to `info`

use crate::config::LoggingSettings;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Errors from [`init_logging`].
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Keeps the file writer alive. Dropping it flushes and closes the log file.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
    path: PathBuf,
}

impl LoggingGuard {
    /// The log file being written.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Installs the global subscriber.
///
/// Fails if the log directory cannot be created, the previous log cannot be
/// cleared, or another subscriber is already installed.
pub fn init_logging(settings: &LoggingSettings, stdout: bool) -> Result<LoggingGuard, LoggingError> {
    let path = prepare_log_file(settings)?;

    let file_appender = tracing_appender::rolling::never(&settings.directory, &settings.file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE);

    let stdout_layer = stdout.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stdout)
            .with_ansi(true)
            .compact()
    });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        path,
    })
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Creates the directory and truncates the log file.
fn prepare_log_file(settings: &LoggingSettings) -> Result<PathBuf, LoggingError> {
    let path = settings.directory.join(&settings.file);
    let wrap = |source: io::Error| LoggingError::LogFile {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(&settings.directory).map_err(wrap)?;
    fs::write(&path, "").map_err(wrap)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> LoggingSettings {
        LoggingSettings {
            directory: dir.path().join("nested/logs"),
            file: "engine.log".to_string(),
        }
    }

    // init_logging installs a global subscriber, so the tests exercise the
    // file preparation on its own.

    #[test]
    fn test_prepare_creates_directory_and_file() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);

        let path = prepare_log_file(&settings).unwrap();
        assert_eq!(path, settings.directory.join("engine.log"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_prepare_clears_previous_log() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        fs::create_dir_all(&settings.directory).unwrap();
        fs::write(settings.directory.join("engine.log"), "old session").unwrap();

        let path = prepare_log_file(&settings).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "");
    }

    #[test]
    fn test_prepare_reports_unusable_directory() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let settings = LoggingSettings {
            directory: blocker.join("logs"),
            file: "engine.log".to_string(),
        };

        let err = prepare_log_file(&settings).unwrap_err();
        assert!(matches!(err, LoggingError::LogFile { .. }));
    }
}
