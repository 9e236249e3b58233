use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigError, LoggerConfig};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error(transparent)]
    Level(#[from] ConfigError),

    #[error("Log file path '{0}' has no file name")]
    InvalidPath(PathBuf),

    #[error("Failed to open log file. Error: {0}")]
    File(#[from] InitError),

    #[error("Failed to install logger. Error: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber: compact output on stdout and, when a path
/// is configured, a plain copy of every line in that file. The returned guard
/// flushes the file writer on drop and must outlive all logging.
pub fn init(config: &LoggerConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let level = config.level_filter()?;

    let stdout = tracing_subscriber::fmt::layer()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    let (file, guard) = match config.file() {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(level)
        .with(stdout)
        .with(file)
        .try_init()?;
    Ok(guard)
}

/// Appender writing to exactly `path`, never rotated.
fn file_appender(path: &Path) -> Result<RollingFileAppender, LoggingError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidPath(path.to_path_buf()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy())
        .build(directory)?;
    Ok(appender)
}
