//! Structured logging for the media pipeline
//!
//! This module provides functionality for:
//! 1. Console output filtered by `RUST_LOG` or the configured level
//! 2. A daily rotating log file written through a non-blocking writer
//! 3. JSON or line formatting for both sinks

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan, time::ChronoUtc},
    prelude::*,
};

use crate::config::Logging;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

pub type LoggerResult<T> = Result<T, LoggerError>;

pub const LOG_FILE_PREFIX: &str = "media_pipeline.log";

/// Install the global subscriber. The returned guard flushes the file writer on drop
/// and has to be kept alive for as long as the process logs.
pub fn init_logger(settings: &Logging, log_dir: &Path) -> LoggerResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let json = settings.log_format == "json";

    let console_layer = settings.log_to_terminal.then(|| {
        if json {
            fmt::layer().json().with_timer(ChronoUtc::rfc_3339()).boxed()
        } else {
            fmt::layer().with_timer(ChronoUtc::rfc_3339()).boxed()
        }
    });

    let mut guard = None;
    let file_layer = if settings.log_to_file {
        if !log_dir.exists() {
            std::fs::create_dir_all(log_dir)?;
        }
        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);

        Some(if json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_timer(ChronoUtc::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(ChronoUtc::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        })
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %settings.log_format,
        log_level = %settings.log_level,
        log_dir = %log_dir.display(),
        "Logger initialized"
    );

    Ok(guard)
}

/// Record a process level event (startup, shutdown, reload) with a common shape.
pub fn log_system_event(event_type: &str, details: &str) {
    info!(entry_type = "system", event_type, details, "System event: {}", event_type);
}
