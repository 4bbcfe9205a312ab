//! Logging module for the AppVM launcher
//!
//! Provides structured logging with tracing, supporting JSON output for production
//! and pretty printing for development. Logs go to stderr so stdout stays free
//! for command output.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Parse a log level name, defaulting to INFO
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the logging/tracing system
pub fn init_logging(log_level: &str, log_file: Option<&Path>) -> Result<()> {
    let level = parse_level(log_level);

    // Build filter from level or RUST_LOG env var
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("appvm_launcher={level},appvm={level}")));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;

            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json()
                    .with_writer(file),
            )
        }
        None => None,
    };

    let stderr_layer = if atty::is(atty::Stream::Stderr) {
        // Development: pretty colored output
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .pretty()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        // Production: JSON output
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Check if a standard stream is a terminal
mod atty {
    pub enum Stream {
        Stderr,
    }

    pub fn is(stream: Stream) -> bool {
        #[cfg(unix)]
        {
            let fd = match stream {
                Stream::Stderr => libc::STDERR_FILENO,
            };
            unsafe { libc::isatty(fd) != 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = stream;
            false
        }
    }
}
