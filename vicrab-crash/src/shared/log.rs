// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logging for the normal-context half of the crate.
//!
//! Installation, the report store and the filter pipeline log through
//! `tracing`. Nothing that runs inside a crash handler may log this way; the
//! capture path only ever writes fixed-size lines with
//! [`crate::recording_tools::write_stderr`].

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Environment variable consulted for the filter directives.
pub const LOG_ENV_VAR: &str = "VICRAB_CRASH_LOG";

/// Log level for filtering log events.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogEventLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl From<LogEventLevel> for LevelFilter {
    fn from(level: LogEventLevel) -> Self {
        match level {
            LogEventLevel::Trace => LevelFilter::TRACE,
            LogEventLevel::Debug => LevelFilter::DEBUG,
            LogEventLevel::Info => LevelFilter::INFO,
            LogEventLevel::Warn => LevelFilter::WARN,
            LogEventLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Where log lines go.
#[derive(Debug, Clone)]
pub enum LogTarget {
    /// Compact human readable lines on stderr.
    Stderr,
    /// JSON lines in a daily rotated file `<directory>/<file_prefix>.<date>`.
    File {
        directory: PathBuf,
        file_prefix: String,
    },
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogEventLevel,
    pub target: LogTarget,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogEventLevel::Info,
            target: LogTarget::Stderr,
        }
    }
}

/// Keeps the background writer of a file target alive. Dropping it flushes
/// and stops the writer.
#[must_use]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Create environment filter, falling back to `level` when the environment
/// does not say anything.
fn env_filter(level: LogEventLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(LevelFilter::from(level).to_string().to_lowercase()))
}

/// Installs the global `tracing` subscriber.
///
/// Fails if a global subscriber was already set, which is the embedding
/// application's call to make.
pub fn init_logging(config: LogConfig) -> anyhow::Result<LogGuard> {
    let filter = env_filter(config.level);
    let (layer, worker): (Box<dyn Layer<Registry> + Send + Sync>, _) = match config.target {
        LogTarget::Stderr => (
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_target(true)
                .with_ansi(false)
                .boxed(),
            None,
        ),
        LogTarget::File {
            directory,
            file_prefix,
        } => {
            std::fs::create_dir_all(&directory)?;
            let appender = tracing_appender::rolling::daily(directory, file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                fmt::layer()
                    .with_writer(writer)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false)
                    .json()
                    .boxed(),
                Some(guard),
            )
        }
    };

    let subscriber = tracing_subscriber::registry().with(layer).with(filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {e}"))?;
    Ok(LogGuard { _worker: worker })
}
