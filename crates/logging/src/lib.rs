//! Logging for Fastpath
//!
//! Installs a global `tracing` subscriber from [`LogSettings`]. `RUST_LOG`
//! takes precedence over the configured level. Output goes to stderr in a
//! pretty or JSON format, and optionally to a file through a non-blocking
//! writer.

use std::path::Path;

use common::error::{Error, Result};
use pipeline_config::{LogFormat, LogSettings};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Keeps the file writer flushing until dropped
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Filter from `RUST_LOG`, falling back to `default_level`
pub fn build_filter(default_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level)
            .map_err(|e| Error::Config(format!("invalid log level {:?}: {}", default_level, e))),
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    }
}

fn file_layer(path: &Path) -> Result<(BoxedLayer, WorkerGuard)> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("log file {} has no file name", path.display())))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .boxed();
    Ok((layer, guard))
}

/// Installs the global subscriber
///
/// Fails with a configuration error if a global subscriber is already set.
pub fn init(settings: &LogSettings) -> Result<LoggingGuard> {
    let filter = build_filter(&settings.level)?;

    let mut layers = vec![stderr_layer(settings.format)];
    let mut file_guard = None;
    if let Some(path) = &settings.file {
        let (layer, guard) = file_layer(path)?;
        layers.push(layer);
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install log subscriber: {}", e)))?;

    Ok(LoggingGuard { _file: file_guard })
}
