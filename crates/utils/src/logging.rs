//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::Layer;

/// Default filter: INFO unless `RUST_LOG` says otherwise.
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Builds the fmt layer for operational logs.
///
/// Writes to stderr unless `log_path` is set, in which case a non-rotating
/// file appender is used and its guard is returned alongside the layer.
pub fn get_fmt_layer<S>(
    log_path: Option<String>,
) -> (Box<dyn Layer<S> + Send + Sync>, Option<WorkerGuard>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match log_path.as_deref().map(Path::new).and_then(split_path) {
        Some((dir, file)) => {
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (layer, Some(guard))
        }
        None => {
            let layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed();
            (layer, None)
        }
    }
}

fn split_path(path: &Path) -> Option<(&Path, &std::ffi::OsStr)> {
    let file = path.file_name()?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    Some((dir, file))
}

/// initiate the global tracing subscriber writing to stderr
pub fn init() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
}

/// initiate the global tracing subscriber writing to `log_file`
///
/// Used by processes whose stdout/stderr belong to someone else. The returned
/// guard must be held until exit so buffered lines are flushed. Fails when a
/// global subscriber is already installed.
pub fn init_to_file<P: AsRef<Path>>(log_file: P) -> Result<Option<WorkerGuard>, TryInitError> {
    let path = log_file.as_ref().to_string_lossy().into_owned();
    let (fmt_layer, guard) = get_fmt_layer(Some(path));
    registry()
        .with(fmt_layer.with_filter(env_filter()))
        .try_init()?;
    Ok(guard)
}
