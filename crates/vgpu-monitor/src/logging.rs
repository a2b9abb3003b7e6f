//! Operational logs to stderr, usage lines to a rolling metrics file.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;

const METRICS_TARGET: &str = "metrics";

/// Writes the pre-encoded `msg` field of an event as one line.
struct LineFormatter;

#[derive(Default)]
struct MsgVisitor {
    line: Option<String>,
}

impl Visit for MsgVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "msg" {
            self.line = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "msg" {
            self.line = Some(format!("{value:?}"));
        }
    }
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MsgVisitor::default();
        event.record(&mut visitor);
        match visitor.line {
            Some(line) => writeln!(writer, "{}", line.trim_end()),
            None => Ok(()),
        }
    }
}

/// initiate the global tracing subscriber
pub fn init(metrics_file: &Path) -> anyhow::Result<WorkerGuard> {
    let (fmt_layer, _) = utils::logging::get_fmt_layer::<tracing_subscriber::Registry>(None);
    let fmt_layer = fmt_layer.with_filter(utils::logging::env_filter().and(
        filter::filter_fn(|metadata| metadata.target() != METRICS_TARGET),
    ));

    let dir = metrics_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = metrics_file
        .file_name()
        .and_then(|name| name.to_str())
        .context("metrics file has no file name")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
        .with_context(|| format!("failed to create metrics appender in {}", dir.display()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let metrics_layer = layer()
        .event_format(LineFormatter)
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() == METRICS_TARGET
        }));

    registry().with(fmt_layer).with(metrics_layer).try_init()?;
    Ok(file_guard)
}
