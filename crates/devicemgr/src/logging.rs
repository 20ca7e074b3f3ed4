//! provides logging helpers

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// Logs always go to stderr. With `log_file`, they are also written to a file
/// rotated daily next to it; keep the returned guard alive to flush it.
pub(crate) fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let fmt_layer = utils::logging::get_fmt_layer();

    let Some(log_file) = log_file else {
        registry().with(fmt_layer).init();
        return Ok(None);
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = log_file
        .file_name()
        .and_then(|f| f.to_str())
        .context("log file must have a UTF-8 file name")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
        .context("failed to create rolling file appender")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let file_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(utils::logging::env_filter());

    registry().with(fmt_layer).with(file_layer).init();
    Ok(Some(file_guard))
}
