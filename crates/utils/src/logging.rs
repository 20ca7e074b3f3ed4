//! provides logging helpers

use tracing::Subscriber;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Builds the `EnvFilter` shared by every binary: `INFO` unless `RUST_LOG` says otherwise.
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Human readable stderr layer, filtered by [`env_filter`].
pub fn get_fmt_layer<S>() -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter())
        .boxed()
}

/// initiate the global tracing subscriber
pub fn init() {
    registry().with(get_fmt_layer()).init();
}
