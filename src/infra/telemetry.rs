use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr so rendered output written to stdout stays clean.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagesnap_worker_starts_total",
            Unit::Count,
            "Total number of worker processes started."
        );
        describe_counter!(
            "pagesnap_worker_forced_kills_total",
            Unit::Count,
            "Total number of workers killed because shutdown could not acquire the exchange guard."
        );
        describe_counter!(
            "pagesnap_render_total",
            Unit::Count,
            "Total number of completed render exchanges, labelled by status."
        );
        describe_counter!(
            "pagesnap_render_timeouts_total",
            Unit::Count,
            "Total number of render exchanges that hit their response deadline."
        );
        describe_histogram!(
            "pagesnap_render_ms",
            Unit::Milliseconds,
            "Render exchange latency in milliseconds, including queueing on the exchange guard."
        );
    });
}
