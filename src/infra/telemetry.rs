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
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
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

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cachet_store_hit_total",
            Unit::Count,
            "Total number of region lookups served from memory or the spill tier."
        );
        describe_counter!(
            "cachet_store_miss_total",
            Unit::Count,
            "Total number of region lookups that found nothing usable."
        );
        describe_counter!(
            "cachet_store_evict_total",
            Unit::Count,
            "Total number of in-memory evictions due to capacity."
        );
        describe_counter!(
            "cachet_store_spill_total",
            Unit::Count,
            "Total number of evicted entries written to the spill tier."
        );
        describe_counter!(
            "cachet_tier_error_total",
            Unit::Count,
            "Total number of spill tier failures recovered as a miss or no-op."
        );
        describe_counter!(
            "cachet_event_invalidated_total",
            Unit::Count,
            "Total number of entries removed by named events."
        );
        describe_counter!(
            "cachet_refresh_total",
            Unit::Count,
            "Total number of refresh cycles by outcome."
        );
        describe_histogram!(
            "cachet_refresh_duration_seconds",
            Unit::Seconds,
            "Refresh cycle latency in seconds."
        );
    });
}
