use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_BYPASS, METRIC_COALESCED, METRIC_EVICT, METRIC_HIT, METRIC_MISS, METRIC_PRODUCE_MS,
    METRIC_PRODUCER_ERROR, METRIC_PURGED, METRIC_STALE, METRIC_STORE_ERROR,
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_HIT,
            Unit::Count,
            "Lookups answered from a fresh entry."
        );
        describe_counter!(
            METRIC_STALE,
            Unit::Count,
            "Lookups answered from a stale entry while a refresh runs."
        );
        describe_counter!(
            METRIC_MISS,
            Unit::Count,
            "Lookups that ran the producer themselves."
        );
        describe_counter!(
            METRIC_COALESCED,
            Unit::Count,
            "Lookups that joined a fill already in flight."
        );
        describe_counter!(
            METRIC_BYPASS,
            Unit::Count,
            "Lookups for uncacheable strategies."
        );
        describe_counter!(
            METRIC_EVICT,
            Unit::Count,
            "Entries evicted from the memory store due to capacity."
        );
        describe_counter!(
            METRIC_PRODUCER_ERROR,
            Unit::Count,
            "Producer failures, labelled by kind (error, timeout, panic)."
        );
        describe_counter!(
            METRIC_STORE_ERROR,
            Unit::Count,
            "Cache store or tag index operations that failed."
        );
        describe_counter!(
            METRIC_PURGED,
            Unit::Count,
            "Entries removed by purges, labelled by scope."
        );
        describe_histogram!(
            METRIC_PRODUCE_MS,
            Unit::Milliseconds,
            "Producer latency in milliseconds."
        );
    });
}
