//! Metrics.
//!
//! Instruments are created from the global meter provider, so they
//! are no-ops until [`initialize_metrics`] was called. Exported values
//! then show up in the [`prometheus`] default registry under the
//! `tidewater` namespace.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::new_view;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;

use crate::recovery::OperatorId;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> Result<(), opentelemetry::metrics::MetricsError> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("tidewater")
        .build()?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(new_view(
            Instrument::new().name("*duration*"), // Must match histogram name
            Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                boundaries: vec![
                    0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5,
                    5.0, 7.5, 10.0,
                ],
                record_min_max: true,
            }),
        )?)
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

pub(crate) fn operator_labels(operator: &OperatorId) -> Vec<KeyValue> {
    vec![KeyValue::new("operator", operator.to_string())]
}

/// Instruments recorded by a worker.
pub(crate) struct WorkerMetrics {
    pub(crate) labels: Vec<KeyValue>,
    pub(crate) window_duration: Histogram<f64>,
    pub(crate) backup_duration: Histogram<f64>,
    pub(crate) backups_failed: Counter<u64>,
}

impl WorkerMetrics {
    pub(crate) fn new(operator: &OperatorId) -> Self {
        let meter = global::meter("tidewater");
        Self {
            labels: operator_labels(operator),
            window_duration: meter
                .f64_histogram("window_duration_seconds")
                .with_description("time to process one window in seconds")
                .init(),
            backup_duration: meter
                .f64_histogram("backup_duration_seconds")
                .with_description("time to snapshot and persist a checkpoint in seconds")
                .init(),
            backups_failed: meter
                .u64_counter("backups_failed")
                .with_description("number of checkpoints that could not be persisted")
                .init(),
        }
    }
}

#[test]
fn timer_passes_result_through() {
    let metrics = WorkerMetrics::new(&OperatorId::new("op"));
    let res: Result<u8, ()> = with_timer!(metrics.backup_duration, metrics.labels, Ok(3));
    assert_eq!(res, Ok(3));
}
