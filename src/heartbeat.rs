//! Forwarding of heartbeat samples to monitoring sinks.
//!
//! The reporter holds no state of its own beyond what it needs to
//! turn cumulative drop counts into deltas: every tick it drains each
//! operator's ring and hands the samples on.

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::metrics::Counter;

use crate::context::ExecutionContext;
use crate::context::HeartbeatSample;
use crate::metrics::operator_labels;
use crate::recovery::OperatorId;

/// Samples drained from one operator in one tick.
#[derive(Debug, Clone)]
pub struct HeartbeatBatch {
    pub operator: OperatorId,
    pub samples: Vec<HeartbeatSample>,
    /// Samples lost to ring overflow since the previous batch.
    pub dropped: u64,
}

impl HeartbeatBatch {
    pub fn tuples(&self) -> u64 {
        self.samples.iter().map(|s| s.tuples).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.samples.iter().map(|s| s.bytes).sum()
    }
}

pub trait MonitoringSink: Send + Sync {
    fn forward(&self, batch: &HeartbeatBatch);
}

/// Logs a one-line summary of every batch.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl MonitoringSink for LoggingSink {
    fn forward(&self, batch: &HeartbeatBatch) {
        let last = batch.samples.last().map(|s| s.window_id);
        tracing::debug!(
            operator = %batch.operator,
            windows = batch.samples.len(),
            tuples = batch.tuples(),
            bytes = batch.bytes(),
            dropped = batch.dropped,
            "Heartbeat up to {last:?}"
        );
        if batch.dropped > 0 {
            tracing::warn!(
                "{} dropped {} heartbeat samples; reporter can't keep up",
                batch.operator,
                batch.dropped
            );
        }
    }
}

/// Adds every batch to OpenTelemetry counters.
pub struct MetricsSink {
    windows: Counter<u64>,
    tuples: Counter<u64>,
    bytes: Counter<u64>,
    dropped: Counter<u64>,
}

impl MetricsSink {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("tidewater");
        Self {
            windows: meter
                .u64_counter("windows_processed")
                .with_description("number of windows an operator has processed")
                .init(),
            tuples: meter
                .u64_counter("item_inp_count")
                .with_description("number of tuples an operator has processed")
                .init(),
            bytes: meter
                .u64_counter("bytes_processed")
                .with_description("number of bytes an operator has processed")
                .init(),
            dropped: meter
                .u64_counter("heartbeats_dropped")
                .with_description("number of heartbeat samples lost to ring overflow")
                .init(),
        }
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitoringSink for MetricsSink {
    fn forward(&self, batch: &HeartbeatBatch) {
        let labels = operator_labels(&batch.operator);
        self.windows.add(batch.samples.len() as u64, &labels);
        self.tuples.add(batch.tuples(), &labels);
        self.bytes.add(batch.bytes(), &labels);
        if batch.dropped > 0 {
            self.dropped.add(batch.dropped, &labels);
        }
    }
}

#[derive(Default)]
pub struct HeartbeatReporter {
    sinks: Vec<Arc<dyn MonitoringSink>>,
    /// Cumulative drop count last seen per operator.
    seen_dropped: HashMap<OperatorId, u64>,
}

impl HeartbeatReporter {
    pub fn new(sinks: Vec<Arc<dyn MonitoringSink>>) -> Self {
        Self {
            sinks,
            seen_dropped: HashMap::new(),
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn MonitoringSink>) {
        self.sinks.push(sink);
    }

    /// Drain every context and forward non-empty batches. Returns the
    /// number of samples forwarded.
    pub fn drain<'a>(&mut self, contexts: impl IntoIterator<Item = &'a ExecutionContext>) -> usize {
        let mut forwarded = 0;
        for ctx in contexts {
            let mut samples = Vec::new();
            ctx.drain_heartbeat_counters(&mut samples);

            let total = ctx.dropped_samples();
            let seen = self.seen_dropped.entry(ctx.operator().clone()).or_default();
            // A redeployed operator has a fresh context counting from 0.
            let dropped = if total >= *seen { total - *seen } else { total };
            *seen = total;

            if samples.is_empty() && dropped == 0 {
                continue;
            }
            forwarded += samples.len();
            let batch = HeartbeatBatch {
                operator: ctx.operator().clone(),
                samples,
                dropped,
            };
            for sink in &self.sinks {
                sink.forward(&batch);
            }
        }
        forwarded
    }
}

#[cfg(test)]
#[derive(Default)]
struct CollectingSink(parking_lot::Mutex<Vec<HeartbeatBatch>>);

#[cfg(test)]
impl MonitoringSink for CollectingSink {
    fn forward(&self, batch: &HeartbeatBatch) {
        self.0.lock().push(batch.clone());
    }
}

#[cfg(test)]
fn context(name: &str) -> ExecutionContext {
    use crate::attributes::AttributeStore;
    use crate::attributes::KeyRegistry;

    ExecutionContext::new(
        OperatorId::new(name),
        Arc::new(AttributeStore::new(Arc::new(KeyRegistry::new()))),
        std::time::Duration::from_millis(10),
    )
}

#[test]
fn forwards_drained_samples_per_operator() {
    use crate::window::WindowId;

    let sink = Arc::new(CollectingSink::default());
    let mut reporter = HeartbeatReporter::new(vec![
        sink.clone() as Arc<dyn MonitoringSink>,
        Arc::new(LoggingSink),
    ]);
    let a = context("a");
    let b = context("b");
    a.report(3, 30, WindowId::new(1, 1));
    a.report(2, 20, WindowId::new(1, 2));

    assert_eq!(reporter.drain([&a, &b]), 2);
    {
        let batches = sink.0.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].operator, OperatorId::new("a"));
        assert_eq!(batches[0].tuples(), 5);
        assert_eq!(batches[0].bytes(), 50);
    }

    // Nothing new, nothing forwarded.
    assert_eq!(reporter.drain([&a, &b]), 0);
    assert_eq!(sink.0.lock().len(), 1);
}

#[test]
fn dropped_counts_are_deltas() {
    use crate::context::HEARTBEAT_CAPACITY;
    use crate::window::WindowId;

    let sink = Arc::new(CollectingSink::default());
    let mut reporter = HeartbeatReporter::new(vec![sink.clone() as Arc<dyn MonitoringSink>]);
    let a = context("a");
    for seq in 0..(HEARTBEAT_CAPACITY as u32 + 3) {
        a.report(1, 1, WindowId::new(1, seq));
    }
    reporter.drain([&a]);
    for seq in 0..(HEARTBEAT_CAPACITY as u32 + 1) {
        a.report(1, 1, WindowId::new(2, seq));
    }
    reporter.drain([&a]);

    let dropped: Vec<_> = sink.0.lock().iter().map(|b| b.dropped).collect();
    assert_eq!(dropped, vec![3, 1]);
}

#[test]
fn metrics_sink_exports_through_prometheus() {
    use crate::window::WindowId;

    crate::metrics::initialize_metrics().unwrap();
    let sink = MetricsSink::new();
    let mut reporter = HeartbeatReporter::new(vec![Arc::new(sink) as Arc<dyn MonitoringSink>]);
    let a = context("exported");
    a.report(4, 40, WindowId::new(3, 1));
    reporter.drain([&a]);

    let families = prometheus::default_registry().gather();
    assert!(
        families
            .iter()
            .any(|family| family.get_name().contains("item_inp_count")),
        "{:?}",
        families.iter().map(|f| f.get_name()).collect::<Vec<_>>()
    );
}
