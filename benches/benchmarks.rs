use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use tidewater::attributes::{AttributeStore, KeyRegistry, OperatorScope};
use tidewater::buffer::{Next, StreamBuffer};
use tidewater::context::{HeartbeatRing, HeartbeatSample, HEARTBEAT_CAPACITY};
use tidewater::WindowId;

fn sample(seq: u32) -> HeartbeatSample {
    HeartbeatSample {
        window_id: WindowId::new(1, seq),
        tuples: 10,
        bytes: 100,
        recorded_at: Utc::now(),
    }
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("heartbeat");
    group.bench_function(BenchmarkId::new("push", "full ring"), |b| {
        let mut ring = HeartbeatRing::new(HEARTBEAT_CAPACITY);
        for seq in 0..HEARTBEAT_CAPACITY as u32 {
            ring.push(sample(seq));
        }
        let mut seq = 0;
        b.iter(|| {
            seq += 1;
            ring.push(sample(seq))
        });
    });
    group.finish();

    let mut group = c.benchmark_group("attributes");
    let registry = Arc::new(KeyRegistry::new());
    let key = registry
        .register::<OperatorScope, u64>("counter")
        .unwrap();
    let store = AttributeStore::new(registry);
    let slot = store.attr(&key).unwrap();
    slot.set(0);
    group.bench_function(BenchmarkId::new("compare_and_set", "uncontended"), |b| {
        b.iter(|| {
            let current = slot.get();
            let next = current.unwrap_or_default() + 1;
            slot.compare_and_set(current.as_ref(), next)
        });
    });
    group.bench_function(BenchmarkId::new("attr_value", "present"), |b| {
        b.iter(|| store.attr_value(&key, 7));
    });
    group.finish();

    let mut group = c.benchmark_group("buffer");
    group.bench_function(BenchmarkId::new("publish_then_read", "empty windows"), |b| {
        let buffer = StreamBuffer::new("bench");
        let mut window = WindowId::new(1, 0);
        b.iter(|| {
            window = window.next().unwrap_or(WindowId::new(1, 0));
            buffer.publish(window, Vec::new());
            let read = buffer.next_after(None, Duration::ZERO);
            buffer.purge_through(window);
            matches!(read, Next::Window(..))
        });
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
