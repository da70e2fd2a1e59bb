use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tallyd::agent::Agent;
use tallyd::clock::{Alignment, Clock};
use tallyd::collector::query::{rebin, Point};
use tallyd::collector::window::WindowLayout;
use tallyd::collector::Collector;
use tallyd::config::AgentConfig;
use tallyd::table::{Snapshot, Tick};
use tallyd::transport::{self, Command};

const T: i64 = 1_700_000_000;

fn alignment() -> Alignment {
    Alignment::from_secs(10).expect("alignment")
}

fn build_snapshot(keys: u32, base: i64) -> Snapshot {
    let table = (0..keys)
        .map(|key| {
            let ticks = (0..3)
                .map(|i| Tick {
                    time: base + i * 10,
                    sum: i64::from(key) + i,
                    count: 1 + i as u64,
                })
                .collect();
            (key, ticks)
        })
        .collect();
    Snapshot { table }
}

fn bench_ingest(c: &mut Criterion) {
    let agent = Agent::new(&AgentConfig::default(), alignment(), Clock::manual(T), None);
    let datagram = transport::encode(&Command::Add { key: 42, value: 7 });

    c.bench_function("agent/ingest_datagram", |b| {
        b.iter(|| agent.handle_datagram(black_box(&datagram)))
    });

    c.bench_function("agent/flush_1k_keys", |b| {
        b.iter(|| {
            for key in 0..1_000u32 {
                agent.ingest(key, 1);
            }
            black_box(agent.flush())
        })
    });
}

fn bench_merge(c: &mut Criterion) {
    let layout = WindowLayout {
        alignment: alignment(),
        left_span: 20,
        right_span: 10,
    };
    let collector = Collector::new(layout, Clock::manual(T), None);
    let snapshot = build_snapshot(1_000, T - 20);
    collector.merge_snapshot(&snapshot);

    c.bench_function("collector/merge_1k_keys", |b| {
        b.iter(|| black_box(collector.merge_snapshot(black_box(&snapshot))))
    });
}

fn bench_rebin(c: &mut Criterion) {
    // One day of 10s buckets.
    let points = vec![Point { sum: 3, count: 1 }; 8_640];
    let base = alignment();

    c.bench_function("query/rebin_day_to_minutes", |b| {
        b.iter(|| black_box(rebin(black_box(&points), T, base, 60)))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_ingest(c);
    bench_merge(c);
    bench_rebin(c);
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = bench_suite
}
criterion_main!(benches);
