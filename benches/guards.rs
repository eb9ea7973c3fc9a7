//! Benchmarks for the per-event guard checks
//!
//! Every observed change passes through path normalization, the echo cache
//! and the in-flight set before reaching the broker.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tandem::sync::{is_replay_needed, EchoGuard, InFlightPaths};
use tandem::types::{normalize_path, BackendId, ChangeKind, FileKind};

fn sample_paths(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("photos/{}/{}/img_{:05}.jpg", 2000 + i % 25, i % 12, i))
        .collect()
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize_path");
    let inputs = [
        ("clean", "photos/2024/summer/dog.jpg"),
        ("messy", "/photos//2024\\summer/./dog.jpg/"),
        ("deep", "a/b/c/d/e/f/g/h/i/j/k/l/m/n/o/p/q/r/s/t/file.txt"),
    ];
    for (name, input) in inputs {
        group.bench_with_input(BenchmarkId::new("input", name), &input, |b, input| {
            b.iter(|| normalize_path(black_box(input)))
        });
    }
    group.finish();
}

fn bench_echo_guard(c: &mut Criterion) {
    let mut group = c.benchmark_group("echo_guard");

    for size in [100, 10_000] {
        let guard = EchoGuard::new(Duration::from_secs(60));
        let backend = BackendId::new();
        let paths = sample_paths(size);
        for path in &paths {
            guard.record(backend, path);
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("hit", size), &paths, |b, paths| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % paths.len();
                guard.is_echo(backend, black_box(&paths[i]), ChangeKind::Modified)
            })
        });
        group.bench_with_input(BenchmarkId::new("miss_delete", size), &size, |b, _| {
            b.iter(|| {
                guard.is_echo(
                    backend,
                    black_box("music/2024/live/track_01.flac"),
                    ChangeKind::Deleted,
                )
            })
        });
    }
    group.finish();
}

fn bench_in_flight(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_flight");
    let paths = InFlightPaths::new();
    let _guards: Vec<_> = (0..64)
        .map(|i| paths.begin(format!("/mirror/busy/{i}")))
        .collect();
    let probe = PathBuf::from("/mirror/photos/2024/summer/dog.jpg");

    group.bench_function("contains_miss", |b| {
        b.iter(|| paths.contains(black_box(&probe)))
    });
    group.bench_function("begin_drop", |b| {
        b.iter(|| drop(paths.begin(black_box("/mirror/photos/dog.jpg"))))
    });
    group.finish();
}

fn bench_staleness(c: &mut Criterion) {
    let grace = chrono::Duration::seconds(5);
    let incoming = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
    let counterpart = Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap());

    c.bench_function("is_replay_needed", |b| {
        b.iter(|| {
            is_replay_needed(
                black_box(FileKind::File),
                black_box(incoming),
                black_box(counterpart),
                grace,
            )
        })
    });
}

criterion_group!(
    benches,
    bench_normalize,
    bench_echo_guard,
    bench_in_flight,
    bench_staleness
);
criterion_main!(benches);
