//! Benchmarks for the storage engine.
//!
//! Run with: cargo bench --package alopex-dbengine
//!
//! ## Benchmark Categories
//!
//! - **Gorilla Compression**: Page encode/decode
//! - **Extents**: Encoding many pages into one extent
//! - **Append Path**: Samples through the page cache
//! - **Flush / Read**: Extent writes and range reads

use alopex_dbengine::extent::format::{encode_extent, CompressionType};
use alopex_dbengine::page::CompressedBlock;
use alopex_dbengine::{
    Engine, EngineConfig, ExtentConfig, MetadataLogConfig, MetricUuid, Page, PageCacheConfig,
    Sample, SampleFlags, SyncMode, TimeRange,
};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Regular one second interval with a slowly varying value.
fn generate_typical_timeseries(count: usize) -> Vec<(i64, f64)> {
    let start_ts = 1_700_000_000_i64;
    let mut value = 50.0;
    (0..count)
        .map(|i| {
            value += (i as f64 * 0.1).sin() * 0.1;
            (start_ts + i as i64, value)
        })
        .collect()
}

fn page(uuid: MetricUuid, count: usize) -> Arc<Page> {
    Arc::new(Page::from_samples(
        uuid,
        generate_typical_timeseries(count)
            .into_iter()
            .map(|(ts, v)| Sample::new(ts, v, SampleFlags::exists()))
            .collect(),
    ))
}

fn engine_config(dir: &TempDir) -> EngineConfig {
    EngineConfig::new(dir.path())
        .with_extent(ExtentConfig::default().with_sync_mode(SyncMode::None))
        .with_metalog(MetadataLogConfig::default().with_sync_mode(SyncMode::None))
        .with_cache(PageCacheConfig::default().with_max_points(1024))
        .with_flush_interval(Duration::from_secs(3600))
        .with_lifecycle_interval(Duration::from_secs(3600))
}

fn bench_gorilla(c: &mut Criterion) {
    let points = generate_typical_timeseries(1024);
    let block = CompressedBlock::compress(&points);

    let mut group = c.benchmark_group("gorilla");
    group.throughput(Throughput::Elements(points.len() as u64));
    group.bench_function("compress_1k", |b| {
        b.iter(|| CompressedBlock::compress(black_box(&points)))
    });
    group.bench_function("decompress_1k", |b| b.iter(|| block.decompress()));
    group.finish();
}

fn bench_encode_extent(c: &mut Criterion) {
    let pages: Vec<Arc<Page>> = (0..64).map(|_| page(MetricUuid::new_v4(), 1024)).collect();

    let mut group = c.benchmark_group("extent");
    group.throughput(Throughput::Elements(64));
    for (name, compression) in [
        ("encode_64_pages_gorilla", CompressionType::Gorilla),
        ("encode_64_pages_raw", CompressionType::None),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| encode_extent(1, black_box(&pages), compression))
        });
    }
    group.finish();
}

fn bench_append(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = Engine::init(engine_config(&dir)).unwrap();
    let uuids: Vec<MetricUuid> = (0..100).map(|_| MetricUuid::new_v4()).collect();
    let mut ts = 0i64;

    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(uuids.len() as u64));
    group.bench_function("append_100_metrics", |b| {
        b.iter(|| {
            ts += 1;
            for uuid in &uuids {
                engine
                    .append_sample(*uuid, ts, ts as f64, SampleFlags::exists())
                    .unwrap();
            }
        })
    });
    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    c.bench_function("flush_100_pages", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let engine = Engine::init(engine_config(&dir)).unwrap();
                for _ in 0..100 {
                    let uuid = MetricUuid::new_v4();
                    for ts in 0..256 {
                        engine
                            .append_sample(uuid, ts, ts as f64, SampleFlags::exists())
                            .unwrap();
                    }
                }
                (dir, engine)
            },
            |(_dir, engine)| engine.flush().unwrap(),
            BatchSize::PerIteration,
        )
    });
}

fn bench_read_range(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    {
        let engine = Engine::init(engine_config(&dir)).unwrap();
        for ts in 0..16 * 1024 {
            engine
                .append_sample(uuid, ts, ts as f64, SampleFlags::exists())
                .unwrap();
        }
    }
    // Fresh handle so every page comes from disk on the first pass.
    let engine = Engine::init(engine_config(&dir)).unwrap();

    let mut group = c.benchmark_group("read");
    group.throughput(Throughput::Elements(16 * 1024));
    group.bench_function("read_range_16_pages", |b| {
        b.iter(|| {
            engine
                .read_range(uuid, TimeRange::all())
                .map(|page| page.len())
                .sum::<usize>()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_gorilla,
    bench_encode_extent,
    bench_append,
    bench_flush,
    bench_read_range
);
criterion_main!(benches);
