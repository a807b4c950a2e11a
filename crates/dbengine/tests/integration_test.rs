//! Integration tests for the complete write path and crash recovery scenarios.
//!
//! These tests verify the full data lifecycle:
//! - append → page cache → extent + journal (full write path)
//! - restart → journal replay → reads from disk
//! - torn extents and deletions surviving restarts

use alopex_dbengine::extent::datafile::{datafile_path, journal_path, FILE_HEADER_SIZE};
use alopex_dbengine::extent::{DataFileSet, ExtentConfig, ExtentWriter};
use alopex_dbengine::{
    Chart, Dimension, Engine, EngineConfig, EngineError, MetadataLogConfig, MetricUuid, Page,
    PageCacheConfig, Sample, SampleFlags, SyncMode, TimeRange,
};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &Path, max_points: usize) -> EngineConfig {
    EngineConfig::new(dir)
        .with_cache(PageCacheConfig::default().with_max_points(max_points))
        .with_extent(ExtentConfig::default().with_sync_mode(SyncMode::None))
        .with_metalog(MetadataLogConfig::default().with_sync_mode(SyncMode::None))
        .with_lifecycle_interval(Duration::from_secs(3600))
}

fn append(engine: &Engine, uuid: MetricUuid, range: std::ops::Range<i64>) {
    for ts in range {
        engine
            .append_sample(uuid, ts, ts as f64 * 0.5, SampleFlags::exists())
            .unwrap();
    }
}

fn read_all(engine: &Engine, uuid: MetricUuid) -> Vec<Arc<Page>> {
    engine.read_range(uuid, TimeRange::all()).collect()
}

// ============================================================================
// Write path and replay
// ============================================================================

/// 1000 samples across a 512-point page boundary come back as two pages.
#[test]
fn test_page_boundary_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    {
        let engine = Engine::init(config(temp_dir.path(), 512)).unwrap();
        append(&engine, uuid, 0..1000);
        engine.flush().unwrap();
    }

    let engine = Engine::init(config(temp_dir.path(), 512)).unwrap();
    let pages = read_all(&engine, uuid);
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].len(), 512);
    assert_eq!(pages[1].len(), 488);
    assert_eq!(pages[1].start_time(), Some(512));
    assert_eq!(engine.recovery_report().journal_records, 2);
}

/// N pages written across M extents read back exactly, ordered, without
/// duplicates.
#[test]
fn test_pages_across_extents_read_back_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    {
        let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
        for chunk in 0..5 {
            append(&engine, uuid, chunk * 20..(chunk + 1) * 20);
            engine.flush().unwrap();
        }
        assert_eq!(engine.stats().pages_flushed, 10);
    }

    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    let pages = read_all(&engine, uuid);
    let starts: Vec<i64> = pages.iter().filter_map(|p| p.start_time()).collect();
    assert_eq!(starts, (0..10).map(|i| i * 10).collect::<Vec<_>>());

    let samples: Vec<Sample> = pages.iter().flat_map(|p| p.samples().to_vec()).collect();
    assert_eq!(samples.len(), 100);
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(sample.timestamp, i as i64);
        assert_eq!(sample.value, i as f64 * 0.5);
        assert!(sample.flags.is_exists());
    }

    // Second read is served from the cache and yields the same pages.
    let again = read_all(&engine, uuid);
    assert_eq!(again.len(), 10);
    assert_eq!(engine.stats().pages_loaded, 10);
}

/// Ranged reads only return overlapping pages.
#[test]
fn test_range_read_filters_pages() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    let uuid = MetricUuid::new_v4();
    append(&engine, uuid, 0..50);
    engine.flush().unwrap();

    let pages: Vec<_> = engine.read_range(uuid, TimeRange::new(15, 25)).collect();
    let starts: Vec<i64> = pages.iter().filter_map(|p| p.start_time()).collect();
    assert_eq!(starts, vec![10, 20]);
    let inside = pages
        .iter()
        .flat_map(|p| p.samples_in(TimeRange::new(15, 25)).copied().collect::<Vec<_>>())
        .count();
    assert_eq!(inside, 10);
}

/// Appends continue after the last durable timestamp on restart.
#[test]
fn test_out_of_order_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    {
        let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
        append(&engine, uuid, 0..10);
    }

    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    assert!(matches!(
        engine.append_sample(uuid, 9, 0.0, SampleFlags::exists()),
        Err(EngineError::OutOfOrderSample { last: 9, .. })
    ));
    engine
        .append_sample(uuid, 10, 0.0, SampleFlags::exists())
        .unwrap();
}

// ============================================================================
// Crash recovery
// ============================================================================

/// An extent cut in half is absent after replay while earlier extents stay
/// readable.
#[test]
fn test_torn_extent_absent_not_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    let data_path = datafile_path(temp_dir.path(), 1);
    let (first_end, second_end);
    {
        let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
        append(&engine, uuid, 0..10);
        engine.flush().unwrap();
        first_end = fs::metadata(&data_path).unwrap().len();
        append(&engine, uuid, 10..20);
        engine.flush().unwrap();
        second_end = fs::metadata(&data_path).unwrap().len();
    }

    // Simulate a crash in the middle of writing the second extent.
    let file = OpenOptions::new().write(true).open(&data_path).unwrap();
    file.set_len((first_end + second_end) / 2).unwrap();
    drop(file);

    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    let report = engine.recovery_report();
    assert_eq!(report.journals_truncated, 1);
    assert_eq!(report.data_files_trimmed, 1);
    assert_eq!(fs::metadata(&data_path).unwrap().len(), first_end);

    let pages = read_all(&engine, uuid);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].len(), 10);
    assert_eq!(engine.stats().corrupt_pages_skipped, 0);
}

/// Garbage after the last journal record is cut off.
#[test]
fn test_partial_journal_record_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    {
        let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
        append(&engine, uuid, 0..10);
        engine.flush().unwrap();
    }
    let journal = journal_path(temp_dir.path(), 1);
    let before = fs::metadata(&journal).unwrap().len();
    let mut bytes = fs::read(&journal).unwrap();
    bytes.extend_from_slice(&[0x5A; 20]);
    fs::write(&journal, bytes).unwrap();

    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    assert!(engine.recovery_report().had_repairs());
    assert_eq!(fs::metadata(&journal).unwrap().len(), before);
    assert_eq!(read_all(&engine, uuid).len(), 1);
}

/// Every restart opens a fresh pair and leaves earlier files alone.
#[test]
fn test_restart_opens_new_pair() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    for round in 0..3i64 {
        let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
        append(&engine, uuid, round * 10..(round + 1) * 10);
    }
    for file_id in 1..=3 {
        assert!(datafile_path(temp_dir.path(), file_id).exists());
        assert!(journal_path(temp_dir.path(), file_id).exists());
    }

    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    assert_eq!(engine.stats().data_files, 4);
    assert_eq!(read_all(&engine, uuid).len(), 3);
}

// ============================================================================
// Deletion
// ============================================================================

/// Deleted dimensions stay deleted across a restart even though their extents
/// are still on disk.
#[test]
fn test_delete_chart_then_restart() {
    let temp_dir = TempDir::new().unwrap();
    let chart = Chart::new("disk.sda")
        .with_dimension(Dimension::new("reads"))
        .with_dimension(Dimension::new("writes"));
    {
        let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
        for dim in &chart.dimensions {
            append(&engine, dim.uuid, 0..30);
        }
        engine.flush().unwrap();
        engine.commit_delete_chart(&chart).unwrap();
    }
    let data_len = fs::metadata(datafile_path(temp_dir.path(), 1)).unwrap().len();
    assert!(data_len > FILE_HEADER_SIZE);

    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    assert_eq!(engine.recovery_report().metalog_records, 3);
    for dim in &chart.dimensions {
        assert!(engine.is_deleted(&dim.uuid));
        assert_eq!(engine.read_range(dim.uuid, TimeRange::all()).count(), 0);
        assert!(matches!(
            engine.append_sample(dim.uuid, 100, 1.0, SampleFlags::exists()),
            Err(EngineError::UnknownMetric(uuid)) if uuid == dim.uuid
        ));
    }
}

/// Deleting a dimension twice succeeds and appends two records.
#[test]
fn test_delete_dimension_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    {
        let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
        engine.delete_dimension_by_uuid(uuid).unwrap();
        engine.delete_dimension_by_uuid(uuid).unwrap();
        assert_eq!(engine.stats().metalog_next_sequence, 3);
    }

    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    assert!(engine.is_deleted(&uuid));
    engine.delete_dimension_by_uuid(uuid).unwrap();
    assert_eq!(engine.stats().metalog_next_sequence, 4);
}

/// Data for a deleted metric written to a later file after the deletion is
/// still hidden on restart.
#[test]
fn test_deletion_wins_over_late_data() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    {
        let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
        append(&engine, uuid, 0..10);
        engine.flush().unwrap();
        engine.delete_dimension_by_uuid(uuid).unwrap();
    }

    // A page of the deleted metric lands in a newer pair.
    {
        let files = Arc::new(DataFileSet::new(temp_dir.path()));
        let mut writer = ExtentWriter::open(
            temp_dir.path(),
            ExtentConfig::default().with_sync_mode(SyncMode::None),
            files,
            50,
            1000,
        )
        .unwrap();
        let late = Page::from_samples(
            uuid,
            (100..110)
                .map(|ts| Sample::new(ts, 1.0, SampleFlags::exists()))
                .collect(),
        );
        writer.flush(&[Arc::new(late)]).unwrap();
    }

    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    assert_eq!(engine.recovery_report().journal_records, 2);
    assert!(engine.is_deleted(&uuid));
    assert_eq!(engine.read_range(uuid, TimeRange::all()).count(), 0);
}

/// Pages still waiting in the cache are dropped by a deletion and never
/// flushed.
#[test]
fn test_delete_drops_unflushed_pages() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    let uuid = MetricUuid::new_v4();
    let other = MetricUuid::new_v4();
    append(&engine, uuid, 0..35);
    append(&engine, other, 0..5);

    engine.delete_dimension_by_uuid(uuid).unwrap();
    engine.flush().unwrap();

    let stats = engine.stats();
    assert_eq!(stats.unflushed_pages, 0);
    assert_eq!(read_all(&engine, other).len(), 1);
    assert_eq!(engine.read_range(uuid, TimeRange::all()).count(), 0);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_appends_and_reads() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::init(config(temp_dir.path(), 16)).unwrap();
    let uuids: Vec<MetricUuid> = (0..8).map(|_| MetricUuid::new_v4()).collect();

    std::thread::scope(|scope| {
        for &uuid in &uuids {
            let engine = &engine;
            scope.spawn(move || {
                append(engine, uuid, 0..200);
                // Reads while other collectors keep appending.
                assert!(read_all(engine, uuid).iter().map(|p| p.len()).sum::<usize>() >= 200);
            });
        }
    });
    engine.flush().unwrap();

    for uuid in &uuids {
        let total: usize = read_all(&engine, *uuid).iter().map(|p| p.len()).sum();
        assert_eq!(total, 200);
    }
    assert_eq!(engine.stats().samples_appended, 1600);
}

/// A deletion racing with a collector leaves nothing behind, in memory or
/// after a restart.
#[test]
fn test_concurrent_append_and_delete() {
    let temp_dir = TempDir::new().unwrap();
    let uuids: Vec<MetricUuid> = (0..50).map(|_| MetricUuid::new_v4()).collect();
    {
        let engine = Engine::init(
            config(temp_dir.path(), 16).with_flush_interval(Duration::from_millis(1)),
        )
        .unwrap();
        for &uuid in &uuids {
            std::thread::scope(|scope| {
                let engine = &engine;
                scope.spawn(move || {
                    for ts in 0..500 {
                        match engine.append_sample(uuid, ts, 1.0, SampleFlags::exists()) {
                            Ok(()) => {}
                            Err(EngineError::UnknownMetric(_)) => break,
                            Err(e) => panic!("unexpected append error: {e}"),
                        }
                    }
                });
                scope.spawn(move || engine.delete_dimension_by_uuid(uuid).unwrap());
            });

            assert!(engine.is_deleted(&uuid));
            assert_eq!(engine.read_range(uuid, TimeRange::all()).count(), 0);
        }
        engine.flush().unwrap();
    }

    let engine = Engine::init(config(temp_dir.path(), 16)).unwrap();
    for &uuid in &uuids {
        assert!(engine.is_deleted(&uuid));
        assert_eq!(engine.read_range(uuid, TimeRange::all()).count(), 0);
        assert!(matches!(
            engine.append_sample(uuid, 1000, 1.0, SampleFlags::exists()),
            Err(EngineError::UnknownMetric(_))
        ));
    }
}

#[test]
fn test_operations_after_shutdown() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::init(config(temp_dir.path(), 10)).unwrap();
    let uuid = MetricUuid::new_v4();
    append(&engine, uuid, 0..5);
    engine.shutdown().unwrap();

    assert!(matches!(engine.flush(), Err(EngineError::ShutDown)));
    assert!(matches!(
        engine.delete_dimension_by_uuid(uuid),
        Err(EngineError::ShutDown)
    ));
    assert_eq!(read_all(&engine, uuid).len(), 1);
}
