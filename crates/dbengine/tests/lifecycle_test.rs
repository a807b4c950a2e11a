//! Integration tests for compaction, retention and metadata log truncation
//! driven through the engine.

use alopex_dbengine::extent::datafile::datafile_path;
use alopex_dbengine::{
    CompactionConfig, Engine, EngineConfig, EngineError, ExtentConfig, MetadataLogConfig,
    MetricUuid, PageCacheConfig, RetentionConfig, SampleFlags, SyncMode, TimeRange,
};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &Path) -> EngineConfig {
    EngineConfig::new(dir)
        .with_cache(PageCacheConfig::default().with_max_points(10))
        .with_extent(ExtentConfig::default().with_sync_mode(SyncMode::None))
        .with_metalog(MetadataLogConfig::default().with_sync_mode(SyncMode::None))
        .with_lifecycle_interval(Duration::from_secs(3600))
}

fn append(engine: &Engine, uuid: MetricUuid, range: std::ops::Range<i64>) {
    for ts in range {
        engine
            .append_sample(uuid, ts, ts as f64, SampleFlags::exists())
            .unwrap();
    }
}

fn sample_count(engine: &Engine, uuid: MetricUuid) -> usize {
    engine
        .read_range(uuid, TimeRange::all())
        .map(|page| page.len())
        .sum()
}

fn metalog_segments(dir: &Path) -> usize {
    fs::read_dir(dir.join("metalog")).unwrap().count()
}

#[test]
fn test_compaction_drops_deleted_pages_and_truncates_metalog() {
    let temp_dir = TempDir::new().unwrap();
    let keep = MetricUuid::new_v4();
    let gone = MetricUuid::new_v4();
    {
        let engine = Engine::init(config(temp_dir.path())).unwrap();
        append(&engine, keep, 0..20);
        append(&engine, gone, 0..20);
        engine.flush().unwrap();
        engine.delete_dimension_by_uuid(gone).unwrap();
    }

    let engine = Engine::init(config(temp_dir.path())).unwrap();
    assert_eq!(engine.stats().pending_deletions, 1);
    assert_eq!(metalog_segments(temp_dir.path()), 2);
    append(&engine, keep, 20..30);
    engine.flush().unwrap();

    let result = engine.compact_now().unwrap();
    assert_eq!(result.files_compacted, vec![1]);
    assert_eq!(result.pages_rewritten, 2);
    assert_eq!(result.pages_dropped, 2);
    assert!(!datafile_path(temp_dir.path(), 1).exists());

    assert_eq!(sample_count(&engine, keep), 30);
    let stats = engine.stats();
    assert_eq!(stats.pending_deletions, 0);
    assert_eq!(metalog_segments(temp_dir.path()), 1);
    drop(engine);

    // The rewritten pages replay from the surviving pair.
    let engine = Engine::init(config(temp_dir.path())).unwrap();
    assert_eq!(sample_count(&engine, keep), 30);
    assert_eq!(sample_count(&engine, gone), 0);
}

#[test]
fn test_deletion_survives_metalog_truncation_across_restarts() {
    let temp_dir = TempDir::new().unwrap();
    let keep = MetricUuid::new_v4();
    let gone = MetricUuid::new_v4();
    {
        let engine = Engine::init(config(temp_dir.path())).unwrap();
        append(&engine, keep, 0..20);
        append(&engine, gone, 0..20);
        engine.flush().unwrap();
        engine.delete_dimension_by_uuid(gone).unwrap();
    }

    let sequence_before = {
        let engine = Engine::init(config(temp_dir.path())).unwrap();
        append(&engine, keep, 20..30);
        engine.flush().unwrap();
        assert_eq!(engine.compact_now().unwrap().files_compacted, vec![1]);
        // The segment holding the original tombstone is gone.
        assert_eq!(metalog_segments(temp_dir.path()), 1);
        assert!(engine.is_deleted(&gone));
        engine.stats().metalog_next_sequence
    };

    let engine = Engine::init(config(temp_dir.path())).unwrap();
    assert!(engine.is_deleted(&gone));
    assert!(matches!(
        engine.append_sample(gone, 100, 1.0, SampleFlags::exists()),
        Err(EngineError::UnknownMetric(uuid)) if uuid == gone
    ));
    assert_eq!(sample_count(&engine, gone), 0);
    assert_eq!(sample_count(&engine, keep), 30);
    assert!(engine.stats().metalog_next_sequence >= sequence_before);

    // A further lifecycle pass and restart keep the tombstone too.
    engine.compact_now().unwrap();
    drop(engine);
    let engine = Engine::init(config(temp_dir.path())).unwrap();
    assert!(engine.is_deleted(&gone));
    assert!(engine.stats().metalog_next_sequence >= sequence_before);
}

#[test]
fn test_live_pairs_are_not_compacted() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    {
        let engine = Engine::init(config(temp_dir.path())).unwrap();
        append(&engine, uuid, 0..50);
    }
    let engine = Engine::init(config(temp_dir.path()).with_compaction(
        CompactionConfig::default().with_min_live_ratio(0.9),
    ))
    .unwrap();
    let result = engine.compact_now().unwrap();
    assert!(result.files_compacted.is_empty());
    assert!(datafile_path(temp_dir.path(), 1).exists());
    assert_eq!(sample_count(&engine, uuid), 50);
}

#[test]
fn test_retention_drops_oldest_pairs() {
    let temp_dir = TempDir::new().unwrap();
    let uuid = MetricUuid::new_v4();
    let engine = Engine::init(
        config(temp_dir.path())
            .with_extent(
                ExtentConfig::default()
                    .with_sync_mode(SyncMode::None)
                    .with_max_file_size(1),
            )
            .with_retention(RetentionConfig::new(0)),
    )
    .unwrap();

    for round in 0..3i64 {
        append(&engine, uuid, round * 10..(round + 1) * 10);
        engine.flush().unwrap();
    }
    assert_eq!(engine.stats().data_files, 3);

    engine.compact_now().unwrap();
    assert_eq!(engine.stats().data_files, 1);
    assert!(!datafile_path(temp_dir.path(), 1).exists());
    assert!(!datafile_path(temp_dir.path(), 2).exists());

    let pages: Vec<_> = engine.read_range(uuid, TimeRange::all()).collect();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].start_time(), Some(20));
}
