//! Integration tests for the metadata log on-disk behavior.

use alopex_dbengine::metalog::{MetadataLog, RECORD_SIZE};
use alopex_dbengine::{
    Chart, Dimension, EngineError, MetadataLogConfig, MetadataRecord, MetricUuid, SyncMode,
    UuidIndex,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const SEGMENT_HEADER_SIZE: usize = 30;

fn config() -> MetadataLogConfig {
    MetadataLogConfig::default().with_sync_mode(SyncMode::None)
}

fn segments(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "mlog"))
        .collect();
    paths.sort();
    paths
}

#[test]
fn test_three_dimension_chart_writes_four_records() {
    let temp_dir = TempDir::new().unwrap();
    let chart = Chart::new("system.cpu")
        .with_dimension(Dimension::new("user"))
        .with_dimension(Dimension::new("system"))
        .with_dimension(Dimension::new("idle"));
    {
        let (log, _) =
            MetadataLog::init(temp_dir.path(), config(), Arc::new(UuidIndex::default())).unwrap();
        log.commit_delete_chart(&chart).unwrap();
    }

    let first = &segments(temp_dir.path())[0];
    assert_eq!(
        fs::metadata(first).unwrap().len() as usize,
        SEGMENT_HEADER_SIZE + 4 * RECORD_SIZE
    );

    let index = Arc::new(UuidIndex::default());
    let (_, replay) = MetadataLog::init(temp_dir.path(), config(), Arc::clone(&index)).unwrap();
    assert_eq!(replay.records.len(), 4);
    assert!(matches!(replay.records[0], MetadataRecord::DeleteChart { chart: id, .. } if id == chart.id));
    assert!(replay.records[1..]
        .iter()
        .all(|r| matches!(r, MetadataRecord::DeleteDimension { .. })));
    assert!(replay
        .records
        .windows(2)
        .all(|w| w[0].sequence() < w[1].sequence()));
    for dim in &chart.dimensions {
        assert!(index.is_deleted(&dim.uuid));
    }
}

#[test]
fn test_every_open_starts_a_new_segment() {
    let temp_dir = TempDir::new().unwrap();
    for _ in 0..3 {
        let (log, _) =
            MetadataLog::init(temp_dir.path(), config(), Arc::new(UuidIndex::default())).unwrap();
        log.delete_dimension_by_uuid(MetricUuid::new_v4()).unwrap();
    }
    assert_eq!(segments(temp_dir.path()).len(), 3);

    let (log, replay) =
        MetadataLog::init(temp_dir.path(), config(), Arc::new(UuidIndex::default())).unwrap();
    assert_eq!(replay.records.len(), 3);
    assert_eq!(log.next_sequence(), 4);
}

#[test]
fn test_torn_batch_keeps_earlier_events() {
    let temp_dir = TempDir::new().unwrap();
    let kept = MetricUuid::new_v4();
    let chart = Chart::new("apps.cpu")
        .with_dimension(Dimension::new("a"))
        .with_dimension(Dimension::new("b"));
    {
        let (log, _) =
            MetadataLog::init(temp_dir.path(), config(), Arc::new(UuidIndex::default())).unwrap();
        log.delete_dimension_by_uuid(kept).unwrap();
        log.commit_delete_chart(&chart).unwrap();
    }

    // Cut the chart batch in the middle of its second record.
    let path = &segments(temp_dir.path())[0];
    let len = SEGMENT_HEADER_SIZE + 2 * RECORD_SIZE + RECORD_SIZE / 2;
    let bytes = fs::read(path).unwrap();
    fs::write(path, &bytes[..len]).unwrap();

    let index = Arc::new(UuidIndex::default());
    let (log, replay) = MetadataLog::init(temp_dir.path(), config(), Arc::clone(&index)).unwrap();
    assert_eq!(replay.records.len(), 2);
    assert_eq!(replay.truncated_segments, 1);
    assert!(index.is_deleted(&kept));
    assert!(!index.is_deleted(&chart.dimensions[1].uuid));
    assert_eq!(log.next_sequence(), 3);
}

#[test]
fn test_unreadable_segment_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    {
        let (log, _) =
            MetadataLog::init(temp_dir.path(), config(), Arc::new(UuidIndex::default())).unwrap();
        log.delete_dimension_by_uuid(MetricUuid::new_v4()).unwrap();
    }
    let path = &segments(temp_dir.path())[0];
    let mut bytes = fs::read(path).unwrap();
    bytes[4] = 0xFF; // version
    fs::write(path, bytes).unwrap();

    let err = MetadataLog::init(temp_dir.path(), config(), Arc::new(UuidIndex::default()))
        .unwrap_err();
    assert!(matches!(err, EngineError::FatalInit { .. }));
}
