//! Startup recovery: journals first, then the metadata log, then reconcile.
//!
//! ```text
//! ScanJournals → ScanMetadataLog → Reconcile → Ready
//! ```
//!
//! Journals are scanned in file-number order and cut at the first record that
//! fails its checksum or points at an invalid extent. Unreferenced bytes at the
//! end of a data file are trimmed. The index is then populated from the
//! surviving records, later files overriding earlier ones, and finally every
//! recovered deletion is applied on top.

use crate::error::{EngineError, Result};
use crate::extent::datafile::{datafile_path, journal_path, list_file_ids};
use crate::extent::journal::scan_journal;
use crate::extent::{DataFileSet, JournalScan};
use crate::index::UuidIndex;
use crate::metalog::{MetadataLog, MetadataLogConfig, MetadataRecord};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Recovery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Validating journal files against their data files.
    ScanJournals,
    /// Reading deletion events.
    ScanMetadataLog,
    /// Populating the index.
    Reconcile,
    /// Recovery finished.
    Ready,
}

/// What recovery found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Journal files scanned.
    pub journals_scanned: usize,
    /// Journal files whose tail was cut off.
    pub journals_truncated: usize,
    /// Valid journal records.
    pub journal_records: usize,
    /// Data files whose unreferenced tail was trimmed.
    pub data_files_trimmed: usize,
    /// Incomplete file pairs removed.
    pub orphan_pairs_removed: usize,
    /// Valid metadata log records.
    pub metalog_records: usize,
    /// Metadata log segments whose tail was cut off.
    pub metalog_truncated_segments: usize,
    /// Metadata log segments discarded after a damaged one.
    pub metalog_discarded_segments: usize,
    /// Metrics marked deleted during reconcile.
    pub deleted_metrics: usize,
}

impl RecoveryReport {
    /// Returns true if anything had to be repaired.
    pub fn had_repairs(&self) -> bool {
        self.journals_truncated
            + self.data_files_trimmed
            + self.orphan_pairs_removed
            + self.metalog_truncated_segments
            + self.metalog_discarded_segments
            > 0
    }
}

/// State handed to the engine once recovery is done.
#[derive(Debug)]
pub struct Recovered {
    /// Opened metadata log, positioned after the last valid record.
    pub metalog: MetadataLog,
    /// File number for the writer's first pair.
    pub next_file_id: u32,
    /// Identifier for the next extent.
    pub next_extent_id: u64,
    /// Deletion events replayed from the metadata log, in sequence order.
    pub deletions: Vec<MetadataRecord>,
    /// Summary of the run.
    pub report: RecoveryReport,
}

/// Drives recovery of one data directory.
#[derive(Debug)]
pub struct Recovery {
    data_dir: PathBuf,
    metalog_dir: PathBuf,
    metalog_config: MetadataLogConfig,
    files: Arc<DataFileSet>,
    index: Arc<UuidIndex>,
    state: RecoveryState,
    report: RecoveryReport,
    scans: Vec<JournalScan>,
    metalog: Option<MetadataLog>,
    metalog_records: Vec<MetadataRecord>,
    next_file_id: u32,
    next_extent_id: u64,
}

impl Recovery {
    /// Prepares recovery of `data_dir` and the metadata log in `metalog_dir`.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        metalog_dir: impl Into<PathBuf>,
        metalog_config: MetadataLogConfig,
        files: Arc<DataFileSet>,
        index: Arc<UuidIndex>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            metalog_dir: metalog_dir.into(),
            metalog_config,
            files,
            index,
            state: RecoveryState::ScanJournals,
            report: RecoveryReport::default(),
            scans: Vec::new(),
            metalog: None,
            metalog_records: Vec::new(),
            next_file_id: 1,
            next_extent_id: 1,
        }
    }

    /// Current phase.
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Runs every remaining phase.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::FatalInit` if any on-disk state cannot be opened
    /// or has an unrecognized header.
    pub fn run(mut self) -> Result<Recovered> {
        while self.state != RecoveryState::Ready {
            self.step()?;
        }

        let metalog = self.metalog.take().ok_or_else(|| {
            EngineError::fatal_init(&self.metalog_dir, "metadata log was not opened")
        })?;
        info!(
            journals = self.report.journals_scanned,
            journal_records = self.report.journal_records,
            metalog_records = self.report.metalog_records,
            deleted = self.report.deleted_metrics,
            repaired = self.report.had_repairs(),
            "recovery complete"
        );
        Ok(Recovered {
            metalog,
            next_file_id: self.next_file_id,
            next_extent_id: self.next_extent_id,
            deletions: std::mem::take(&mut self.metalog_records),
            report: self.report,
        })
    }

    /// Executes the current phase and advances to the next one.
    pub fn step(&mut self) -> Result<RecoveryState> {
        self.state = match self.state {
            RecoveryState::ScanJournals => {
                self.scan_journals()?;
                RecoveryState::ScanMetadataLog
            }
            RecoveryState::ScanMetadataLog => {
                self.scan_metadata_log()?;
                RecoveryState::Reconcile
            }
            RecoveryState::Reconcile => {
                self.reconcile();
                RecoveryState::Ready
            }
            RecoveryState::Ready => RecoveryState::Ready,
        };
        Ok(self.state)
    }

    fn scan_journals(&mut self) -> Result<()> {
        let dir = self.data_dir.clone();
        fs::create_dir_all(&dir).map_err(|e| EngineError::fatal_init(&dir, e))?;
        let ids = list_file_ids(&dir).map_err(|e| EngineError::fatal_init(&dir, e))?;

        for file_id in ids {
            self.next_file_id = self.next_file_id.max(file_id + 1);
            let data_path = datafile_path(&dir, file_id);
            let journal = journal_path(&dir, file_id);

            if !journal.exists() || !data_path.exists() {
                // Crash between creating the two files of a pair.
                warn!(file_id, "removing incomplete file pair");
                self.files
                    .remove_pair(file_id)
                    .map_err(|e| EngineError::fatal_init(&data_path, e))?;
                self.report.orphan_pairs_removed += 1;
                continue;
            }

            let data = self
                .files
                .get(file_id)
                .map_err(|e| EngineError::fatal_init(&data_path, e))?;
            let scan = scan_journal(&journal, file_id, Some(&data))
                .map_err(|e| EngineError::fatal_init(&journal, e))?;

            self.report.journals_scanned += 1;
            self.report.journal_records += scan.records.len();
            if scan.truncated {
                self.report.journals_truncated += 1;
            }

            let data_len = data.len().map_err(|e| EngineError::fatal_init(&data_path, e))?;
            if data_len > scan.data_end {
                trim_data_file(&data_path, scan.data_end)?;
                self.report.data_files_trimmed += 1;
            }

            if let Some(max) = scan.records.iter().map(|r| r.extent_id).max() {
                self.next_extent_id = self.next_extent_id.max(max + 1);
            }
            debug!(file_id, records = scan.records.len(), "recovered journal");
            self.scans.push(scan);
        }
        Ok(())
    }

    fn scan_metadata_log(&mut self) -> Result<()> {
        let (metalog, replay) = MetadataLog::open(
            &self.metalog_dir,
            self.metalog_config.clone(),
            Arc::clone(&self.index),
        )?;
        self.report.metalog_records = replay.records.len();
        self.report.metalog_truncated_segments = replay.truncated_segments;
        self.report.metalog_discarded_segments = replay.discarded_segments;
        self.metalog_records = replay.records;
        self.metalog = Some(metalog);
        Ok(())
    }

    fn reconcile(&mut self) {
        for scan in self.scans.drain(..) {
            for record in &scan.records {
                self.index.insert(record.uuid, record.location(scan.file_id));
            }
        }
        // Deletions are applied after all data so they win over any page.
        if let Some(metalog) = &self.metalog {
            self.report.deleted_metrics = metalog.apply(&self.metalog_records);
        }
    }
}

fn trim_data_file(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| EngineError::fatal_init(path, e))?;
    let old = file.metadata().map(|m| m.len()).unwrap_or(0);
    warn!(
        path = %path.display(),
        kept = len,
        dropped_bytes = old.saturating_sub(len),
        "trimming unreferenced data file tail"
    );
    file.set_len(len)
        .and_then(|()| file.sync_all())
        .map_err(|e| EngineError::fatal_init(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durability::SyncMode;
    use crate::extent::{ExtentConfig, ExtentWriter};
    use crate::page::{MetricUuid, Page, Sample, SampleFlags, TimeRange};
    use std::io::Write;
    use tempfile::TempDir;

    fn page(uuid: MetricUuid, start: i64, n: i64) -> Arc<Page> {
        Arc::new(Page::from_samples(
            uuid,
            (0..n)
                .map(|i| Sample::new(start + i, i as f64, SampleFlags::exists()))
                .collect(),
        ))
    }

    fn recover(dir: &Path) -> (Recovered, Arc<UuidIndex>, Arc<DataFileSet>) {
        let files = Arc::new(DataFileSet::new(dir));
        let index = Arc::new(UuidIndex::new(4));
        let recovered = Recovery::new(
            dir,
            dir.join("metalog"),
            MetadataLogConfig::default().with_sync_mode(SyncMode::None),
            Arc::clone(&files),
            Arc::clone(&index),
        )
        .run()
        .unwrap();
        (recovered, index, files)
    }

    fn writer(dir: &Path, recovered: &Recovered, files: Arc<DataFileSet>) -> ExtentWriter {
        ExtentWriter::open(
            dir,
            ExtentConfig::default().with_sync_mode(SyncMode::None),
            files,
            recovered.next_file_id,
            recovered.next_extent_id,
        )
        .unwrap()
    }

    #[test]
    fn test_state_machine_order() {
        let dir = TempDir::new().unwrap();
        let mut recovery = Recovery::new(
            dir.path(),
            dir.path().join("metalog"),
            MetadataLogConfig::default(),
            Arc::new(DataFileSet::new(dir.path())),
            Arc::new(UuidIndex::default()),
        );
        assert_eq!(recovery.state(), RecoveryState::ScanJournals);
        assert_eq!(recovery.step().unwrap(), RecoveryState::ScanMetadataLog);
        assert_eq!(recovery.step().unwrap(), RecoveryState::Reconcile);
        assert_eq!(recovery.step().unwrap(), RecoveryState::Ready);
        assert_eq!(recovery.step().unwrap(), RecoveryState::Ready);
    }

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        let (recovered, index, _) = recover(dir.path());
        assert_eq!(recovered.next_file_id, 1);
        assert_eq!(recovered.next_extent_id, 1);
        assert!(index.is_empty());
        assert!(!recovered.report.had_repairs());
    }

    #[test]
    fn test_index_rebuilt_from_journals() {
        let dir = TempDir::new().unwrap();
        let uuid = MetricUuid::new_v4();
        {
            let (recovered, _, files) = recover(dir.path());
            let mut writer = writer(dir.path(), &recovered, files);
            writer.flush(&[page(uuid, 0, 10)]).unwrap();
            writer.flush(&[page(uuid, 10, 10)]).unwrap();
        }

        let (recovered, index, _) = recover(dir.path());
        assert_eq!(recovered.report.journals_scanned, 1);
        assert_eq!(recovered.report.journal_records, 2);
        assert_eq!(recovered.next_file_id, 2);
        assert_eq!(recovered.next_extent_id, 3);
        assert_eq!(index.locations(&uuid, TimeRange::all()).len(), 2);
        assert_eq!(index.last_timestamp(&uuid), Some(19));
    }

    #[test]
    fn test_torn_extent_dropped() {
        let dir = TempDir::new().unwrap();
        let uuid = MetricUuid::new_v4();
        let data_len;
        {
            let (recovered, _, files) = recover(dir.path());
            let mut writer = writer(dir.path(), &recovered, Arc::clone(&files));
            writer.flush(&[page(uuid, 0, 10)]).unwrap();
            data_len = files.file_size(1).unwrap();
        }

        // A second extent made it halfway to the data file, no journal record.
        let path = datafile_path(dir.path(), 1);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 37]).unwrap();
        drop(file);

        let (recovered, index, _) = recover(dir.path());
        assert_eq!(recovered.report.data_files_trimmed, 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), data_len);
        assert_eq!(index.locations(&uuid, TimeRange::all()).len(), 1);
    }

    #[test]
    fn test_deletions_applied_over_data() {
        let dir = TempDir::new().unwrap();
        let uuid = MetricUuid::new_v4();
        {
            let (recovered, _, files) = recover(dir.path());
            recovered.metalog.delete_dimension_by_uuid(uuid).unwrap();
            // Late data for the deleted metric still reaches an extent.
            let mut writer = writer(dir.path(), &recovered, files);
            writer.flush(&[page(uuid, 0, 10)]).unwrap();
        }

        let (recovered, index, _) = recover(dir.path());
        assert_eq!(recovered.report.deleted_metrics, 1);
        assert!(index.is_deleted(&uuid));
        assert!(index.locations(&uuid, TimeRange::all()).is_empty());
    }

    #[test]
    fn test_orphan_pair_removed() {
        let dir = TempDir::new().unwrap();
        fs::write(journal_path(dir.path(), 4), b"").unwrap();

        let (recovered, _, _) = recover(dir.path());
        assert_eq!(recovered.report.orphan_pairs_removed, 1);
        assert_eq!(recovered.next_file_id, 5);
        assert!(!journal_path(dir.path(), 4).exists());
    }

    #[test]
    fn test_bad_journal_header_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let (recovered, _, files) = recover(dir.path());
            let mut writer = writer(dir.path(), &recovered, files);
            writer.flush(&[page(MetricUuid::new_v4(), 0, 5)]).unwrap();
        }
        let path = journal_path(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0..4].copy_from_slice(b"XXXX");
        fs::write(&path, bytes).unwrap();

        let err = Recovery::new(
            dir.path(),
            dir.path().join("metalog"),
            MetadataLogConfig::default(),
            Arc::new(DataFileSet::new(dir.path())),
            Arc::new(UuidIndex::default()),
        )
        .run()
        .unwrap_err();
        assert!(matches!(err, EngineError::FatalInit { .. }));
    }
}
