//! Metadata log: durable chart and dimension deletion events.
//!
//! Deletions are committed here independently of data pages. Every record
//! carries a strictly increasing sequence number; on startup the log is
//! replayed into the [`UuidIndex`] after the journals, so a durable deletion
//! always wins over data still sitting in extents.
//!
//! # Features
//!
//! - **Batch Writes**: a chart deletion and its dimension deletions are one
//!   write and one fsync
//! - **CRC32 Checksums**: each record is protected by a CRC32 checksum
//! - **Segment Rotation**: segments are rotated based on size thresholds
//! - **Tail Repair**: a torn or corrupt tail is truncated on open, later
//!   segments are discarded
//! - **Truncation**: whole segments are removed once every event in them has
//!   been applied. Tombstones whose latest record sits in a removed segment
//!   are re-appended first, so a deleted dimension stays deleted for good
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_dbengine::metalog::{MetadataLog, MetadataLogConfig};
//!
//! let (log, replay) = MetadataLog::init("/path/to/metalog", MetadataLogConfig::default(), index)?;
//! log.commit_delete_chart(&chart)?;
//! log.truncate(applied_sequence)?;
//! ```

use crate::chart::{Chart, ChartId};
use crate::durability::{unix_now, SyncMode};
use crate::error::{EngineError, Result};
use crate::index::UuidIndex;
use crate::page::MetricUuid;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default maximum segment size (4 MB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;

/// Metadata log segment file extension.
const SEGMENT_EXTENSION: &str = "mlog";

/// Metadata log segment file prefix.
const SEGMENT_PREFIX: &str = "metalog";

/// Segment magic bytes: "DMLG"
const METALOG_MAGIC: [u8; 4] = *b"DMLG";

/// Metadata log format version.
const METALOG_VERSION: u16 = 1;

/// Record payload size in bytes.
pub const RECORD_PAYLOAD_SIZE: usize = 29;

/// On-disk record size: CRC32 followed by the payload.
pub const RECORD_SIZE: usize = 4 + RECORD_PAYLOAD_SIZE;

/// Configuration for the metadata log.
#[derive(Debug, Clone)]
pub struct MetadataLogConfig {
    /// Maximum size of a single segment file.
    pub segment_size: u64,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for MetadataLogConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

impl MetadataLogConfig {
    /// Creates a configuration with custom settings.
    pub fn new(segment_size: u64, sync_mode: SyncMode) -> Self {
        Self {
            segment_size,
            sync_mode,
        }
    }

    /// Sets the segment size.
    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordTag {
    DeleteChart = 1,
    DeleteDimension = 2,
}

/// A deletion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataRecord {
    /// A chart was deleted. Its dimensions follow as separate records.
    DeleteChart {
        /// Log sequence number.
        sequence: u64,
        /// Deleted chart.
        chart: ChartId,
    },
    /// A dimension was deleted.
    DeleteDimension {
        /// Log sequence number.
        sequence: u64,
        /// Deleted metric.
        uuid: MetricUuid,
    },
}

impl MetadataRecord {
    /// Returns the sequence number of the record.
    pub fn sequence(&self) -> u64 {
        match self {
            Self::DeleteChart { sequence, .. } | Self::DeleteDimension { sequence, .. } => {
                *sequence
            }
        }
    }

    fn to_bytes(self) -> [u8; RECORD_PAYLOAD_SIZE] {
        let mut bytes = [0u8; RECORD_PAYLOAD_SIZE];
        let (sequence, tag, id) = match self {
            Self::DeleteChart { sequence, chart } => {
                (sequence, RecordTag::DeleteChart, *chart.as_bytes())
            }
            Self::DeleteDimension { sequence, uuid } => {
                (sequence, RecordTag::DeleteDimension, *uuid.as_bytes())
            }
        };
        bytes[0..8].copy_from_slice(&sequence.to_le_bytes());
        bytes[8] = tag as u8;
        bytes[9..25].copy_from_slice(&id);
        // bytes[25..29] reserved
        bytes
    }

    fn from_bytes(bytes: &[u8; RECORD_PAYLOAD_SIZE]) -> Result<Self> {
        let sequence = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let id: [u8; 16] = bytes[9..25].try_into().unwrap();

        match bytes[8] {
            x if x == RecordTag::DeleteChart as u8 => Ok(Self::DeleteChart {
                sequence,
                chart: ChartId::from_bytes(id),
            }),
            x if x == RecordTag::DeleteDimension as u8 => Ok(Self::DeleteDimension {
                sequence,
                uuid: MetricUuid::from_bytes(id),
            }),
            other => Err(EngineError::DecompressionError(format!(
                "unknown metadata record tag {other}"
            ))),
        }
    }

    fn encode(self) -> [u8; RECORD_SIZE] {
        let payload = self.to_bytes();
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf[4..].copy_from_slice(&payload);
        buf
    }

    fn decode(buf: &[u8; RECORD_SIZE]) -> Result<Self> {
        let expected = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let payload: &[u8; RECORD_PAYLOAD_SIZE] = buf[4..].try_into().unwrap();
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(EngineError::ChecksumMismatch { expected, actual });
        }
        Self::from_bytes(payload)
    }
}

/// Metadata log segment header.
///
/// `base_sequence` is the sequence the first record of the segment gets, so
/// the next sequence survives even when every record was truncated away.
#[derive(Debug, Clone)]
struct SegmentHeader {
    magic: [u8; 4],
    version: u16,
    segment_id: u64,
    base_sequence: u64,
    created_at: i64,
}

impl SegmentHeader {
    const SIZE: usize = 30; // 4 + 2 + 8 + 8 + 8

    fn new(segment_id: u64, base_sequence: u64) -> Self {
        Self {
            magic: METALOG_MAGIC,
            version: METALOG_VERSION,
            segment_id,
            base_sequence,
            created_at: unix_now(),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        writer.write_all(&self.base_sequence.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        Ok(())
    }

    fn parse(buf: &[u8]) -> Result<Self> {
        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != METALOG_MAGIC {
            return Err(EngineError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != METALOG_VERSION {
            return Err(EngineError::UnsupportedVersion(version));
        }

        Ok(Self {
            magic,
            version,
            segment_id: u64::from_le_bytes(buf[6..14].try_into().unwrap()),
            base_sequence: u64::from_le_bytes(buf[14..22].try_into().unwrap()),
            created_at: i64::from_le_bytes(buf[22..30].try_into().unwrap()),
        })
    }
}

/// Records recovered when the log was opened, plus what had to be repaired.
#[derive(Debug, Clone, Default)]
pub struct MetadataReplay {
    /// Valid records in sequence order.
    pub records: Vec<MetadataRecord>,
    /// Segments whose tail was cut off.
    pub truncated_segments: usize,
    /// Segments deleted because they followed a damaged one.
    pub discarded_segments: usize,
}

impl MetadataReplay {
    /// Last recovered sequence number, or 0.
    pub fn last_sequence(&self) -> u64 {
        self.records.last().map_or(0, MetadataRecord::sequence)
    }
}

/// Outcome of [`MetadataLog::truncate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Truncation {
    /// Segments removed.
    pub segments_removed: usize,
    /// Sequences of the `DeleteDimension` records re-appended for tombstones
    /// that lived in removed segments.
    pub carried_forward: Vec<u64>,
}

#[derive(Debug)]
struct LogState {
    current: File,
    current_segment_id: u64,
    current_size: u64,
    next_sequence: u64,
    /// Highest sequence per segment; `None` for segments without records.
    segments: BTreeMap<u64, Option<u64>>,
    /// Segment holding the latest `DeleteDimension` record of each metric.
    tombstones: HashMap<MetricUuid, u64>,
}

/// Append-only log of deletion events.
///
/// All appends are serialized by one mutex.
#[derive(Debug)]
pub struct MetadataLog {
    dir: PathBuf,
    config: MetadataLogConfig,
    index: Arc<UuidIndex>,
    state: Mutex<LogState>,
}

impl MetadataLog {
    /// Opens the log in `dir` and replays it into `index`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::FatalInit` if the directory or an existing
    /// segment cannot be opened, or a segment header is not a metadata log
    /// header.
    pub fn init(
        dir: impl AsRef<Path>,
        config: MetadataLogConfig,
        index: Arc<UuidIndex>,
    ) -> Result<(Self, MetadataReplay)> {
        let (log, replay) = Self::open(dir, config, index)?;
        let applied = log.apply(&replay.records);
        info!(
            records = replay.records.len(),
            newly_deleted = applied,
            next_sequence = log.next_sequence(),
            "metadata log replayed"
        );
        Ok((log, replay))
    }

    /// Opens the log in `dir` without applying the recovered records.
    ///
    /// A new segment is always started; earlier segments are never written
    /// again.
    pub fn open(
        dir: impl AsRef<Path>,
        config: MetadataLogConfig,
        index: Arc<UuidIndex>,
    ) -> Result<(Self, MetadataReplay)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| EngineError::fatal_init(&dir, e))?;

        let mut replay = MetadataReplay::default();
        let mut segments = BTreeMap::new();
        let mut tombstones = HashMap::new();
        let mut base_sequence = 1;
        let segment_ids = Self::list_segments(&dir).map_err(|e| EngineError::fatal_init(&dir, e))?;

        let mut damaged = false;
        for &segment_id in &segment_ids {
            let path = Self::segment_path(&dir, segment_id);
            if damaged {
                warn!(path = %path.display(), "discarding metadata log segment after damaged tail");
                fs::remove_file(&path).map_err(|e| EngineError::fatal_init(&path, e))?;
                replay.discarded_segments += 1;
                continue;
            }

            // Until a record is seen, the segment header says where the
            // sequence resumes after earlier segments were truncated away.
            let expected = (!replay.records.is_empty()).then(|| replay.last_sequence() + 1);
            let scan = Self::scan_segment(&path, expected)?;
            if scan.truncated {
                replay.truncated_segments += 1;
                damaged = true;
            }
            if let Some(base) = scan.base_sequence {
                base_sequence = base_sequence.max(base);
            }
            for record in &scan.records {
                if let MetadataRecord::DeleteDimension { uuid, .. } = record {
                    tombstones.insert(*uuid, segment_id);
                }
            }
            segments.insert(segment_id, scan.records.last().map(MetadataRecord::sequence));
            replay.records.extend(scan.records);
        }

        let next_segment_id = segment_ids.last().map_or(0, |id| id + 1);
        let next_sequence = base_sequence.max(replay.last_sequence() + 1);
        let (current, current_size) = Self::create_segment(&dir, next_segment_id, next_sequence)
            .map_err(|e| EngineError::fatal_init(&dir, e))?;
        segments.insert(next_segment_id, None);

        debug!(
            segment_id = next_segment_id,
            next_sequence, "opened metadata log segment"
        );

        let log = Self {
            dir,
            config,
            index,
            state: Mutex::new(LogState {
                current,
                current_segment_id: next_segment_id,
                current_size,
                next_sequence,
                segments,
                tombstones,
            }),
        };
        Ok((log, replay))
    }

    /// Marks every deleted dimension in the index. Returns how many metrics
    /// became deleted.
    pub fn apply(&self, records: &[MetadataRecord]) -> usize {
        apply_records(records, &self.index)
    }

    fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
        dir.join(format!(
            "{}-{:016x}.{}",
            SEGMENT_PREFIX, segment_id, SEGMENT_EXTENSION
        ))
    }

    fn parse_segment_id(path: &Path) -> Option<u64> {
        if path.extension()? != SEGMENT_EXTENSION {
            return None;
        }
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&format!("{}-", SEGMENT_PREFIX)))
            .and_then(|s| u64::from_str_radix(s, 16).ok())
    }

    fn list_segments(dir: &Path) -> std::io::Result<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            if let Some(id) = Self::parse_segment_id(&entry?.path()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn create_segment(dir: &Path, segment_id: u64, base_sequence: u64) -> Result<(File, u64)> {
        let path = Self::segment_path(dir, segment_id);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut buf = Vec::with_capacity(SegmentHeader::SIZE);
        SegmentHeader::new(segment_id, base_sequence).write_to(&mut buf)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok((file, SegmentHeader::SIZE as u64))
    }

    /// Reads one segment, truncating it at the first unreadable record or
    /// sequence gap. Without `expected_seq` the first record must carry the
    /// header's base sequence.
    fn scan_segment(path: &Path, expected_seq: Option<u64>) -> Result<SegmentScan> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| EngineError::fatal_init(path, e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| EngineError::fatal_init(path, e))?;

        let mut scan = SegmentScan::default();
        if data.len() < SegmentHeader::SIZE {
            warn!(path = %path.display(), "metadata log segment header incomplete, truncating");
            file.set_len(0).map_err(|e| EngineError::fatal_init(path, e))?;
            scan.truncated = !data.is_empty();
            return Ok(scan);
        }
        let header = SegmentHeader::parse(&data[..SegmentHeader::SIZE])
            .map_err(|e| EngineError::fatal_init(path, e))?;
        scan.base_sequence = Some(header.base_sequence);

        let mut expected = expected_seq.unwrap_or(header.base_sequence);
        let mut valid_len = SegmentHeader::SIZE;
        for chunk in data[SegmentHeader::SIZE..].chunks(RECORD_SIZE) {
            let Ok(chunk) = <&[u8; RECORD_SIZE]>::try_from(chunk) else {
                break;
            };
            let record = match MetadataRecord::decode(chunk) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable metadata record");
                    break;
                }
            };
            if record.sequence() != expected {
                warn!(
                    path = %path.display(),
                    expected,
                    found = record.sequence(),
                    "metadata log sequence discontinuity"
                );
                break;
            }
            expected = record.sequence() + 1;
            scan.records.push(record);
            valid_len += RECORD_SIZE;
        }

        if valid_len < data.len() {
            warn!(
                path = %path.display(),
                kept = scan.records.len(),
                dropped_bytes = data.len() - valid_len,
                "truncating metadata log segment"
            );
            file.set_len(valid_len as u64)
                .map_err(|e| EngineError::fatal_init(path, e))?;
            file.sync_all().map_err(|e| EngineError::fatal_init(path, e))?;
            scan.truncated = true;
        }
        Ok(scan)
    }

    /// Durably records the deletion of `chart` and all its dimensions, then
    /// marks the dimensions deleted in the index.
    ///
    /// The chart record is written first, followed by one dimension record per
    /// owned dimension, all in one write and one sync. Returns the assigned
    /// sequence numbers in record order.
    pub fn commit_delete_chart(&self, chart: &Chart) -> Result<Vec<u64>> {
        let mut state = self.state.lock();
        let base = state.next_sequence;

        let mut records = Vec::with_capacity(chart.dimensions.len() + 1);
        records.push(MetadataRecord::DeleteChart {
            sequence: base,
            chart: chart.id,
        });
        for (i, dim) in chart.dimensions.iter().enumerate() {
            records.push(MetadataRecord::DeleteDimension {
                sequence: base + 1 + i as u64,
                uuid: dim.uuid,
            });
        }

        self.write_batch(&mut state, &records)?;
        self.apply(&records);

        debug!(
            chart = %chart.id,
            dimensions = chart.dimensions.len(),
            first_sequence = base,
            "committed chart deletion"
        );
        Ok(records.iter().map(MetadataRecord::sequence).collect())
    }

    /// Durably records the deletion of one dimension and marks it deleted.
    ///
    /// Deleting an already deleted dimension appends another record.
    pub fn delete_dimension_by_uuid(&self, uuid: MetricUuid) -> Result<u64> {
        let mut state = self.state.lock();
        let record = MetadataRecord::DeleteDimension {
            sequence: state.next_sequence,
            uuid,
        };
        self.write_batch(&mut state, &[record])?;
        self.apply(&[record]);
        Ok(record.sequence())
    }

    fn write_batch(&self, state: &mut LogState, records: &[MetadataRecord]) -> Result<()> {
        let mut buf = Vec::with_capacity(records.len() * RECORD_SIZE);
        for record in records {
            buf.extend_from_slice(&record.encode());
        }

        let has_records = state.current_size > SegmentHeader::SIZE as u64;
        if has_records && state.current_size + buf.len() as u64 > self.config.segment_size {
            self.rotate_segment(state)?;
        }

        // Rewrites from the last durable position, so a failed attempt leaves
        // no partial batch behind the next one.
        state.current.seek(SeekFrom::Start(state.current_size))?;
        state.current.write_all(&buf)?;
        self.config.sync_mode.sync(&state.current)?;

        state.current_size += buf.len() as u64;
        let last = records.last().map(MetadataRecord::sequence);
        if let Some(last) = last {
            state.next_sequence = last + 1;
        }
        let segment_id = state.current_segment_id;
        state.segments.insert(segment_id, last);
        for record in records {
            if let MetadataRecord::DeleteDimension { uuid, .. } = record {
                state.tombstones.insert(*uuid, segment_id);
            }
        }
        Ok(())
    }

    /// Rotates to a new segment file.
    fn rotate_segment(&self, state: &mut LogState) -> Result<()> {
        state.current.sync_all()?;

        let segment_id = state.current_segment_id + 1;
        let (file, size) = Self::create_segment(&self.dir, segment_id, state.next_sequence)?;
        state.current = file;
        state.current_segment_id = segment_id;
        state.current_size = size;
        state.segments.insert(segment_id, None);

        debug!(segment_id, "rotated metadata log segment");
        Ok(())
    }

    /// Removes every non-current segment whose records all have a sequence
    /// `<= up_to_seq`.
    ///
    /// Dimensions whose latest deletion record lives in a removed segment get
    /// a fresh `DeleteDimension` record in the current segment first, written
    /// and synced before anything is unlinked.
    pub fn truncate(&self, up_to_seq: u64) -> Result<Truncation> {
        let mut state = self.state.lock();
        let current = state.current_segment_id;

        let removable: Vec<u64> = state
            .segments
            .iter()
            .filter(|(&id, max_seq)| id < current && max_seq.map_or(true, |s| s <= up_to_seq))
            .map(|(&id, _)| id)
            .collect();
        if removable.is_empty() {
            return Ok(Truncation::default());
        }

        let mut carried: Vec<MetricUuid> = state
            .tombstones
            .iter()
            .filter(|&(_, &segment_id)| removable.binary_search(&segment_id).is_ok())
            .map(|(uuid, _)| *uuid)
            .collect();
        carried.sort_unstable();

        let base = state.next_sequence;
        let records: Vec<MetadataRecord> = carried
            .into_iter()
            .enumerate()
            .map(|(i, uuid)| MetadataRecord::DeleteDimension {
                sequence: base + i as u64,
                uuid,
            })
            .collect();
        if !records.is_empty() {
            self.write_batch(&mut state, &records)?;
            debug!(
                records = records.len(),
                first_sequence = base,
                "carried tombstones forward"
            );
        }

        for id in &removable {
            let path = Self::segment_path(&self.dir, *id);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            state.segments.remove(id);
            debug!(path = %path.display(), "removed metadata log segment");
        }
        Ok(Truncation {
            segments_removed: removable.len(),
            carried_forward: records.iter().map(MetadataRecord::sequence).collect(),
        })
    }

    /// Sequence number the next record will get.
    pub fn next_sequence(&self) -> u64 {
        self.state.lock().next_sequence
    }

    /// Segment ids currently on disk, ascending.
    pub fn segment_ids(&self) -> Vec<u64> {
        self.state.lock().segments.keys().copied().collect()
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[derive(Debug, Default)]
struct SegmentScan {
    records: Vec<MetadataRecord>,
    truncated: bool,
    base_sequence: Option<u64>,
}

/// Applies deletion records to `index`. Returns how many metrics became
/// deleted.
pub fn apply_records(records: &[MetadataRecord], index: &UuidIndex) -> usize {
    records
        .iter()
        .filter(|record| match record {
            MetadataRecord::DeleteDimension { sequence, uuid } => {
                index.mark_deleted(*uuid, *sequence)
            }
            MetadataRecord::DeleteChart { .. } => false,
        })
        .count()
}
