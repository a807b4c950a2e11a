//! Journal files: one fixed-size record per flushed page.
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    16      uuid
//! 0x10    8       start_time (i64 LE)
//! 0x18    8       end_time (i64 LE)
//! 0x20    8       extent_id (u64 LE)
//! 0x28    8       offset of the extent in the data file (u64 LE)
//! 0x30    4       extent length (u32 LE)
//! 0x34    4       crc32 of bytes 0x00..0x34 (u32 LE)
//! ```
//!
//! Journal records are appended only after the extent they describe is
//! durable, so a record is trusted only if its own checksum and the trailer of
//! the extent it points at both verify.

use crate::durability::SyncMode;
use crate::error::{EngineError, Result};
use crate::extent::datafile::{
    create_with_header, DataFile, FileHeader, FILE_HEADER_SIZE, JOURNAL_MAGIC,
};
use crate::extent::format::verify_extent;
use crate::index::PageLocation;
use crate::page::{MetricUuid, Timestamp};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Size of one journal record in bytes.
pub const JOURNAL_RECORD_SIZE: usize = 56;

/// A journal record describing one page of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRecord {
    /// Metric the page belongs to.
    pub uuid: MetricUuid,
    /// First sample timestamp.
    pub start_time: Timestamp,
    /// Last sample timestamp.
    pub end_time: Timestamp,
    /// Extent holding the page.
    pub extent_id: u64,
    /// Byte offset of the extent in the data file.
    pub offset: u64,
    /// Extent length in bytes.
    pub length: u32,
}

impl JournalRecord {
    /// Serializes the record, checksum included.
    pub fn encode(&self) -> [u8; JOURNAL_RECORD_SIZE] {
        let mut buf = [0u8; JOURNAL_RECORD_SIZE];
        buf[0..16].copy_from_slice(self.uuid.as_bytes());
        buf[16..24].copy_from_slice(&self.start_time.to_le_bytes());
        buf[24..32].copy_from_slice(&self.end_time.to_le_bytes());
        buf[32..40].copy_from_slice(&self.extent_id.to_le_bytes());
        buf[40..48].copy_from_slice(&self.offset.to_le_bytes());
        buf[48..52].copy_from_slice(&self.length.to_le_bytes());
        let crc = crc32fast::hash(&buf[..52]);
        buf[52..56].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses a record and verifies its checksum.
    pub fn decode(buf: &[u8; JOURNAL_RECORD_SIZE]) -> Result<Self> {
        let expected = u32::from_le_bytes(buf[52..56].try_into().unwrap());
        let actual = crc32fast::hash(&buf[..52]);
        if expected != actual {
            return Err(EngineError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            uuid: MetricUuid::from_bytes(buf[0..16].try_into().unwrap()),
            start_time: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            end_time: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            extent_id: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            length: u32::from_le_bytes(buf[48..52].try_into().unwrap()),
        })
    }

    /// Index location of the page inside data file `file_id`.
    pub fn location(&self, file_id: u32) -> PageLocation {
        PageLocation {
            file_id,
            extent_id: self.extent_id,
            offset: self.offset,
            length: self.length,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// Append-only writer for the current journal file.
#[derive(Debug)]
pub struct JournalWriter {
    path: PathBuf,
    file: File,
    len: u64,
    sync_mode: SyncMode,
}

impl JournalWriter {
    /// Creates a new journal file for pair `file_id`.
    pub fn create(path: &Path, file_id: u32, sync_mode: SyncMode) -> Result<Self> {
        let file = create_with_header(path, FileHeader::new(JOURNAL_MAGIC, file_id))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len: FILE_HEADER_SIZE,
            sync_mode,
        })
    }

    /// Appends records in a single write and syncs them.
    ///
    /// A failed attempt leaves `len` unchanged, so a retry overwrites any
    /// partially written bytes.
    pub fn append(&mut self, records: &[JournalRecord]) -> Result<()> {
        let mut buf = Vec::with_capacity(records.len() * JOURNAL_RECORD_SIZE);
        for record in records {
            buf.extend_from_slice(&record.encode());
        }

        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(&buf)?;
        self.sync_mode.sync(&self.file)?;
        self.len += buf.len() as u64;
        Ok(())
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, header included.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if no record was written.
    pub fn is_empty(&self) -> bool {
        self.len == FILE_HEADER_SIZE
    }
}

/// Result of scanning one journal file.
#[derive(Debug, Clone, Default)]
pub struct JournalScan {
    /// File pair number.
    pub file_id: u32,
    /// Records that passed validation, in file order.
    pub records: Vec<JournalRecord>,
    /// True if an invalid tail was cut off.
    pub truncated: bool,
    /// End of the last valid extent in the data file.
    pub data_end: u64,
}

/// Scans a journal file, verifying every record against the extent it
/// references, and truncates the file at the first invalid record.
///
/// A journal too short to hold its header is reset to an empty journal.
/// A header with the wrong magic or version is an error.
pub fn scan_journal(path: &Path, file_id: u32, data: Option<&DataFile>) -> Result<JournalScan> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let file_len = file.metadata()?.len();
    let mut scan = JournalScan {
        file_id,
        data_end: FILE_HEADER_SIZE,
        ..Default::default()
    };

    if file_len < FILE_HEADER_SIZE {
        warn!(path = %path.display(), "journal header incomplete, resetting journal");
        file.set_len(0)?;
        let mut header = Vec::new();
        FileHeader::new(JOURNAL_MAGIC, file_id).write_to(&mut header)?;
        file.write_all(&header)?;
        file.sync_all()?;
        scan.truncated = true;
        return Ok(scan);
    }

    FileHeader::read_from(&mut file, JOURNAL_MAGIC)?;
    let mut body = Vec::with_capacity((file_len - FILE_HEADER_SIZE) as usize);
    file.read_to_end(&mut body)?;

    let mut extent_ok: HashMap<u64, bool> = HashMap::new();
    let mut valid = 0usize;
    for chunk in body.chunks(JOURNAL_RECORD_SIZE) {
        let Ok(chunk) = <&[u8; JOURNAL_RECORD_SIZE]>::try_from(chunk) else {
            break;
        };
        let record = match JournalRecord::decode(chunk) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %path.display(), record = valid, error = %e, "invalid journal record");
                break;
            }
        };

        let ok = *extent_ok
            .entry(record.offset)
            .or_insert_with(|| extent_is_valid(data, &record));
        if !ok {
            warn!(
                path = %path.display(),
                extent_id = record.extent_id,
                offset = record.offset,
                "journal record points at an invalid extent"
            );
            break;
        }

        scan.data_end = scan.data_end.max(record.offset + u64::from(record.length));
        scan.records.push(record);
        valid += 1;
    }

    let valid_len = FILE_HEADER_SIZE + (valid * JOURNAL_RECORD_SIZE) as u64;
    if valid_len < file_len {
        warn!(
            path = %path.display(),
            kept = valid,
            dropped_bytes = file_len - valid_len,
            "truncating journal"
        );
        file.set_len(valid_len)?;
        file.sync_all()?;
        scan.truncated = true;
    }

    debug!(path = %path.display(), records = scan.records.len(), "scanned journal");
    Ok(scan)
}

fn extent_is_valid(data: Option<&DataFile>, record: &JournalRecord) -> bool {
    let Some(data) = data else {
        return false;
    };
    match data.read_at(record.offset, record.length as usize) {
        Ok(buf) => matches!(verify_extent(&buf), Ok(header) if header.extent_id == record.extent_id),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::datafile::{datafile_path, journal_path, DATAFILE_MAGIC};
    use crate::extent::format::{encode_extent, CompressionType};
    use crate::page::{Page, Sample, SampleFlags};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(extent_id: u64, offset: u64, length: u32) -> JournalRecord {
        JournalRecord {
            uuid: MetricUuid::new_v4(),
            start_time: 100,
            end_time: 200,
            extent_id,
            offset,
            length,
        }
    }

    /// Writes one extent into a fresh data file and returns its record.
    fn write_pair(dir: &Path) -> JournalRecord {
        let uuid = MetricUuid::new_v4();
        let page = Page::from_samples(
            uuid,
            (0..10)
                .map(|i| Sample::new(100 + i, i as f64, SampleFlags::exists()))
                .collect(),
        );
        let extent = encode_extent(1, &[Arc::new(page)], CompressionType::Gorilla).unwrap();

        let mut data = create_with_header(
            &datafile_path(dir, 1),
            FileHeader::new(DATAFILE_MAGIC, 1),
        )
        .unwrap();
        data.write_all(&extent).unwrap();

        JournalRecord {
            uuid,
            start_time: 100,
            end_time: 109,
            extent_id: 1,
            offset: FILE_HEADER_SIZE,
            length: extent.len() as u32,
        }
    }

    #[test]
    fn test_record_roundtrip_and_size() {
        let rec = record(9, 4096, 512);
        let bytes = rec.encode();
        assert_eq!(bytes.len(), 56);
        assert_eq!(JournalRecord::decode(&bytes).unwrap(), rec);
    }

    #[test]
    fn test_record_checksum() {
        let mut bytes = record(1, 16, 64).encode();
        bytes[20] ^= 1;
        assert!(matches!(
            JournalRecord::decode(&bytes),
            Err(EngineError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_scan_valid_journal() {
        let dir = TempDir::new().unwrap();
        let rec = write_pair(dir.path());
        let path = journal_path(dir.path(), 1);
        let mut journal = JournalWriter::create(&path, 1, SyncMode::None).unwrap();
        journal.append(&[rec]).unwrap();

        let data = DataFile::open(&datafile_path(dir.path(), 1), 1).unwrap();
        let scan = scan_journal(&path, 1, Some(&data)).unwrap();
        assert_eq!(scan.records, vec![rec]);
        assert!(!scan.truncated);
        assert_eq!(scan.data_end, FILE_HEADER_SIZE + u64::from(rec.length));
    }

    #[test]
    fn test_scan_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let rec = write_pair(dir.path());
        let path = journal_path(dir.path(), 1);
        let mut journal = JournalWriter::create(&path, 1, SyncMode::None).unwrap();
        journal.append(&[rec]).unwrap();
        drop(journal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&record(2, 999, 10).encode()[..30]).unwrap();

        let data = DataFile::open(&datafile_path(dir.path(), 1), 1).unwrap();
        let scan = scan_journal(&path, 1, Some(&data)).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert!(scan.truncated);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            FILE_HEADER_SIZE + JOURNAL_RECORD_SIZE as u64
        );
    }

    #[test]
    fn test_scan_rejects_record_without_extent() {
        let dir = TempDir::new().unwrap();
        let rec = write_pair(dir.path());
        let path = journal_path(dir.path(), 1);
        let mut journal = JournalWriter::create(&path, 1, SyncMode::None).unwrap();
        // Second record claims an extent past the end of the data file.
        journal
            .append(&[rec, record(2, rec.offset + u64::from(rec.length), 64)])
            .unwrap();

        let data = DataFile::open(&datafile_path(dir.path(), 1), 1).unwrap();
        let scan = scan_journal(&path, 1, Some(&data)).unwrap();
        assert_eq!(scan.records, vec![rec]);
        assert!(scan.truncated);
    }

    #[test]
    fn test_scan_bad_magic_is_error() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(dir.path(), 1);
        std::fs::write(&path, [0xAB; 64]).unwrap();

        assert!(matches!(
            scan_journal(&path, 1, None),
            Err(EngineError::InvalidMagic(_))
        ));
    }
}
