//! Extent writer: turns closed pages into durable extents plus journal
//! records.
//!
//! # Write path
//!
//! ```text
//! pages → encode extent → append to data file → fsync
//!       → append journal records → fsync → locations to the index
//! ```
//!
//! The journal is only written after the extent is durable, so recovery never
//! sees a journal record for an extent that is not fully on disk.

use crate::durability::SyncMode;
use crate::error::{EngineError, Result};
use crate::extent::datafile::{
    create_with_header, datafile_path, journal_path, DataFile, DataFileSet, FileHeader, DATAFILE_MAGIC,
    FILE_HEADER_SIZE,
};
use crate::extent::format::{decode_extent, encode_extent, CompressionType};
use crate::extent::journal::{JournalRecord, JournalWriter};
use crate::index::PageLocation;
use crate::page::{MetricUuid, Page};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default data file rotation size (64 MB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of attempts for one flush.
pub const DEFAULT_FLUSH_RETRY_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_FLUSH_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for the extent writer.
#[derive(Debug, Clone)]
pub struct ExtentConfig {
    /// Data file size that triggers rotation to a new pair.
    pub max_file_size: u64,
    /// Sync mode for data and journal files.
    pub sync_mode: SyncMode,
    /// Page compression.
    pub compression: CompressionType,
    /// Attempts per flush before the pair is abandoned.
    pub flush_retry_attempts: u32,
    /// Delay before the first retry, doubled on every further retry.
    pub flush_retry_backoff: Duration,
}

impl Default for ExtentConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            sync_mode: SyncMode::default(),
            compression: CompressionType::default(),
            flush_retry_attempts: DEFAULT_FLUSH_RETRY_ATTEMPTS,
            flush_retry_backoff: DEFAULT_FLUSH_RETRY_BACKOFF,
        }
    }
}

impl ExtentConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rotation size.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the page compression.
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.flush_retry_attempts = attempts.max(1);
        self.flush_retry_backoff = backoff;
        self
    }
}

/// Outcome of a successful flush.
#[derive(Debug, Clone)]
pub struct FlushResult {
    /// Identifier of the written extent.
    pub extent_id: u64,
    /// File pair the extent went to.
    pub file_id: u32,
    /// Location of every written page, in input order.
    pub locations: Vec<(MetricUuid, PageLocation)>,
}

#[derive(Debug)]
struct ActivePair {
    file_id: u32,
    data: File,
    data_len: u64,
    journal: JournalWriter,
}

/// Single writer appending extents to the current data/journal pair.
#[derive(Debug)]
pub struct ExtentWriter {
    dir: PathBuf,
    config: ExtentConfig,
    files: Arc<DataFileSet>,
    current: Option<ActivePair>,
    next_file_id: u32,
    next_extent_id: u64,
}

impl ExtentWriter {
    /// Opens a writer whose first pair is `next_file_id`. Earlier pairs are
    /// never written again.
    pub fn open(
        dir: impl AsRef<Path>,
        config: ExtentConfig,
        files: Arc<DataFileSet>,
        next_file_id: u32,
        next_extent_id: u64,
    ) -> Result<Self> {
        let mut writer = Self {
            dir: dir.as_ref().to_path_buf(),
            config,
            files,
            current: None,
            next_file_id,
            next_extent_id,
        };
        writer.open_pair()?;
        Ok(writer)
    }

    /// File number of the pair currently written, if any.
    pub fn current_file_id(&self) -> Option<u32> {
        self.current.as_ref().map(|pair| pair.file_id)
    }

    /// Identifier the next extent will get.
    pub fn next_extent_id(&self) -> u64 {
        self.next_extent_id
    }

    /// Shared registry of readable data files.
    pub fn files(&self) -> &Arc<DataFileSet> {
        &self.files
    }

    fn open_pair(&mut self) -> Result<()> {
        let file_id = self.next_file_id;
        self.next_file_id += 1;

        let data = create_with_header(
            &datafile_path(&self.dir, file_id),
            FileHeader::new(DATAFILE_MAGIC, file_id),
        )?;
        let journal = JournalWriter::create(
            &journal_path(&self.dir, file_id),
            file_id,
            self.config.sync_mode,
        )?;
        self.files.register(file_id)?;

        info!(file_id, dir = %self.dir.display(), "opened data file pair");
        self.current = Some(ActivePair {
            file_id,
            data,
            data_len: FILE_HEADER_SIZE,
            journal,
        });
        Ok(())
    }

    /// Writes `pages` as one extent to the current pair, rotating first if
    /// the data file would exceed `max_file_size`.
    ///
    /// Transient I/O errors are retried with exponential backoff. Once the
    /// attempts are exhausted the pair is abandoned, the next flush opens a new
    /// one, and `EngineError::IoFailure` is returned so the caller keeps the
    /// pages queued.
    pub fn flush(&mut self, pages: &[Arc<Page>]) -> Result<FlushResult> {
        let pages: Vec<Arc<Page>> = pages.iter().filter(|p| !p.is_empty()).cloned().collect();
        if pages.is_empty() {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "flush called without samples",
            )));
        }

        let extent_id = self.next_extent_id;
        let buf = encode_extent(extent_id, &pages, self.config.compression)?;

        let mut backoff = self.config.flush_retry_backoff;
        let attempts = self.config.flush_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_write(extent_id, &buf, &pages) {
                Ok(result) => {
                    self.next_extent_id += 1;
                    debug!(
                        extent_id,
                        file_id = result.file_id,
                        pages = pages.len(),
                        bytes = buf.len(),
                        "flushed extent"
                    );
                    return Ok(result);
                }
                Err(EngineError::Io(e)) => {
                    warn!(extent_id, attempt, error = %e, "extent write failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(backoff);
                        backoff = backoff.saturating_mul(2);
                    }
                }
                Err(other) => return Err(other),
            }
        }

        if let Some(pair) = self.current.take() {
            error!(
                file_id = pair.file_id,
                attempts, "giving up on data file pair after repeated write failures"
            );
        }
        Err(EngineError::IoFailure {
            attempts,
            source: last_error
                .unwrap_or_else(|| std::io::Error::other("extent write failed")),
        })
    }

    fn try_write(&mut self, extent_id: u64, buf: &[u8], pages: &[Arc<Page>]) -> Result<FlushResult> {
        let needs_rotation = self.current.as_ref().is_some_and(|pair| {
            pair.data_len > FILE_HEADER_SIZE
                && pair.data_len + buf.len() as u64 > self.config.max_file_size
        });
        if needs_rotation {
            if let Some(pair) = self.current.take() {
                debug!(file_id = pair.file_id, size = pair.data_len, "rotating data file");
            }
        }
        if self.current.is_none() {
            self.open_pair()?;
        }
        let sync_mode = self.config.sync_mode;
        let Some(pair) = self.current.as_mut() else {
            return Err(EngineError::ShutDown);
        };

        let offset = pair.data_len;
        let length = buf.len() as u32;
        pair.data.seek(SeekFrom::Start(offset))?;
        pair.data.write_all(buf)?;
        sync_mode.sync(&pair.data)?;

        let records: Vec<JournalRecord> = pages
            .iter()
            .map(|page| JournalRecord {
                uuid: page.uuid(),
                start_time: page.start_time().unwrap_or_default(),
                end_time: page.end_time().unwrap_or_default(),
                extent_id,
                offset,
                length,
            })
            .collect();
        pair.journal.append(&records)?;
        pair.data_len += buf.len() as u64;

        let file_id = pair.file_id;
        Ok(FlushResult {
            extent_id,
            file_id,
            locations: records
                .iter()
                .map(|record| (record.uuid, record.location(file_id)))
                .collect(),
        })
    }

    /// Reads one page back through the shared file registry.
    pub fn read_page(&self, uuid: &MetricUuid, location: &PageLocation) -> Result<Page> {
        read_page(&self.files, uuid, location)
    }
}

/// Reads the extent behind `location`, verifies it and decodes the page of
/// `uuid` starting at `location.start_time`.
///
/// Any failure to read or validate the extent is reported as
/// `EngineError::CorruptExtent`.
pub fn read_page(files: &DataFileSet, uuid: &MetricUuid, location: &PageLocation) -> Result<Page> {
    let corrupt = |reason: String| EngineError::CorruptExtent {
        file_id: location.file_id,
        offset: location.offset,
        reason,
    };

    let file = files.get(location.file_id).map_err(|e| corrupt(e.to_string()))?;
    read_page_in(&file, uuid, location)
}

/// Like [`read_page`], reading from an already resolved file handle.
pub fn read_page_in(file: &DataFile, uuid: &MetricUuid, location: &PageLocation) -> Result<Page> {
    let corrupt = |reason: String| EngineError::CorruptExtent {
        file_id: location.file_id,
        offset: location.offset,
        reason,
    };

    let buf = file
        .read_at(location.offset, location.length as usize)
        .map_err(|e| corrupt(e.to_string()))?;
    let (header, blocks) = decode_extent(&buf).map_err(|e| corrupt(e.to_string()))?;
    if header.extent_id != location.extent_id {
        return Err(corrupt(format!(
            "expected extent {}, found {}",
            location.extent_id, header.extent_id
        )));
    }

    let block = blocks
        .iter()
        .find(|b| b.uuid == *uuid && b.start_time == location.start_time)
        .ok_or_else(|| corrupt(format!("page of {uuid} at {} missing", location.start_time)))?;
    block
        .decode(header.compression)
        .map_err(|e| corrupt(e.to_string()))
}
