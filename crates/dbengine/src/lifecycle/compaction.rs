//! Compaction of sparse or deleted-heavy data file pairs.
//!
//! A pair other than the one currently written is rewritten when the bytes of
//! extents still referenced by live pages fall below
//! [`CompactionConfig::min_live_ratio`], or when it holds any page of a
//! deleted metric. Live pages are re-flushed through the extent writer into
//! the current pair, their index locations swapped, and the old pair unlinked.

use crate::error::{EngineError, Result};
use crate::extent::datafile::FILE_HEADER_SIZE;
use crate::extent::{read_page_in, DataFileSet, ExtentWriter};
use crate::index::{PageLocation, UuidIndex};
use crate::page::{MetricUuid, Page, PageCache};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default live ratio below which a pair is compacted.
pub const DEFAULT_MIN_LIVE_RATIO: f64 = 0.5;

/// Default number of pages per rewritten extent.
pub const DEFAULT_PAGES_PER_EXTENT: usize = 64;

/// Compaction configuration.
///
/// # Examples
/// ```rust,ignore
/// use alopex_dbengine::lifecycle::compaction::CompactionConfig;
///
/// let config = CompactionConfig::default().with_min_live_ratio(0.3);
/// ```
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Pairs with a smaller share of live bytes are rewritten.
    pub min_live_ratio: f64,
    /// Upper bound of pages in one rewritten extent.
    pub pages_per_extent: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_live_ratio: DEFAULT_MIN_LIVE_RATIO,
            pages_per_extent: DEFAULT_PAGES_PER_EXTENT,
        }
    }
}

impl CompactionConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the live ratio threshold.
    pub fn with_min_live_ratio(mut self, min_live_ratio: f64) -> Self {
        self.min_live_ratio = min_live_ratio.clamp(0.0, 1.0);
        self
    }

    /// Sets the number of pages per rewritten extent.
    pub fn with_pages_per_extent(mut self, pages_per_extent: usize) -> Self {
        self.pages_per_extent = pages_per_extent.max(1);
        self
    }
}

/// A pair selected for compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionCandidate {
    /// File pair number.
    pub file_id: u32,
    /// Bytes of extents referenced by live pages.
    pub live_bytes: u64,
    /// Bytes of extents in the data file.
    pub total_bytes: u64,
    /// Pages of deleted metrics still located in the pair.
    pub deleted_pages: usize,
}

impl CompactionCandidate {
    /// Share of extent bytes still referenced by live pages.
    pub fn live_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.live_bytes as f64 / self.total_bytes as f64
    }
}

/// Compaction result metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Pairs removed.
    pub files_compacted: Vec<u32>,
    /// Live pages written to new extents.
    pub pages_rewritten: usize,
    /// Pages of deleted metrics dropped.
    pub pages_dropped: usize,
    /// Pages skipped because their extent could not be read.
    pub pages_corrupt: usize,
}

impl CompactionResult {
    fn merge(&mut self, other: CompactionResult) {
        self.files_compacted.extend(other.files_compacted);
        self.pages_rewritten += other.pages_rewritten;
        self.pages_dropped += other.pages_dropped;
        self.pages_corrupt += other.pages_corrupt;
    }
}

/// Plans and runs compaction.
#[derive(Debug)]
pub struct Compactor {
    config: CompactionConfig,
    files: Arc<DataFileSet>,
    index: Arc<UuidIndex>,
    cache: Arc<PageCache>,
    writer: Arc<Mutex<ExtentWriter>>,
}

impl Compactor {
    /// Creates a compactor sharing the engine's files, index, cache and
    /// writer.
    pub fn new(
        config: CompactionConfig,
        files: Arc<DataFileSet>,
        index: Arc<UuidIndex>,
        cache: Arc<PageCache>,
        writer: Arc<Mutex<ExtentWriter>>,
    ) -> Self {
        Self {
            config,
            files,
            index,
            cache,
            writer,
        }
    }

    /// Returns the compaction config.
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Returns the pairs that need compaction, oldest first.
    pub fn plan(&self) -> Result<Vec<CompactionCandidate>> {
        let current = self.writer.lock().current_file_id();
        let mut candidates = Vec::new();

        for file_id in self.files.file_ids() {
            if Some(file_id) == current {
                continue;
            }
            let candidate = self.inspect(file_id)?;
            if candidate.deleted_pages > 0 || candidate.live_ratio() < self.config.min_live_ratio {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    fn inspect(&self, file_id: u32) -> Result<CompactionCandidate> {
        let total_bytes = self
            .files
            .file_size(file_id)?
            .saturating_sub(FILE_HEADER_SIZE);

        let mut live_extents: HashMap<u64, u32> = HashMap::new();
        let mut deleted_pages = 0;
        for (_, location, deleted) in self.index.file_pages(file_id) {
            if deleted {
                deleted_pages += 1;
            } else {
                live_extents.insert(location.offset, location.length);
            }
        }

        Ok(CompactionCandidate {
            file_id,
            live_bytes: live_extents.values().map(|&len| u64::from(len)).sum(),
            total_bytes,
            deleted_pages,
        })
    }

    /// Compacts every planned pair.
    ///
    /// A pair that fails is left in place and retried on the next run.
    pub fn run(&self) -> Result<CompactionResult> {
        let mut result = CompactionResult::default();
        for candidate in self.plan()? {
            match self.compact_file(candidate.file_id) {
                Ok(file_result) => result.merge(file_result),
                Err(e) => {
                    warn!(file_id = candidate.file_id, error = %e, "compaction failed");
                }
            }
        }
        if !result.files_compacted.is_empty() {
            info!(
                files = result.files_compacted.len(),
                rewritten = result.pages_rewritten,
                dropped = result.pages_dropped,
                "compaction finished"
            );
        }
        Ok(result)
    }

    /// Rewrites the live pages of `file_id` and removes the pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair is the one currently written or if
    /// rewriting the live pages fails. The old pair then stays untouched.
    pub fn compact_file(&self, file_id: u32) -> Result<CompactionResult> {
        if self.writer.lock().current_file_id() == Some(file_id) {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("data file {file_id} is still being written"),
            )));
        }

        let mut result = CompactionResult::default();
        let file = self.files.get(file_id)?;

        let mut live: Vec<(MetricUuid, PageLocation)> = Vec::new();
        let mut dropped: Vec<(MetricUuid, PageLocation)> = Vec::new();
        for (uuid, location, deleted) in self.index.file_pages(file_id) {
            if deleted {
                dropped.push((uuid, location));
            } else {
                live.push((uuid, location));
            }
        }
        live.sort_by_key(|(uuid, loc)| (loc.offset, *uuid, loc.start_time));

        let mut corrupt = HashSet::new();
        for batch in live.chunks(self.config.pages_per_extent.max(1)) {
            let mut pages: Vec<Arc<Page>> = Vec::with_capacity(batch.len());
            let mut sources: Vec<(MetricUuid, PageLocation)> = Vec::with_capacity(batch.len());
            for (uuid, location) in batch {
                match read_page_in(&file, uuid, location) {
                    Ok(page) if !page.is_empty() => {
                        pages.push(Arc::new(page));
                        sources.push((*uuid, *location));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(file_id, uuid = %uuid, error = %e, "dropping unreadable page");
                        corrupt.insert((*uuid, location.start_time));
                        dropped.push((*uuid, *location));
                    }
                }
            }
            if pages.is_empty() {
                continue;
            }

            let flushed = self.writer.lock().flush(&pages)?;
            for ((uuid, old), (_, new)) in sources.iter().zip(flushed.locations) {
                if self.index.replace_location(uuid, old, new) {
                    result.pages_rewritten += 1;
                }
            }
        }

        for (uuid, location) in &dropped {
            if self.index.remove_location(uuid, location) {
                if corrupt.contains(&(*uuid, location.start_time)) {
                    result.pages_corrupt += 1;
                } else {
                    result.pages_dropped += 1;
                }
            }
        }

        self.cache.forget_file(file_id);
        self.files.remove_pair(file_id)?;
        result.files_compacted.push(file_id);

        debug!(
            file_id,
            rewritten = result.pages_rewritten,
            dropped = result.pages_dropped,
            "compacted data file pair"
        );
        Ok(result)
    }
}
