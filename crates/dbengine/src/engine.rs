//! Engine handle tying the index, page cache, extent writer, metadata log and
//! background threads together.
//!
//! # Architecture
//!
//! ```text
//! append_sample ──▶ PageCache ──(page closed)──▶ flush thread ──▶ ExtentWriter
//!                      │                                             │
//! read_range ◀── PageIter ◀── UuidIndex ◀────────── locations ───────┘
//!
//! commit_delete_chart ──▶ MetadataLog ──▶ UuidIndex (tombstones) ──▶ PageCache::purge
//!
//! lifecycle thread: compaction → retention → metadata log truncation
//! ```
//!
//! [`Engine::init`] is the only way to obtain a handle. It runs recovery, opens
//! a fresh data file pair and starts both background threads.

use crate::chart::Chart;
use crate::error::{EngineError, Result};
use crate::extent::{read_page_in, DataFile, DataFileSet, ExtentConfig, ExtentWriter};
use crate::index::{PageLocation, UuidIndex, DEFAULT_INDEX_SHARDS};
use crate::lifecycle::{
    AppliedSeqTracker, CompactionConfig, CompactionResult, Compactor, DiskQuotaPolicy,
    RetentionConfig, RetentionManager,
};
use crate::metalog::{MetadataLog, MetadataLogConfig, MetadataRecord};
use crate::page::{
    MetricUuid, Page, PageCache, PageCacheConfig, Sample, SampleFlags, TimeRange, Timestamp,
};
use crate::recovery::{Recovery, RecoveryReport};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Subdirectory of the data directory holding the metadata log.
pub const METALOG_DIR: &str = "metalog";

/// Default interval of the flush thread.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default interval of the lifecycle thread.
pub const DEFAULT_LIFECYCLE_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum number of pages written as one extent.
pub const MAX_PAGES_PER_EXTENT: usize = 64;

/// Times a read follows a page moved by compaction before giving up.
const RESOLVE_ATTEMPTS: usize = 3;

type ResolvedFile = std::result::Result<Arc<DataFile>, String>;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding data files, journals and the metadata log.
    pub data_dir: PathBuf,
    /// Page cache settings.
    pub cache: PageCacheConfig,
    /// Extent writer settings.
    pub extent: ExtentConfig,
    /// Metadata log settings.
    pub metalog: MetadataLogConfig,
    /// Compaction settings.
    pub compaction: CompactionConfig,
    /// Retention settings.
    pub retention: RetentionConfig,
    /// How often the flush thread wakes up without being signalled.
    pub flush_interval: Duration,
    /// How often compaction, retention and log truncation run.
    pub lifecycle_interval: Duration,
    /// Number of index shards.
    pub index_shards: usize,
}

impl EngineConfig {
    /// Creates a configuration with default settings for `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache: PageCacheConfig::default(),
            extent: ExtentConfig::default(),
            metalog: MetadataLogConfig::default(),
            compaction: CompactionConfig::default(),
            retention: RetentionConfig::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            lifecycle_interval: DEFAULT_LIFECYCLE_INTERVAL,
            index_shards: DEFAULT_INDEX_SHARDS,
        }
    }

    /// Sets the page cache settings.
    pub fn with_cache(mut self, cache: PageCacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the extent writer settings.
    pub fn with_extent(mut self, extent: ExtentConfig) -> Self {
        self.extent = extent;
        self
    }

    /// Sets the metadata log settings.
    pub fn with_metalog(mut self, metalog: MetadataLogConfig) -> Self {
        self.metalog = metalog;
        self
    }

    /// Sets the compaction settings.
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    /// Sets the retention settings.
    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the flush thread interval.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Sets the lifecycle thread interval.
    pub fn with_lifecycle_interval(mut self, lifecycle_interval: Duration) -> Self {
        self.lifecycle_interval = lifecycle_interval;
        self
    }

    /// Sets the number of index shards.
    pub fn with_index_shards(mut self, index_shards: usize) -> Self {
        self.index_shards = index_shards.max(1);
        self
    }
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    /// Samples accepted by `append_sample`.
    pub samples_appended: u64,
    /// Pages written to extents by flushes.
    pub pages_flushed: u64,
    /// Extents written by flushes.
    pub extents_written: u64,
    /// Flush attempts that ended in an error.
    pub flush_failures: u64,
    /// Pages read back from data files.
    pub pages_loaded: u64,
    /// Pages skipped by readers because their extent was corrupt.
    pub corrupt_pages_skipped: u64,
    /// Page cache hit ratio.
    pub cache_hit_ratio: f64,
    /// Pages evicted from the cache.
    pub cache_evictions: u64,
    /// Evictions postponed because nothing was flushed yet.
    pub deferred_evictions: u64,
    /// Times the cache filled up with unflushed pages.
    pub eviction_stalls: u64,
    /// Closed pages held in memory.
    pub cached_pages: usize,
    /// Closed pages waiting to be flushed.
    pub unflushed_pages: usize,
    /// Metrics known to the index, deleted ones included.
    pub metrics: usize,
    /// Data file pairs on disk.
    pub data_files: usize,
    /// Bytes of data and journal files.
    pub disk_bytes: u64,
    /// Deletion events not yet applied on disk.
    pub pending_deletions: usize,
    /// Sequence the next metadata record gets.
    pub metalog_next_sequence: u64,
}

#[derive(Debug, Default)]
struct Counters {
    samples_appended: AtomicU64,
    pages_flushed: AtomicU64,
    extents_written: AtomicU64,
    flush_failures: AtomicU64,
    pages_loaded: AtomicU64,
    corrupt_pages_skipped: AtomicU64,
}

enum FlushCommand {
    Wake,
    Shutdown,
}

struct Shared {
    index: Arc<UuidIndex>,
    cache: Arc<PageCache>,
    files: Arc<DataFileSet>,
    writer: Arc<Mutex<ExtentWriter>>,
    metalog: MetadataLog,
    applied: AppliedSeqTracker,
    compactor: Compactor,
    retention: RetentionManager<DiskQuotaPolicy>,
    counters: Arc<Counters>,
    flush_lock: Mutex<()>,
    lifecycle_lock: Mutex<()>,
}

impl Shared {
    /// Writes every queued page. Pages that could not be written go back to
    /// the front of the queue.
    fn flush_pending(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock();
        let pages: Vec<Arc<Page>> = self
            .cache
            .take_unflushed()
            .into_iter()
            .filter(|page| !page.is_empty() && !self.index.is_deleted(&page.uuid()))
            .collect();

        let mut written = 0;
        for (i, batch) in pages.chunks(MAX_PAGES_PER_EXTENT).enumerate() {
            let flushed = self.writer.lock().flush(batch);
            match flushed {
                Ok(result) => {
                    for ((uuid, location), page) in result.locations.iter().zip(batch) {
                        self.index.insert(*uuid, *location);
                        self.cache.mark_flushed(page, *location);
                    }
                    written += batch.len();
                    self.counters.extents_written.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .pages_flushed
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                    let remaining = pages[i * MAX_PAGES_PER_EXTENT..].to_vec();
                    warn!(pages = remaining.len(), error = %e, "flush failed, pages stay queued");
                    self.cache.requeue(remaining);
                    return Err(e);
                }
            }
        }

        if written > 0 {
            debug!(pages = written, "flushed pages");
        }
        Ok(written)
    }

    /// Runs compaction, retention and metadata log truncation once.
    fn run_lifecycle(&self) -> Result<CompactionResult> {
        let _guard = self.lifecycle_lock.lock();
        let result = self.compactor.run()?;

        let current = self.writer.lock().current_file_id();
        self.retention.run_retention_check(current)?;

        self.truncate_metalog()?;
        Ok(result)
    }

    /// Opens the data file holding the page at `location`.
    ///
    /// Compaction may have moved the page and unlinked its old pair after the
    /// index lookup, so a failed open looks the page up again. Returns `None`
    /// when the page is gone from the index.
    fn resolve(
        &self,
        uuid: &MetricUuid,
        mut location: PageLocation,
    ) -> Option<(PageLocation, ResolvedFile)> {
        for _ in 0..RESOLVE_ATTEMPTS {
            let err = match self.files.get(location.file_id) {
                Ok(file) => return Some((location, Ok(file))),
                Err(e) => e,
            };
            match self.index.location_at(uuid, location.start_time) {
                Some(moved) if moved != location => {
                    debug!(
                        uuid = %uuid,
                        from = location.file_id,
                        to = moved.file_id,
                        "page moved while reading"
                    );
                    location = moved;
                }
                Some(_) => return Some((location, Err(err.to_string()))),
                None => {
                    debug!(uuid = %uuid, start = location.start_time, "page removed while reading");
                    return None;
                }
            }
        }
        let file = self.files.get(location.file_id).map_err(|e| e.to_string());
        Some((location, file))
    }

    fn truncate_metalog(&self) -> Result<usize> {
        for uuid in self.applied.pending_uuids() {
            let on_disk = self
                .index
                .lookup(&uuid)
                .is_some_and(|state| state.page_count > 0);
            if !on_disk && !self.cache.has_pages(&uuid) {
                self.applied.notify_applied(&uuid);
            }
        }

        let Some(safe) = self.applied.safe_sequence() else {
            return Ok(0);
        };
        let truncation = self.metalog.truncate(safe)?;
        for &seq in &truncation.carried_forward {
            self.applied.notify_recorded(seq, None);
        }
        if truncation.segments_removed > 0 {
            debug!(
                safe_sequence = safe,
                segments = truncation.segments_removed,
                carried = truncation.carried_forward.len(),
                "truncated metadata log"
            );
        }
        Ok(truncation.segments_removed)
    }
}

/// Storage engine handle.
pub struct Engine {
    config: EngineConfig,
    shared: Arc<Shared>,
    report: RecoveryReport,
    flush_tx: Sender<FlushCommand>,
    lifecycle_tx: Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config.data_dir)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl Engine {
    /// Recovers the data directory and starts the engine.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::FatalInit` if existing on-disk state cannot be
    /// recovered or the background threads cannot be started.
    pub fn init(config: EngineConfig) -> Result<Self> {
        let data_dir = config.data_dir.clone();
        fs::create_dir_all(&data_dir).map_err(|e| EngineError::fatal_init(&data_dir, e))?;

        let index = Arc::new(UuidIndex::new(config.index_shards));
        let files = Arc::new(DataFileSet::new(&data_dir));
        let recovered = Recovery::new(
            &data_dir,
            data_dir.join(METALOG_DIR),
            config.metalog.clone(),
            Arc::clone(&files),
            Arc::clone(&index),
        )
        .run()?;

        let writer = ExtentWriter::open(
            &data_dir,
            config.extent.clone(),
            Arc::clone(&files),
            recovered.next_file_id,
            recovered.next_extent_id,
        )
        .map_err(|e| EngineError::fatal_init(&data_dir, e))?;
        let writer = Arc::new(Mutex::new(writer));
        let cache = Arc::new(PageCache::new(config.cache.clone(), Arc::clone(&index)));

        let applied = AppliedSeqTracker::new();
        for record in &recovered.deletions {
            match *record {
                MetadataRecord::DeleteChart { sequence, .. } => {
                    applied.notify_recorded(sequence, None)
                }
                MetadataRecord::DeleteDimension { sequence, uuid } => {
                    applied.notify_recorded(sequence, Some(uuid))
                }
            }
        }

        let compactor = Compactor::new(
            config.compaction.clone(),
            Arc::clone(&files),
            Arc::clone(&index),
            Arc::clone(&cache),
            Arc::clone(&writer),
        );
        let retention = RetentionManager::new(
            DiskQuotaPolicy::from_config(&config.retention),
            Arc::clone(&files),
            Arc::clone(&index),
            Arc::clone(&cache),
        );

        let shared = Arc::new(Shared {
            index,
            cache,
            files,
            writer,
            metalog: recovered.metalog,
            applied,
            compactor,
            retention,
            counters: Arc::new(Counters::default()),
            flush_lock: Mutex::new(()),
            lifecycle_lock: Mutex::new(()),
        });

        let (flush_tx, flush_rx) = unbounded();
        let (lifecycle_tx, lifecycle_rx) = unbounded();
        let mut workers = Vec::with_capacity(2);

        let flush_shared = Arc::clone(&shared);
        let flush_interval = config.flush_interval;
        workers.push(
            thread::Builder::new()
                .name("dbengine-flush".into())
                .spawn(move || flush_loop(flush_shared, flush_rx, flush_interval))
                .map_err(|e| EngineError::fatal_init(&data_dir, e))?,
        );

        let lifecycle_shared = Arc::clone(&shared);
        let lifecycle_interval = config.lifecycle_interval;
        let spawned = thread::Builder::new()
            .name("dbengine-lifecycle".into())
            .spawn(move || lifecycle_loop(lifecycle_shared, lifecycle_rx, lifecycle_interval));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                let _ = flush_tx.send(FlushCommand::Shutdown);
                for worker in workers {
                    let _ = worker.join();
                }
                return Err(EngineError::fatal_init(&data_dir, e));
            }
        }

        info!(
            data_dir = %data_dir.display(),
            metrics = shared.index.len(),
            data_files = shared.files.file_ids().len(),
            "engine ready"
        );

        Ok(Self {
            config,
            shared,
            report: recovered.report,
            flush_tx,
            lifecycle_tx,
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        Ok(())
    }

    /// Appends one sample.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownMetric` if the metric was deleted
    /// - `EngineError::OutOfOrderSample` if `timestamp` does not advance
    /// - `EngineError::ShutDown` after [`Engine::shutdown`]
    pub fn append_sample(
        &self,
        uuid: MetricUuid,
        timestamp: Timestamp,
        value: f64,
        flags: SampleFlags,
    ) -> Result<()> {
        self.ensure_running()?;
        let closed = self
            .shared
            .cache
            .append(uuid, Sample::new(timestamp, value, flags))?;
        self.shared
            .counters
            .samples_appended
            .fetch_add(1, Ordering::Relaxed);
        if closed {
            let _ = self.flush_tx.send(FlushCommand::Wake);
        }
        Ok(())
    }

    /// Returns the pages of `uuid` overlapping `range`, ordered by start time.
    ///
    /// Cached pages are served first, the rest is read lazily from disk while
    /// iterating. Deleted and unknown metrics yield nothing.
    pub fn read_range(&self, uuid: MetricUuid, range: TimeRange) -> PageIter {
        if self.shared.index.is_deleted(&uuid) {
            return PageIter::empty(Arc::clone(&self.shared.cache), Arc::clone(&self.shared.counters));
        }

        let cached = self.shared.cache.snapshot(&uuid, range);
        let starts: HashSet<Timestamp> = cached.iter().filter_map(|p| p.start_time()).collect();
        let disk = self
            .shared
            .index
            .locations(&uuid, range)
            .into_iter()
            .filter(|loc| !starts.contains(&loc.start_time))
            .filter_map(|loc| self.shared.resolve(&uuid, loc))
            .collect();

        PageIter {
            uuid,
            cached: cached.into(),
            disk,
            cache: Arc::clone(&self.shared.cache),
            counters: Arc::clone(&self.shared.counters),
        }
    }

    /// Durably deletes `chart` and all its dimensions.
    ///
    /// On return every dimension rejects appends and reads empty, also after a
    /// restart.
    pub fn commit_delete_chart(&self, chart: &Chart) -> Result<()> {
        self.ensure_running()?;
        let sequences = self.shared.metalog.commit_delete_chart(chart)?;

        let mut sequences = sequences.into_iter();
        if let Some(chart_seq) = sequences.next() {
            self.shared.applied.notify_recorded(chart_seq, None);
        }
        for (seq, dimension) in sequences.zip(&chart.dimensions) {
            self.shared.applied.notify_recorded(seq, Some(dimension.uuid));
            self.shared.cache.purge(&dimension.uuid);
        }
        info!(chart = %chart.id, dimensions = chart.dimensions.len(), "chart deleted");
        Ok(())
    }

    /// Durably deletes one dimension. Deleting it again is harmless.
    pub fn delete_dimension_by_uuid(&self, uuid: MetricUuid) -> Result<()> {
        self.ensure_running()?;
        let seq = self.shared.metalog.delete_dimension_by_uuid(uuid)?;
        self.shared.applied.notify_recorded(seq, Some(uuid));
        self.shared.cache.purge(&uuid);
        debug!(uuid = %uuid, sequence = seq, "dimension deleted");
        Ok(())
    }

    /// Closes every open page and writes all queued pages. Returns the number
    /// of pages written.
    pub fn flush(&self) -> Result<usize> {
        self.ensure_running()?;
        self.shared.cache.close_all();
        self.shared.flush_pending()
    }

    /// Runs compaction, retention and metadata log truncation now.
    pub fn compact_now(&self) -> Result<CompactionResult> {
        self.ensure_running()?;
        self.shared.run_lifecycle()
    }

    /// Returns true if `uuid` has been deleted.
    pub fn is_deleted(&self, uuid: &MetricUuid) -> bool {
        self.shared.index.is_deleted(uuid)
    }

    /// What recovery found when the engine started.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Data directory of the engine.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Current statistics.
    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        let counters = &shared.counters;
        let cache_stats = shared.cache.stats();
        EngineStats {
            samples_appended: counters.samples_appended.load(Ordering::Relaxed),
            pages_flushed: counters.pages_flushed.load(Ordering::Relaxed),
            extents_written: counters.extents_written.load(Ordering::Relaxed),
            flush_failures: counters.flush_failures.load(Ordering::Relaxed),
            pages_loaded: counters.pages_loaded.load(Ordering::Relaxed),
            corrupt_pages_skipped: counters.corrupt_pages_skipped.load(Ordering::Relaxed),
            cache_hit_ratio: cache_stats.hit_ratio(),
            cache_evictions: cache_stats.evictions.load(Ordering::Relaxed),
            deferred_evictions: cache_stats.deferred_evictions.load(Ordering::Relaxed),
            eviction_stalls: cache_stats.eviction_stalls.load(Ordering::Relaxed),
            cached_pages: shared.cache.len(),
            unflushed_pages: shared.cache.unflushed_len(),
            metrics: shared.index.len(),
            data_files: shared.files.file_ids().len(),
            disk_bytes: shared.files.total_size(),
            pending_deletions: shared.applied.pending_len(),
            metalog_next_sequence: shared.metalog.next_sequence(),
        }
    }

    /// Stops both background threads and writes every remaining page.
    ///
    /// Later calls are no-ops. Appends and deletions fail with
    /// `EngineError::ShutDown` afterwards; reads keep working.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.flush_tx.send(FlushCommand::Shutdown);
        let _ = self.lifecycle_tx.send(());
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                error!("background thread panicked");
            }
        }

        self.shared.cache.close_all();
        let written = self.shared.flush_pending()?;
        info!(pages = written, "engine shut down");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "final flush failed during drop");
        }
    }
}

fn flush_loop(shared: Arc<Shared>, rx: Receiver<FlushCommand>, interval: Duration) {
    loop {
        match rx.recv_timeout(interval) {
            Ok(FlushCommand::Wake) | Err(RecvTimeoutError::Timeout) => {
                if shared.cache.unflushed_len() == 0 {
                    continue;
                }
                if let Err(e) = shared.flush_pending() {
                    warn!(error = %e, "background flush failed");
                }
            }
            Ok(FlushCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("flush thread stopped");
}

fn lifecycle_loop(shared: Arc<Shared>, rx: Receiver<()>, interval: Duration) {
    loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = shared.run_lifecycle() {
                    warn!(error = %e, "lifecycle run failed");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("lifecycle thread stopped");
}

/// Lazy iterator over the pages of one metric.
///
/// Yields cached pages and pages read from disk merged by start time. Pages
/// whose extent cannot be read are skipped with a warning. The iterator is
/// finite and cannot be restarted.
pub struct PageIter {
    uuid: MetricUuid,
    cached: VecDeque<Arc<Page>>,
    disk: VecDeque<(PageLocation, ResolvedFile)>,
    cache: Arc<PageCache>,
    counters: Arc<Counters>,
}

impl PageIter {
    fn empty(cache: Arc<PageCache>, counters: Arc<Counters>) -> Self {
        Self {
            uuid: MetricUuid::from_bytes([0; 16]),
            cached: VecDeque::new(),
            disk: VecDeque::new(),
            cache,
            counters,
        }
    }

    fn load(&self, location: &PageLocation, file: &ResolvedFile) -> Option<Arc<Page>> {
        let loaded = match file {
            Ok(file) => read_page_in(file, &self.uuid, location),
            Err(reason) => Err(EngineError::CorruptExtent {
                file_id: location.file_id,
                offset: location.offset,
                reason: reason.clone(),
            }),
        };
        match loaded {
            Ok(page) => {
                let page = Arc::new(page);
                self.counters.pages_loaded.fetch_add(1, Ordering::Relaxed);
                self.cache.insert_loaded(Arc::clone(&page), *location);
                Some(page)
            }
            Err(e) => {
                self.counters
                    .corrupt_pages_skipped
                    .fetch_add(1, Ordering::Relaxed);
                warn!(uuid = %self.uuid, error = %e, "skipping unreadable page");
                None
            }
        }
    }
}

impl Iterator for PageIter {
    type Item = Arc<Page>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cached_start = self.cached.front().and_then(|p| p.start_time());
            let disk_start = self.disk.front().map(|(loc, _)| loc.start_time);

            let take_disk = match (cached_start, disk_start) {
                (None, None) => {
                    if self.cached.is_empty() {
                        return None;
                    }
                    false
                }
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (Some(c), Some(d)) => d < c,
            };

            if !take_disk {
                return self.cached.pop_front();
            }
            let (location, file) = self.disk.pop_front()?;
            if let Some(page) = self.load(&location, &file) {
                return Some(page);
            }
        }
    }
}

impl fmt::Debug for PageIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageIter")
            .field("uuid", &self.uuid)
            .field("cached", &self.cached.len())
            .field("disk", &self.disk.len())
            .finish()
    }
}
