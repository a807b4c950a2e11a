//! Page cache: open pages being filled by collectors plus an LRU of closed
//! pages.
//!
//! Every metric owns at most one open page, kept behind its own mutex so the
//! single collector of a metric never contends with other metrics. When the
//! open page reaches `max_points` samples or `max_span` seconds it is closed:
//! it becomes an immutable `Arc<Page>`, is inserted into the closed-page map
//! and queued for the flush thread.
//!
//! Closed pages are evicted least-recently-used first, but only once they have
//! been flushed and therefore have a [`PageLocation`]. When every closed page is
//! still waiting for the flush thread the cache grows past `capacity_pages`
//! instead of dropping data, and the deferral is counted in [`CacheStats`].

use crate::error::{EngineError, Result};
use crate::index::{PageLocation, UuidIndex};
use crate::page::{MetricUuid, Page, Sample, TimeRange, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

/// Default maximum samples per page.
pub const DEFAULT_MAX_POINTS: usize = 1024;

/// Default maximum seconds between the first and last sample of a page.
pub const DEFAULT_MAX_SPAN: i64 = 3600;

/// Default closed-page capacity.
pub const DEFAULT_CAPACITY_PAGES: usize = 4096;

/// Configuration for the page cache.
#[derive(Debug, Clone)]
pub struct PageCacheConfig {
    /// Maximum samples in one page.
    pub max_points: usize,
    /// Maximum seconds spanned by one page.
    pub max_span: i64,
    /// Closed pages kept in memory before eviction kicks in.
    pub capacity_pages: usize,
    /// Number of lock shards.
    pub shard_count: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            max_points: DEFAULT_MAX_POINTS,
            max_span: DEFAULT_MAX_SPAN,
            capacity_pages: DEFAULT_CAPACITY_PAGES,
            shard_count: 16,
        }
    }
}

impl PageCacheConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum samples per page.
    pub fn with_max_points(mut self, max_points: usize) -> Self {
        self.max_points = max_points.max(1);
        self
    }

    /// Sets the maximum span of a page in seconds.
    pub fn with_max_span(mut self, max_span: i64) -> Self {
        self.max_span = max_span;
        self
    }

    /// Sets the closed-page capacity.
    pub fn with_capacity_pages(mut self, capacity_pages: usize) -> Self {
        self.capacity_pages = capacity_pages;
        self
    }

    /// Sets the number of lock shards.
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Reads answered by at least one cached page.
    pub hits: AtomicU64,
    /// Reads that found nothing cached.
    pub misses: AtomicU64,
    /// Closed pages evicted.
    pub evictions: AtomicU64,
    /// Times the cache was over capacity with nothing evictable.
    pub deferred_evictions: AtomicU64,
    /// Times eviction became blocked on unflushed pages.
    pub eviction_stalls: AtomicU64,
}

impl CacheStats {
    /// Hit ratio between 0.0 and 1.0.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Per-metric append state.
#[derive(Debug, Default)]
struct OpenSlot {
    page: Option<Page>,
    last_timestamp: Option<Timestamp>,
    purged: bool,
}

#[derive(Debug)]
struct CachedPage {
    page: Arc<Page>,
    location: Option<PageLocation>,
    last_access: AtomicU64,
}

#[derive(Debug, Default)]
struct Shard {
    open: RwLock<HashMap<MetricUuid, Arc<Mutex<OpenSlot>>>>,
    closed: RwLock<HashMap<MetricUuid, BTreeMap<Timestamp, CachedPage>>>,
}

/// Sharded page cache.
#[derive(Debug)]
pub struct PageCache {
    config: PageCacheConfig,
    index: Arc<UuidIndex>,
    shards: Vec<Shard>,
    /// Closed pages waiting for the flush thread, oldest first.
    unflushed: Mutex<VecDeque<Arc<Page>>>,
    closed_count: AtomicUsize,
    clock: AtomicU64,
    /// Set while the cache sits over capacity with nothing evictable.
    stalled: AtomicBool,
    /// Set when a page gained a disk location since the last scan.
    flushed_since_scan: AtomicBool,
    stats: CacheStats,
}

impl PageCache {
    /// Creates an empty cache backed by `index`.
    pub fn new(config: PageCacheConfig, index: Arc<UuidIndex>) -> Self {
        let shard_count = config.shard_count.max(1);
        Self {
            config,
            index,
            shards: (0..shard_count).map(|_| Shard::default()).collect(),
            unflushed: Mutex::new(VecDeque::new()),
            closed_count: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            stalled: AtomicBool::new(false),
            flushed_since_scan: AtomicBool::new(false),
            stats: CacheStats::default(),
        }
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &PageCacheConfig {
        &self.config
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn shard(&self, uuid: &MetricUuid) -> &Shard {
        let hash = xxh64(uuid.as_bytes(), 0);
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn slot(&self, uuid: MetricUuid) -> Arc<Mutex<OpenSlot>> {
        let shard = self.shard(&uuid);
        if let Some(slot) = shard.open.read().get(&uuid) {
            return Arc::clone(slot);
        }
        let mut open = shard.open.write();
        Arc::clone(open.entry(uuid).or_insert_with(|| {
            Arc::new(Mutex::new(OpenSlot {
                page: None,
                last_timestamp: self.index.last_timestamp(&uuid),
                purged: false,
            }))
        }))
    }

    /// Appends a sample to the metric's open page.
    ///
    /// Returns `Ok(true)` when a full page was closed and queued for flushing.
    pub fn append(&self, uuid: MetricUuid, sample: Sample) -> Result<bool> {
        let slot = self.slot(uuid);
        let mut slot = slot.lock();
        if slot.purged {
            return Err(EngineError::UnknownMetric(uuid));
        }
        // Checked under the slot lock: a purge racing with this append either
        // finds this slot or its deletion is already visible here.
        if self.index.is_deleted(&uuid) {
            drop(slot);
            self.purge(&uuid);
            return Err(EngineError::UnknownMetric(uuid));
        }

        if let Some(last) = slot.last_timestamp {
            if sample.timestamp <= last {
                return Err(EngineError::OutOfOrderSample {
                    uuid,
                    timestamp: sample.timestamp,
                    last,
                });
            }
        }

        let mut closed = false;
        let full = slot.page.as_ref().is_some_and(|page| {
            page.len() >= self.config.max_points
                || page
                    .start_time()
                    .is_some_and(|start| {
                        sample.timestamp.saturating_sub(start) > self.config.max_span
                    })
        });
        if full {
            if let Some(page) = slot.page.take() {
                self.insert_closed(page);
                closed = true;
            }
        }

        slot.page
            .get_or_insert_with(|| Page::with_capacity(uuid, self.config.max_points))
            .push(sample);
        slot.last_timestamp = Some(sample.timestamp);

        Ok(closed)
    }

    fn insert_closed(&self, page: Page) {
        if page.is_empty() {
            return;
        }
        let page = Arc::new(page);
        let Some(start) = page.start_time() else {
            return;
        };
        {
            let mut closed = self.shard(&page.uuid()).closed.write();
            let previous = closed.entry(page.uuid()).or_default().insert(
                start,
                CachedPage {
                    page: Arc::clone(&page),
                    location: None,
                    last_access: AtomicU64::new(self.tick()),
                },
            );
            if previous.is_none() {
                self.closed_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.unflushed.lock().push_back(page);
        self.evict_if_needed();
    }

    /// Closes every open page and queues it for flushing. Returns the number
    /// of pages closed.
    pub fn close_all(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            let slots: Vec<_> = shard.open.read().values().cloned().collect();
            for slot in slots {
                let mut slot = slot.lock();
                if let Some(page) = slot.page.take() {
                    self.insert_closed(page);
                    count += 1;
                }
            }
        }
        if count > 0 {
            debug!(count, "closed open pages");
        }
        count
    }

    /// Drains the closed pages still waiting to be written.
    pub fn take_unflushed(&self) -> Vec<Arc<Page>> {
        self.unflushed.lock().drain(..).collect()
    }

    /// Puts pages back at the front of the flush queue after a failed write.
    pub fn requeue(&self, pages: Vec<Arc<Page>>) {
        let mut queue = self.unflushed.lock();
        for page in pages.into_iter().rev() {
            queue.push_front(page);
        }
    }

    /// Number of closed pages waiting for the flush thread.
    pub fn unflushed_len(&self) -> usize {
        self.unflushed.lock().len()
    }

    /// Records that a closed page reached disk, making it evictable.
    pub fn mark_flushed(&self, page: &Page, location: PageLocation) {
        let Some(start) = page.start_time() else {
            return;
        };
        {
            let mut closed = self.shard(&page.uuid()).closed.write();
            if let Some(cached) = closed
                .get_mut(&page.uuid())
                .and_then(|pages| pages.get_mut(&start))
            {
                cached.location = Some(location);
            }
        }
        self.flushed_since_scan.store(true, Ordering::Relaxed);
        self.evict_if_needed();
    }

    /// Caches a page loaded from disk. Ignored for deleted metrics or when the
    /// page is already cached.
    pub fn insert_loaded(&self, page: Arc<Page>, location: PageLocation) {
        let uuid = page.uuid();
        if self.index.is_deleted(&uuid) {
            return;
        }
        let Some(start) = page.start_time() else {
            return;
        };
        {
            let mut closed = self.shard(&uuid).closed.write();
            let pages = closed.entry(uuid).or_default();
            if pages.contains_key(&start) {
                return;
            }
            pages.insert(
                start,
                CachedPage {
                    page,
                    location: Some(location),
                    last_access: AtomicU64::new(self.tick()),
                },
            );
            self.closed_count.fetch_add(1, Ordering::Relaxed);
        }
        self.flushed_since_scan.store(true, Ordering::Relaxed);
        self.evict_if_needed();
    }

    /// Pages of `uuid` overlapping `range`, open page included, ordered by
    /// start time. The open page is copied so the snapshot stays immutable.
    pub fn snapshot(&self, uuid: &MetricUuid, range: TimeRange) -> Vec<Arc<Page>> {
        let shard = self.shard(uuid);
        let mut pages = Vec::new();

        // Open page first: if it closes meanwhile it shows up again below.
        let slot = shard.open.read().get(uuid).cloned();
        let open = slot.and_then(|slot| {
            let slot = slot.lock();
            slot.page
                .as_ref()
                .filter(|p| p.overlaps(range))
                .map(|p| Arc::new(p.clone()))
        });

        if let Some(cached) = shard.closed.read().get(uuid) {
            let clock = self.tick();
            for entry in cached.values().filter(|c| c.page.overlaps(range)) {
                entry.last_access.store(clock, Ordering::Relaxed);
                pages.push(Arc::clone(&entry.page));
            }
        }

        if let Some(open) = open {
            let start = open.start_time();
            if !pages.iter().any(|p| p.start_time() == start) {
                pages.push(open);
            }
        }

        if pages.is_empty() {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        pages
    }

    /// Drops every page of `uuid`, open or closed, flushed or not.
    pub fn purge(&self, uuid: &MetricUuid) {
        let shard = self.shard(uuid);

        let slot = shard.open.write().remove(uuid);
        if let Some(slot) = slot {
            let mut slot = slot.lock();
            slot.purged = true;
            slot.page = None;
        }

        if let Some(pages) = shard.closed.write().remove(uuid) {
            self.closed_count.fetch_sub(pages.len(), Ordering::Relaxed);
        }

        self.unflushed.lock().retain(|page| page.uuid() != *uuid);
    }

    /// Drops flushed pages whose location points into `file_id`.
    pub fn forget_file(&self, file_id: u32) {
        for shard in &self.shards {
            let mut closed = shard.closed.write();
            for pages in closed.values_mut() {
                let before = pages.len();
                pages.retain(|_, c| c.location.map_or(true, |loc| loc.file_id != file_id));
                self.closed_count
                    .fetch_sub(before - pages.len(), Ordering::Relaxed);
            }
            closed.retain(|_, pages| !pages.is_empty());
        }
    }

    /// Returns true if any page of `uuid` is still held.
    pub fn has_pages(&self, uuid: &MetricUuid) -> bool {
        let shard = self.shard(uuid);
        if shard.closed.read().contains_key(uuid) {
            return true;
        }
        let slot = shard.open.read().get(uuid).cloned();
        slot.is_some_and(|slot| slot.lock().page.is_some())
    }

    /// Number of closed pages held in memory.
    pub fn len(&self) -> usize {
        self.closed_count.load(Ordering::Relaxed)
    }

    /// Returns true if no closed page is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of metrics with an open page.
    pub fn open_pages(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .open
                    .read()
                    .values()
                    .filter(|slot| slot.lock().page.is_some())
                    .count()
            })
            .sum()
    }

    fn evict_if_needed(&self) {
        if self.len() <= self.config.capacity_pages {
            self.stalled.store(false, Ordering::Relaxed);
            return;
        }
        // Nothing became evictable since the last scan came up empty.
        if self.stalled.load(Ordering::Relaxed)
            && !self.flushed_since_scan.swap(false, Ordering::Relaxed)
        {
            self.stats.deferred_evictions.fetch_add(1, Ordering::Relaxed);
            return;
        }
        while self.len() > self.config.capacity_pages {
            let Some((uuid, start, access)) = self.find_lru_flushed() else {
                self.stats.deferred_evictions.fetch_add(1, Ordering::Relaxed);
                if !self.stalled.swap(true, Ordering::Relaxed) {
                    self.stats.eviction_stalls.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        cached = self.len(),
                        capacity = self.config.capacity_pages,
                        "no flushed page to evict, deferring eviction until the next flush"
                    );
                }
                return;
            };

            let mut closed = self.shard(&uuid).closed.write();
            let Some(pages) = closed.get_mut(&uuid) else {
                continue;
            };
            let still_lru = pages.get(&start).is_some_and(|c| {
                c.location.is_some() && c.last_access.load(Ordering::Relaxed) == access
            });
            if still_lru {
                pages.remove(&start);
                if pages.is_empty() {
                    closed.remove(&uuid);
                }
                self.closed_count.fetch_sub(1, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stalled.store(false, Ordering::Relaxed);
    }

    /// Least recently used closed page that already has a disk location.
    fn find_lru_flushed(&self) -> Option<(MetricUuid, Timestamp, u64)> {
        let mut lru: Option<(MetricUuid, Timestamp, u64)> = None;
        for shard in &self.shards {
            for (uuid, pages) in shard.closed.read().iter() {
                for (start, cached) in pages {
                    if cached.location.is_none() {
                        continue;
                    }
                    let access = cached.last_access.load(Ordering::Relaxed);
                    match lru {
                        Some((_, _, min_access)) if access >= min_access => {}
                        _ => lru = Some((*uuid, *start, access)),
                    }
                }
            }
        }
        lru
    }
}
