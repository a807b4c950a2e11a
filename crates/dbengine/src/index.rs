//! UUID index: per-metric page locations and deletion state.
//!
//! The index maps every known [`MetricUuid`] to the on-disk locations of its
//! flushed pages and to its deletion tombstone. It is rebuilt from the journal
//! files and the metadata log on startup and never persisted on its own.
//!
//! Entries are spread over shards chosen by `xxh64(uuid) % shard_count`; each
//! shard sits behind its own `RwLock` so lookups from readers run concurrently
//! while mutations take the shard exclusively.

use crate::page::{MetricUuid, TimeRange, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use xxhash_rust::xxh64::xxh64;

/// Default number of index shards.
pub const DEFAULT_INDEX_SHARDS: usize = 16;

/// Where a flushed page lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLocation {
    /// Data/journal file pair number.
    pub file_id: u32,
    /// Extent the page belongs to.
    pub extent_id: u64,
    /// Byte offset of the extent inside the data file.
    pub offset: u64,
    /// Total extent length in bytes, header and trailer included.
    pub length: u32,
    /// First sample timestamp.
    pub start_time: Timestamp,
    /// Last sample timestamp (inclusive).
    pub end_time: Timestamp,
}

impl PageLocation {
    /// Returns true if the page may hold samples inside `range`.
    pub fn overlaps(&self, range: TimeRange) -> bool {
        range.overlaps(self.start_time, self.end_time)
    }
}

/// Snapshot of one metric's index state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricState {
    /// Sequence of the first deletion record seen for the metric.
    pub deleted_seq: Option<u64>,
    /// Number of flushed pages still referenced.
    pub page_count: usize,
    /// Last flushed sample timestamp.
    pub last_timestamp: Option<Timestamp>,
}

impl MetricState {
    /// Returns true if a deletion was recorded.
    pub fn is_deleted(&self) -> bool {
        self.deleted_seq.is_some()
    }
}

#[derive(Debug, Default)]
struct MetricEntry {
    deleted: Option<u64>,
    pages: BTreeMap<Timestamp, PageLocation>,
}

impl MetricEntry {
    fn last_timestamp(&self) -> Option<Timestamp> {
        self.pages.values().map(|loc| loc.end_time).max()
    }

    fn state(&self) -> MetricState {
        MetricState {
            deleted_seq: self.deleted,
            page_count: self.pages.len(),
            last_timestamp: self.last_timestamp(),
        }
    }
}

/// Sharded map from metric UUID to page locations and tombstones.
#[derive(Debug)]
pub struct UuidIndex {
    shards: Vec<RwLock<HashMap<MetricUuid, MetricEntry>>>,
}

impl Default for UuidIndex {
    fn default() -> Self {
        Self::new(DEFAULT_INDEX_SHARDS)
    }
}

impl UuidIndex {
    /// Creates an empty index with `shard_count` shards (at least one).
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, uuid: &MetricUuid) -> &RwLock<HashMap<MetricUuid, MetricEntry>> {
        let hash = xxh64(uuid.as_bytes(), 0);
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    /// Returns the state of `uuid`, if the index has ever seen it.
    pub fn lookup(&self, uuid: &MetricUuid) -> Option<MetricState> {
        self.shard(uuid).read().get(uuid).map(MetricEntry::state)
    }

    /// Records a flushed page location.
    ///
    /// A location for the same start time replaces the previous one. Locations
    /// are recorded even for deleted metrics so compaction can find and drop
    /// their bytes.
    pub fn insert(&self, uuid: MetricUuid, location: PageLocation) {
        let mut shard = self.shard(&uuid).write();
        shard
            .entry(uuid)
            .or_default()
            .pages
            .insert(location.start_time, location);
    }

    /// Marks `uuid` deleted. Idempotent: the first sequence is kept.
    ///
    /// Returns true if the metric was not deleted before.
    pub fn mark_deleted(&self, uuid: MetricUuid, seq: u64) -> bool {
        let mut shard = self.shard(&uuid).write();
        let entry = shard.entry(uuid).or_default();
        if entry.deleted.is_some() {
            return false;
        }
        entry.deleted = Some(seq);
        true
    }

    /// Returns true if a deletion was recorded for `uuid`.
    pub fn is_deleted(&self, uuid: &MetricUuid) -> bool {
        self.shard(uuid)
            .read()
            .get(uuid)
            .is_some_and(|entry| entry.deleted.is_some())
    }

    /// Last flushed sample timestamp of a live metric.
    pub fn last_timestamp(&self, uuid: &MetricUuid) -> Option<Timestamp> {
        self.shard(uuid)
            .read()
            .get(uuid)
            .and_then(MetricEntry::last_timestamp)
    }

    /// Locations of a live metric's pages overlapping `range`, ordered by
    /// start time. Deleted or unknown metrics have none.
    pub fn locations(&self, uuid: &MetricUuid, range: TimeRange) -> Vec<PageLocation> {
        let shard = self.shard(uuid).read();
        match shard.get(uuid) {
            Some(entry) if entry.deleted.is_none() => entry
                .pages
                .values()
                .filter(|loc| loc.overlaps(range))
                .copied()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Current location of the live page of `uuid` starting at `start_time`.
    pub fn location_at(&self, uuid: &MetricUuid, start_time: Timestamp) -> Option<PageLocation> {
        let shard = self.shard(uuid).read();
        shard
            .get(uuid)
            .filter(|entry| entry.deleted.is_none())
            .and_then(|entry| entry.pages.get(&start_time))
            .copied()
    }

    /// Replaces `old` with `new` if `old` is still the current location for
    /// its start time. Returns false if the page moved or vanished meanwhile.
    pub fn replace_location(
        &self,
        uuid: &MetricUuid,
        old: &PageLocation,
        new: PageLocation,
    ) -> bool {
        let mut shard = self.shard(uuid).write();
        let Some(entry) = shard.get_mut(uuid) else {
            return false;
        };
        match entry.pages.get(&old.start_time) {
            Some(current) if current == old => {
                entry.pages.remove(&old.start_time);
                entry.pages.insert(new.start_time, new);
                true
            }
            _ => false,
        }
    }

    /// Removes one location if it is still current.
    pub fn remove_location(&self, uuid: &MetricUuid, location: &PageLocation) -> bool {
        let mut shard = self.shard(uuid).write();
        let Some(entry) = shard.get_mut(uuid) else {
            return false;
        };
        if entry.pages.get(&location.start_time) == Some(location) {
            entry.pages.remove(&location.start_time);
            return true;
        }
        false
    }

    /// Drops every location pointing into `file_id`. Returns how many were
    /// removed.
    pub fn remove_file(&self, file_id: u32) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write();
            for entry in shard.values_mut() {
                let before = entry.pages.len();
                entry.pages.retain(|_, loc| loc.file_id != file_id);
                removed += before - entry.pages.len();
            }
            shard.retain(|_, entry| entry.deleted.is_some() || !entry.pages.is_empty());
        }
        removed
    }

    /// Drops every location of a deleted metric and returns them. The
    /// tombstone stays so appends keep failing.
    pub fn purge(&self, uuid: &MetricUuid) -> Vec<PageLocation> {
        let mut shard = self.shard(uuid).write();
        match shard.get_mut(uuid) {
            Some(entry) if entry.deleted.is_some() => {
                std::mem::take(&mut entry.pages).into_values().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Deleted metrics that no longer reference any page, with their
    /// deletion sequence.
    pub fn deleted_without_data(&self) -> Vec<(MetricUuid, u64)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            for (uuid, entry) in shard.read().iter() {
                if let Some(seq) = entry.deleted {
                    if entry.pages.is_empty() {
                        out.push((*uuid, seq));
                    }
                }
            }
        }
        out
    }

    /// Every location stored in `file_id`, with its metric and deletion flag.
    pub fn file_pages(&self, file_id: u32) -> Vec<(MetricUuid, PageLocation, bool)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            for (uuid, entry) in shard.read().iter() {
                let deleted = entry.deleted.is_some();
                out.extend(
                    entry
                        .pages
                        .values()
                        .filter(|loc| loc.file_id == file_id)
                        .map(|loc| (*uuid, *loc, deleted)),
                );
            }
        }
        out
    }

    /// Number of known metrics, deleted ones included.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Returns true if no metric is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(file_id: u32, start: i64, end: i64) -> PageLocation {
        PageLocation {
            file_id,
            extent_id: 1,
            offset: 0,
            length: 128,
            start_time: start,
            end_time: end,
        }
    }

    #[test]
    fn test_insert_and_locations() {
        let index = UuidIndex::new(4);
        let uuid = MetricUuid::new_v4();

        index.insert(uuid, loc(1, 200, 299));
        index.insert(uuid, loc(1, 100, 199));
        index.insert(uuid, loc(2, 300, 399));

        let all = index.locations(&uuid, TimeRange::all());
        let starts: Vec<_> = all.iter().map(|l| l.start_time).collect();
        assert_eq!(starts, vec![100, 200, 300]);

        let some = index.locations(&uuid, TimeRange::new(250, 301));
        assert_eq!(some.len(), 2);
        assert_eq!(index.last_timestamp(&uuid), Some(399));
    }

    #[test]
    fn test_later_location_overrides_same_start() {
        let index = UuidIndex::new(1);
        let uuid = MetricUuid::new_v4();
        index.insert(uuid, loc(1, 100, 199));
        index.insert(uuid, loc(2, 100, 199));

        let all = index.locations(&uuid, TimeRange::all());
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].file_id, 2);
    }

    #[test]
    fn test_location_at_follows_moves() {
        let index = UuidIndex::new(2);
        let uuid = MetricUuid::new_v4();
        let old = loc(1, 100, 199);
        index.insert(uuid, old);
        assert_eq!(index.location_at(&uuid, 100), Some(old));
        assert_eq!(index.location_at(&uuid, 150), None);

        assert!(index.replace_location(&uuid, &old, loc(3, 100, 199)));
        assert_eq!(index.location_at(&uuid, 100).map(|l| l.file_id), Some(3));

        index.mark_deleted(uuid, 1);
        assert_eq!(index.location_at(&uuid, 100), None);
    }

    #[test]
    fn test_mark_deleted_is_idempotent() {
        let index = UuidIndex::new(2);
        let uuid = MetricUuid::new_v4();

        assert!(!index.is_deleted(&uuid));
        assert!(index.mark_deleted(uuid, 5));
        assert!(!index.mark_deleted(uuid, 9));
        assert!(index.is_deleted(&uuid));
        assert_eq!(index.lookup(&uuid).unwrap().deleted_seq, Some(5));
    }

    #[test]
    fn test_deleted_metric_hides_locations() {
        let index = UuidIndex::new(2);
        let uuid = MetricUuid::new_v4();
        index.insert(uuid, loc(1, 0, 10));
        index.mark_deleted(uuid, 1);

        assert!(index.locations(&uuid, TimeRange::all()).is_empty());
        assert_eq!(index.file_pages(1).len(), 1);
        assert!(index.deleted_without_data().is_empty());

        let purged = index.purge(&uuid);
        assert_eq!(purged.len(), 1);
        assert!(index.is_deleted(&uuid));
        assert_eq!(index.deleted_without_data(), vec![(uuid, 1)]);
    }

    #[test]
    fn test_replace_location_compare_and_swap() {
        let index = UuidIndex::new(1);
        let uuid = MetricUuid::new_v4();
        let old = loc(1, 0, 10);
        index.insert(uuid, old);

        let moved = loc(3, 0, 10);
        assert!(index.replace_location(&uuid, &old, moved));
        assert!(!index.replace_location(&uuid, &old, loc(4, 0, 10)));
        assert_eq!(index.locations(&uuid, TimeRange::all()), vec![moved]);
    }

    #[test]
    fn test_remove_file() {
        let index = UuidIndex::new(8);
        let a = MetricUuid::new_v4();
        let b = MetricUuid::new_v4();
        index.insert(a, loc(1, 0, 10));
        index.insert(a, loc(2, 20, 30));
        index.insert(b, loc(1, 0, 10));

        assert_eq!(index.remove_file(1), 2);
        assert_eq!(index.len(), 1);
        assert!(index.lookup(&b).is_none());
        assert_eq!(index.lookup(&a).unwrap().page_count, 1);
    }
}
