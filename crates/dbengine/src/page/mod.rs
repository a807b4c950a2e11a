//! Page types shared by the cache, the extent writer and the read path.
//!
//! A [`Page`] is a bounded, time-ordered run of [`Sample`]s for a single
//! [`MetricUuid`]. Pages are mutable only while open in the page cache; once
//! closed they are shared as `Arc<Page>` and never change again.

pub mod cache;
pub mod gorilla;

pub use cache::{CacheStats, PageCache, PageCacheConfig};
pub use gorilla::CompressedBlock;

use std::fmt;
use uuid::Uuid;

/// Timestamp in seconds since the Unix epoch.
pub type Timestamp = i64;

/// Stable 128-bit identifier of a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricUuid(Uuid);

impl MetricUuid {
    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generates a random (v4) metric UUID.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds a metric UUID from its 16 raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16 raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for MetricUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MetricUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: Timestamp,
    /// Exclusive end.
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates a new range.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range covering every representable timestamp.
    pub fn all() -> Self {
        Self {
            start: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }

    /// Returns true if `ts` falls inside the range.
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Returns true if the closed interval `[first, last]` overlaps the range.
    pub fn overlaps(&self, first: Timestamp, last: Timestamp) -> bool {
        first < self.end && last >= self.start
    }
}

/// Per-sample flags (storage number flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SampleFlags(u8);

impl SampleFlags {
    /// No value was collected for this slot.
    pub const EMPTY: u8 = 0;
    /// A value exists.
    pub const EXISTS: u8 = 0b001;
    /// The counter overflowed or was reset before this value.
    pub const RESET: u8 = 0b010;
    /// The value was flagged by anomaly detection.
    pub const ANOMALOUS: u8 = 0b100;

    /// Flags for an ordinary collected value.
    pub fn exists() -> Self {
        Self(Self::EXISTS)
    }

    /// Creates flags from the raw byte.
    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }

    /// Returns the raw byte.
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns true if a value exists.
    pub fn is_exists(self) -> bool {
        self.0 & Self::EXISTS != 0
    }

    /// Returns true if the reset flag is set.
    pub fn is_reset(self) -> bool {
        self.0 & Self::RESET != 0
    }

    /// Returns true if the anomalous flag is set.
    pub fn is_anomalous(self) -> bool {
        self.0 & Self::ANOMALOUS != 0
    }

    /// Sets the reset flag.
    pub fn set_reset(&mut self) {
        self.0 |= Self::RESET;
    }

    /// Sets the anomalous flag.
    pub fn set_anomalous(&mut self) {
        self.0 |= Self::ANOMALOUS;
    }
}

/// A single collected sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Collection time in seconds.
    pub timestamp: Timestamp,
    /// Stored value.
    pub value: f64,
    /// Storage flags.
    pub flags: SampleFlags,
}

impl Sample {
    /// Creates a new sample.
    pub fn new(timestamp: Timestamp, value: f64, flags: SampleFlags) -> Self {
        Self {
            timestamp,
            value,
            flags,
        }
    }
}

/// A bounded run of time-ordered samples for one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    uuid: MetricUuid,
    samples: Vec<Sample>,
}

impl Page {
    /// Creates an empty page.
    pub fn new(uuid: MetricUuid) -> Self {
        Self {
            uuid,
            samples: Vec::new(),
        }
    }

    /// Creates an empty page with room for `capacity` samples.
    pub fn with_capacity(uuid: MetricUuid, capacity: usize) -> Self {
        Self {
            uuid,
            samples: Vec::with_capacity(capacity),
        }
    }

    /// Creates a page from already ordered samples.
    pub fn from_samples(uuid: MetricUuid, samples: Vec<Sample>) -> Self {
        Self { uuid, samples }
    }

    /// Metric the page belongs to.
    pub fn uuid(&self) -> MetricUuid {
        self.uuid
    }

    /// All samples in timestamp order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Samples falling inside `range`.
    pub fn samples_in(&self, range: TimeRange) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter().filter(move |s| range.contains(s.timestamp))
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the page has no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp of the first sample.
    pub fn start_time(&self) -> Option<Timestamp> {
        self.samples.first().map(|s| s.timestamp)
    }

    /// Timestamp of the last sample.
    pub fn end_time(&self) -> Option<Timestamp> {
        self.samples.last().map(|s| s.timestamp)
    }

    /// Returns true if the page has samples overlapping `range`.
    pub fn overlaps(&self, range: TimeRange) -> bool {
        match (self.start_time(), self.end_time()) {
            (Some(first), Some(last)) => range.overlaps(first, last),
            _ => false,
        }
    }

    pub(crate) fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Approximate in-memory footprint.
    pub fn memory_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.samples.capacity() * std::mem::size_of::<Sample>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_half_open() {
        let range = TimeRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(19));
        assert!(!range.contains(20));
        assert!(range.overlaps(19, 30));
        assert!(!range.overlaps(20, 30));
        assert!(range.overlaps(0, 10));
    }

    #[test]
    fn test_sample_flags() {
        let mut flags = SampleFlags::exists();
        assert!(flags.is_exists());
        assert!(!flags.is_reset());
        flags.set_reset();
        flags.set_anomalous();
        assert_eq!(
            flags.as_u8(),
            SampleFlags::EXISTS | SampleFlags::RESET | SampleFlags::ANOMALOUS
        );
        assert!(!SampleFlags::default().is_exists());
    }

    #[test]
    fn test_page_bounds() {
        let uuid = MetricUuid::new_v4();
        let mut page = Page::new(uuid);
        assert_eq!(page.start_time(), None);
        assert!(!page.overlaps(TimeRange::all()));

        for ts in [100, 110, 120] {
            page.push(Sample::new(ts, ts as f64, SampleFlags::exists()));
        }
        assert_eq!(page.start_time(), Some(100));
        assert_eq!(page.end_time(), Some(120));
        assert_eq!(page.samples_in(TimeRange::new(105, 121)).count(), 2);
    }

    #[test]
    fn test_metric_uuid_bytes() {
        let uuid = MetricUuid::new_v4();
        assert_eq!(MetricUuid::from_bytes(*uuid.as_bytes()), uuid);
    }
}
