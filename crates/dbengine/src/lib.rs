//! Alopex DB Engine - page-oriented time series storage
//!
//! This crate stores fixed-interval metric samples in compressed pages, groups
//! flushed pages into checksummed extents, and keeps chart and dimension
//! deletions in an independent metadata log that always wins over data on
//! restart.
//!
//! # Components
//!
//! - [`UuidIndex`]: Metric UUID to page locations and deletion tombstones
//! - [`PageCache`]: Open and recently used pages with LRU eviction
//! - [`ExtentWriter`]: Extents in data files plus per-page journal records
//! - [`MetadataLog`]: Durable `DeleteChart` / `DeleteDimension` events
//! - [`Recovery`]: Journal and metadata log replay on startup
//! - [`Engine`]: The handle tying everything together
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_dbengine::{Chart, Dimension, Engine, EngineConfig, SampleFlags, TimeRange};
//!
//! let engine = Engine::init(EngineConfig::new("/var/lib/dbengine"))?;
//!
//! let chart = Chart::new("system.cpu").with_dimension(Dimension::new("user"));
//! let user = chart.dimensions[0].uuid;
//!
//! engine.append_sample(user, now, 12.5, SampleFlags::exists())?;
//! for page in engine.read_range(user, TimeRange::new(now - 3600, now + 1)) {
//!     println!("{} samples from {:?}", page.len(), page.start_time());
//! }
//!
//! engine.commit_delete_chart(&chart)?;
//! engine.shutdown()?;
//! ```

#![deny(missing_docs)]

pub mod chart;
pub mod durability;
pub mod engine;
pub mod error;
pub mod extent;
pub mod index;
pub mod lifecycle;
pub mod metalog;
pub mod page;
pub mod recovery;

pub use chart::{Algorithm, Chart, ChartId, Dimension};
pub use durability::SyncMode;
pub use engine::{Engine, EngineConfig, EngineStats, PageIter};
pub use error::{EngineError, Result};
pub use extent::{ExtentConfig, ExtentWriter};
pub use index::{MetricState, PageLocation, UuidIndex};
pub use lifecycle::{CompactionConfig, RetentionConfig};
pub use metalog::{MetadataLog, MetadataLogConfig, MetadataRecord, Truncation};
pub use page::{
    MetricUuid, Page, PageCache, PageCacheConfig, Sample, SampleFlags, TimeRange, Timestamp,
};
pub use recovery::{Recovery, RecoveryReport, RecoveryState};
