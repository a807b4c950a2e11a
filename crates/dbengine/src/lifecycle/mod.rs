//! Lifecycle management modules for compaction, retention and metadata log
//! truncation.

pub mod applied_seq;
pub mod compaction;
pub mod retention;

pub use applied_seq::AppliedSeqTracker;
pub use compaction::{CompactionConfig, CompactionResult, Compactor};
pub use retention::{DiskQuotaPolicy, RetentionConfig, RetentionManager, RetentionPolicy};
