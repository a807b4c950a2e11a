//! Retention policy and manager for disk-quota based pair deletion.

use crate::error::Result;
use crate::extent::DataFileSet;
use crate::index::UuidIndex;
use crate::page::PageCache;
use std::sync::Arc;
use tracing::{error, info};

/// Default disk quota for data and journal files (256 MB).
pub const DEFAULT_MAX_DISK_BYTES: u64 = 256 * 1024 * 1024;

/// Retention configuration.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Combined size of all data and journal files allowed on disk.
    pub max_disk_bytes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_disk_bytes: DEFAULT_MAX_DISK_BYTES,
        }
    }
}

impl RetentionConfig {
    /// Creates a configuration with a custom quota.
    pub fn new(max_disk_bytes: u64) -> Self {
        Self { max_disk_bytes }
    }
}

/// Retention policy deciding which file pairs to drop.
pub trait RetentionPolicy: Send + Sync {
    /// Returns the pairs to drop, given `(file_id, size)` of every pair
    /// eligible for deletion, oldest first, and the total size on disk.
    fn select(&self, pairs: &[(u32, u64)], total_bytes: u64) -> Vec<u32>;
}

/// Drops the oldest pairs while the total size exceeds a quota.
#[derive(Debug, Clone)]
pub struct DiskQuotaPolicy {
    max_disk_bytes: u64,
}

impl Default for DiskQuotaPolicy {
    fn default() -> Self {
        Self::from_config(&RetentionConfig::default())
    }
}

impl DiskQuotaPolicy {
    /// Creates a policy with a custom quota.
    pub fn new(max_disk_bytes: u64) -> Self {
        Self { max_disk_bytes }
    }

    /// Creates a policy from a retention configuration.
    pub fn from_config(config: &RetentionConfig) -> Self {
        Self::new(config.max_disk_bytes)
    }
}

impl RetentionPolicy for DiskQuotaPolicy {
    fn select(&self, pairs: &[(u32, u64)], total_bytes: u64) -> Vec<u32> {
        let mut remaining = total_bytes;
        let mut selected = Vec::new();
        for &(file_id, size) in pairs {
            if remaining <= self.max_disk_bytes {
                break;
            }
            remaining = remaining.saturating_sub(size);
            selected.push(file_id);
        }
        selected
    }
}

/// Retention manager dropping whole file pairs.
pub struct RetentionManager<P: RetentionPolicy> {
    policy: P,
    files: Arc<DataFileSet>,
    index: Arc<UuidIndex>,
    cache: Arc<PageCache>,
}

impl<P: RetentionPolicy> RetentionManager<P> {
    /// Creates a new retention manager.
    pub fn new(
        policy: P,
        files: Arc<DataFileSet>,
        index: Arc<UuidIndex>,
        cache: Arc<PageCache>,
    ) -> Self {
        Self {
            policy,
            files,
            index,
            cache,
        }
    }

    /// Runs a retention check, never touching `current_file_id`. Returns the
    /// number of pairs dropped.
    pub fn run_retention_check(&self, current_file_id: Option<u32>) -> Result<usize> {
        let total = self.files.total_size();
        let pairs: Vec<(u32, u64)> = self
            .files
            .file_ids()
            .into_iter()
            .filter(|&id| Some(id) != current_file_id)
            .map(|id| (id, self.files.pair_size(id)))
            .collect();

        let mut dropped = 0;
        for file_id in self.policy.select(&pairs, total) {
            match self.drop_pair(file_id) {
                Ok(pages) => {
                    info!(file_id, pages, "retention dropped data file pair");
                    dropped += 1;
                }
                Err(err) => {
                    error!(file_id, error = %err, "retention drop failed");
                }
            }
        }
        Ok(dropped)
    }

    fn drop_pair(&self, file_id: u32) -> Result<usize> {
        let pages = self.index.remove_file(file_id);
        self.cache.forget_file(file_id);
        self.files.remove_pair(file_id)?;
        Ok(pages)
    }
}
