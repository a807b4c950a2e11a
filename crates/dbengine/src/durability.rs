//! Sync policy shared by the extent writer and the metadata log.

use std::fs::File;
use std::io;

/// Sync mode for write durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each write (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

impl SyncMode {
    /// Makes the written bytes of `file` durable according to the mode.
    pub fn sync(self, file: &File) -> io::Result<()> {
        match self {
            SyncMode::Fsync => file.sync_all(),
            SyncMode::Fdatasync => file.sync_data(),
            SyncMode::None => Ok(()),
        }
    }
}

/// Seconds since the Unix epoch, or 0 if the clock is before it.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
