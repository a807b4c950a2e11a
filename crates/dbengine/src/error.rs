//! Error and Result types for the storage engine.

use crate::page::MetricUuid;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// On-disk state exists but cannot be read past the recoverable tail.
    /// The engine must not start.
    #[error("Fatal initialization error at {path}: {reason}")]
    FatalInit {
        /// File or directory that could not be opened or parsed.
        path: PathBuf,
        /// Human readable cause.
        reason: String,
    },

    /// An extent failed checksum or structural validation.
    #[error("Corrupt extent in data file {file_id} at offset {offset}: {reason}")]
    CorruptExtent {
        /// Data file number.
        file_id: u32,
        /// Byte offset of the extent inside the data file.
        offset: u64,
        /// Human readable cause.
        reason: String,
    },

    /// The metric was deleted or never created.
    #[error("Unknown metric: {0}")]
    UnknownMetric(MetricUuid),

    /// A sample timestamp did not advance past the last stored sample.
    #[error("Out of order sample for {uuid}: timestamp {timestamp} <= last {last}")]
    OutOfOrderSample {
        /// Metric receiving the sample.
        uuid: MetricUuid,
        /// Rejected timestamp.
        timestamp: i64,
        /// Last timestamp already stored for the metric.
        last: i64,
    },

    /// A flush or compaction write kept failing after all retries.
    #[error("I/O failure after {attempts} attempts: {source}")]
    IoFailure {
        /// Number of attempts made.
        attempts: u32,
        /// Last error observed.
        #[source]
        source: io::Error,
    },

    /// Invalid magic bytes in a file or extent header.
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Record or extent checksum does not match.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Stored CRC32 checksum.
        expected: u32,
        /// Computed CRC32 checksum.
        actual: u32,
    },

    /// Error while decoding compressed page data.
    #[error("Decompression error: {0}")]
    DecompressionError(String),

    /// A dimension definition was rejected.
    #[error("Invalid dimension {id}: {reason}")]
    InvalidDimension {
        /// Dimension id.
        id: String,
        /// Human readable cause.
        reason: String,
    },

    /// The engine has been shut down.
    #[error("Engine is shut down")]
    ShutDown,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Builds a [`EngineError::FatalInit`] from any displayable cause.
    pub fn fatal_init(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::FatalInit {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true for errors a flush or compaction may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
