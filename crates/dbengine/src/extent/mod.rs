//! On-disk extents, journals and the writer producing them.

pub mod datafile;
pub mod format;
pub mod journal;
pub mod writer;

pub use datafile::{DataFile, DataFileSet};
pub use format::CompressionType;
pub use journal::{JournalRecord, JournalScan};
pub use writer::{read_page, read_page_in, ExtentConfig, ExtentWriter, FlushResult};
