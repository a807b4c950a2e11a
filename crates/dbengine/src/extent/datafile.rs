//! Data/journal file pairs and the registry of open data files.
//!
//! Data and journal files are paired by file number:
//! `datafile-00000001.ndf` holds extents, `journal-00000001.njf` holds the
//! records describing the pages inside them. Both start with a 16-byte file
//! header.
//!
//! Readers go through [`DataFileSet`], which hands out `Arc<DataFile>` handles.
//! A handle keeps its descriptor open, so a reader holding a stale location can
//! finish even after compaction or retention unlinked the file.

use crate::error::{EngineError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Data file magic: "DNDF"
pub const DATAFILE_MAGIC: [u8; 4] = *b"DNDF";

/// Journal file magic: "DNJF"
pub const JOURNAL_MAGIC: [u8; 4] = *b"DNJF";

/// Data and journal file format version.
pub const FILE_VERSION: u16 = 1;

/// Size of the header at the start of data and journal files.
pub const FILE_HEADER_SIZE: u64 = 16;

const DATAFILE_PREFIX: &str = "datafile-";
const DATAFILE_EXTENSION: &str = "ndf";
const JOURNAL_PREFIX: &str = "journal-";
const JOURNAL_EXTENSION: &str = "njf";

/// Path of data file `file_id` inside `dir`.
pub fn datafile_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{DATAFILE_PREFIX}{file_id:08}.{DATAFILE_EXTENSION}"))
}

/// Path of journal file `file_id` inside `dir`.
pub fn journal_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{JOURNAL_PREFIX}{file_id:08}.{JOURNAL_EXTENSION}"))
}

fn parse_file_id(path: &Path) -> Option<u32> {
    let ext = path.extension()?.to_str()?;
    let stem = path.file_stem()?.to_str()?;
    let digits = match ext {
        DATAFILE_EXTENSION => stem.strip_prefix(DATAFILE_PREFIX)?,
        JOURNAL_EXTENSION => stem.strip_prefix(JOURNAL_PREFIX)?,
        _ => return None,
    };
    digits.parse().ok()
}

/// File numbers with a data or journal file in `dir`, ascending.
pub fn list_file_ids(dir: &Path) -> io::Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_file_id(&path) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Header at the start of data and journal files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// [`DATAFILE_MAGIC`] or [`JOURNAL_MAGIC`].
    pub magic: [u8; 4],
    /// Format version.
    pub version: u16,
    /// File pair number.
    pub file_id: u32,
}

impl FileHeader {
    /// Creates a header for the current format version.
    pub fn new(magic: [u8; 4], file_id: u32) -> Self {
        Self {
            magic,
            version: FILE_VERSION,
            file_id,
        }
    }

    /// Writes the header.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&self.file_id.to_le_bytes())?;
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Reads and validates a header carrying `magic`.
    pub fn read_from<R: Read>(reader: &mut R, magic: [u8; 4]) -> Result<Self> {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        reader.read_exact(&mut buf)?;

        let found: [u8; 4] = buf[0..4].try_into().unwrap();
        if found != magic {
            return Err(EngineError::InvalidMagic(found));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != FILE_VERSION {
            return Err(EngineError::UnsupportedVersion(version));
        }
        Ok(Self {
            magic,
            version,
            file_id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

/// Creates a new file holding only `header`, failing if it already exists.
pub(crate) fn create_with_header(path: &Path, header: FileHeader) -> Result<File> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(path)?;
    let mut buf = Vec::with_capacity(FILE_HEADER_SIZE as usize);
    header.write_to(&mut buf)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(file)
}

/// Read-only handle to a data file.
#[derive(Debug)]
pub struct DataFile {
    file_id: u32,
    path: PathBuf,
    file: File,
}

impl DataFile {
    /// Opens a data file and validates its header.
    pub fn open(path: &Path, file_id: u32) -> Result<Self> {
        let mut file = File::open(path)?;
        FileHeader::read_from(&mut file, DATAFILE_MAGIC)?;
        Ok(Self {
            file_id,
            path: path.to_path_buf(),
            file,
        })
    }

    /// File pair number.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size in bytes.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Returns true if the file holds no extent.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? <= FILE_HEADER_SIZE)
    }

    /// Reads exactly `len` bytes at `offset` without moving any shared cursor.
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(buf)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Registry of open data files, keyed by file number.
#[derive(Debug)]
pub struct DataFileSet {
    dir: PathBuf,
    files: RwLock<BTreeMap<u32, Arc<DataFile>>>,
}

impl DataFileSet {
    /// Creates an empty registry for `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: RwLock::new(BTreeMap::new()),
        }
    }

    /// Directory holding the file pairs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the handle for `file_id`, opening it on first use.
    pub fn get(&self, file_id: u32) -> Result<Arc<DataFile>> {
        if let Some(file) = self.files.read().get(&file_id) {
            return Ok(Arc::clone(file));
        }
        let mut files = self.files.write();
        if let Some(file) = files.get(&file_id) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(DataFile::open(&datafile_path(&self.dir, file_id), file_id)?);
        files.insert(file_id, Arc::clone(&file));
        Ok(file)
    }

    /// Registers a file pair so it shows up in [`DataFileSet::file_ids`].
    pub fn register(&self, file_id: u32) -> Result<()> {
        self.get(file_id).map(|_| ())
    }

    /// Registered file numbers, ascending.
    pub fn file_ids(&self) -> Vec<u32> {
        self.files.read().keys().copied().collect()
    }

    /// Size in bytes of one data file.
    pub fn file_size(&self, file_id: u32) -> Result<u64> {
        Ok(self.get(file_id)?.len()?)
    }

    /// Combined size of the data and journal file of one pair.
    pub fn pair_size(&self, file_id: u32) -> u64 {
        let data = fs::metadata(datafile_path(&self.dir, file_id)).map_or(0, |m| m.len());
        let journal = fs::metadata(journal_path(&self.dir, file_id)).map_or(0, |m| m.len());
        data + journal
    }

    /// Combined size of the registered data and journal files.
    pub fn total_size(&self) -> u64 {
        self.file_ids().into_iter().map(|id| self.pair_size(id)).sum()
    }

    /// Unregisters and unlinks both files of a pair. Handles already handed
    /// out stay readable until dropped.
    pub fn remove_pair(&self, file_id: u32) -> Result<()> {
        self.files.write().remove(&file_id);
        for path in [
            datafile_path(&self.dir, file_id),
            journal_path(&self.dir, file_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(file_id, "removed data file pair");
        Ok(())
    }
}
