//! Extent binary format.
//!
//! An extent is the unit appended to a data file by one flush. It carries one
//! or more compressed pages and ends with a checksum trailer, so a torn or
//! bit-rotted extent is always detected before any of its pages are decoded.
//!
//! ## Extent Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Extent Header (28 bytes)                                    │
//! │  - Magic: "DEXT" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Compression: u8 (1 byte)                                  │
//! │  - Reserved: 1 byte                                          │
//! │  - Extent ID: u64 (8 bytes)                                  │
//! │  - Page Count: u32 (4 bytes)                                 │
//! │  - Payload Length: u32 (4 bytes)                             │
//! │  - Reserved: 4 bytes                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Page Blocks (repeated page_count times)                     │
//! │  - UUID, point count, time bounds, ts/value/flags streams    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Trailer (8 bytes)                                           │
//! │  - CRC32 of header and payload (4 bytes)                     │
//! │  - Reverse magic: "TXED" (4 bytes)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{EngineError, Result};
use crate::page::gorilla::CompressedBlock;
use crate::page::{MetricUuid, Page, Sample, SampleFlags, Timestamp};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

/// Magic bytes for the extent header: "DEXT"
pub const EXTENT_MAGIC: [u8; 4] = *b"DEXT";

/// Reverse magic bytes closing the extent trailer: "TXED"
pub const EXTENT_MAGIC_REVERSE: [u8; 4] = *b"TXED";

/// Current extent format version.
pub const EXTENT_VERSION: u16 = 1;

/// Extent header size in bytes.
pub const EXTENT_HEADER_SIZE: usize = 28;

/// Extent trailer size in bytes.
pub const EXTENT_TRAILER_SIZE: usize = 8;

/// Page compression used inside an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// Raw little-endian timestamps and values.
    None = 0,
    /// Gorilla delta-of-delta timestamps and XOR values.
    #[default]
    Gorilla = 1,
}

impl CompressionType {
    /// Converts a u8 to CompressionType.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Gorilla),
            _ => None,
        }
    }
}

/// Extent header (28 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentHeader {
    /// Compression applied to every page of the extent.
    pub compression: CompressionType,
    /// Extent identifier, unique across data files.
    pub extent_id: u64,
    /// Number of page blocks.
    pub page_count: u32,
    /// Length of the page blocks in bytes.
    pub payload_len: u32,
}

impl ExtentHeader {
    /// Writes the header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&EXTENT_MAGIC)?;
        writer.write_all(&EXTENT_VERSION.to_le_bytes())?;
        writer.write_all(&[self.compression as u8, 0])?;
        writer.write_all(&self.extent_id.to_le_bytes())?;
        writer.write_all(&self.page_count.to_le_bytes())?;
        writer.write_all(&self.payload_len.to_le_bytes())?;
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Parses a header from the first [`EXTENT_HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidMagic` or `EngineError::UnsupportedVersion`
    /// if the header does not describe an extent this build can read.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < EXTENT_HEADER_SIZE {
            return Err(EngineError::DecompressionError(format!(
                "extent header needs {EXTENT_HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != EXTENT_MAGIC {
            return Err(EngineError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != EXTENT_VERSION {
            return Err(EngineError::UnsupportedVersion(version));
        }

        let compression = CompressionType::from_u8(buf[6]).ok_or_else(|| {
            EngineError::DecompressionError(format!("unknown compression type {}", buf[6]))
        })?;

        Ok(Self {
            compression,
            extent_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            page_count: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            payload_len: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }

    /// Total extent size described by this header.
    pub fn extent_len(&self) -> usize {
        EXTENT_HEADER_SIZE + self.payload_len as usize + EXTENT_TRAILER_SIZE
    }
}

/// One compressed page inside an extent.
///
/// ```text
/// Offset  Size    Field
/// ------  ----    -----
/// 0x00    16      uuid
/// 0x10    4       point_count (u32 LE)
/// 0x14    8       start_time (i64 LE)
/// 0x1C    8       end_time (i64 LE)
/// 0x24    4       ts_data_size (u32 LE)
/// 0x28    N       ts_data
/// 0x28+N  4       val_data_size (u32 LE)
///         M       val_data
///         4       flags_size (u32 LE)
///         K       flags (one byte per sample)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBlock {
    /// Metric the page belongs to.
    pub uuid: MetricUuid,
    /// Number of samples.
    pub point_count: u32,
    /// First sample timestamp.
    pub start_time: Timestamp,
    /// Last sample timestamp.
    pub end_time: Timestamp,
    /// Encoded timestamps.
    pub ts_data: Vec<u8>,
    /// Encoded values.
    pub val_data: Vec<u8>,
    /// Raw sample flags.
    pub flags: Vec<u8>,
}

impl PageBlock {
    /// Encodes a non-empty page.
    pub fn encode(page: &Page, compression: CompressionType) -> Self {
        let samples = page.samples();
        let (ts_data, val_data) = match compression {
            CompressionType::Gorilla => {
                let points: Vec<(i64, f64)> =
                    samples.iter().map(|s| (s.timestamp, s.value)).collect();
                let block = CompressedBlock::compress(&points);
                (
                    block.timestamp_bytes().to_vec(),
                    block.value_bytes().to_vec(),
                )
            }
            CompressionType::None => (
                samples
                    .iter()
                    .flat_map(|s| s.timestamp.to_le_bytes())
                    .collect(),
                samples.iter().flat_map(|s| s.value.to_le_bytes()).collect(),
            ),
        };

        Self {
            uuid: page.uuid(),
            point_count: samples.len() as u32,
            start_time: page.start_time().unwrap_or_default(),
            end_time: page.end_time().unwrap_or_default(),
            ts_data,
            val_data,
            flags: samples.iter().map(|s| s.flags.as_u8()).collect(),
        }
    }

    /// Decodes the block back into a page.
    pub fn decode(&self, compression: CompressionType) -> Result<Page> {
        let count = self.point_count as usize;
        if self.flags.len() != count {
            return Err(EngineError::DecompressionError(format!(
                "page has {} flag bytes for {} samples",
                self.flags.len(),
                count
            )));
        }

        let points = match compression {
            CompressionType::Gorilla => CompressedBlock::from_bytes(
                self.ts_data.clone(),
                self.val_data.clone(),
                self.point_count,
            )
            .decompress()?,
            CompressionType::None => {
                if self.ts_data.len() != count * 8 || self.val_data.len() != count * 8 {
                    return Err(EngineError::DecompressionError(
                        "raw page stream length mismatch".to_string(),
                    ));
                }
                self.ts_data
                    .chunks_exact(8)
                    .zip(self.val_data.chunks_exact(8))
                    .map(|(ts, val)| {
                        (
                            i64::from_le_bytes(ts.try_into().unwrap()),
                            f64::from_le_bytes(val.try_into().unwrap()),
                        )
                    })
                    .collect()
            }
        };

        let samples = points
            .into_iter()
            .zip(&self.flags)
            .map(|((ts, value), &flags)| Sample::new(ts, value, SampleFlags::from_u8(flags)))
            .collect();
        Ok(Page::from_samples(self.uuid, samples))
    }

    /// Writes the block.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(self.uuid.as_bytes())?;
        writer.write_all(&self.point_count.to_le_bytes())?;
        writer.write_all(&self.start_time.to_le_bytes())?;
        writer.write_all(&self.end_time.to_le_bytes())?;
        for stream in [&self.ts_data, &self.val_data, &self.flags] {
            writer.write_all(&(stream.len() as u32).to_le_bytes())?;
            writer.write_all(stream)?;
        }
        Ok(())
    }

    /// Reads one block from a cursor over an already verified payload.
    pub fn read_from(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut uuid = [0u8; 16];
        reader.read_exact(&mut uuid)?;

        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];
        reader.read_exact(&mut buf4)?;
        let point_count = u32::from_le_bytes(buf4);
        reader.read_exact(&mut buf8)?;
        let start_time = i64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let end_time = i64::from_le_bytes(buf8);

        let ts_data = read_stream(reader)?;
        let val_data = read_stream(reader)?;
        let flags = read_stream(reader)?;

        Ok(Self {
            uuid: MetricUuid::from_bytes(uuid),
            point_count,
            start_time,
            end_time,
            ts_data,
            val_data,
            flags,
        })
    }

    /// Size of the block in bytes when serialized.
    pub fn serialized_size(&self) -> usize {
        16 + 4 + 8 + 8 + 12 + self.ts_data.len() + self.val_data.len() + self.flags.len()
    }
}

fn read_stream(reader: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let mut buf4 = [0u8; 4];
    reader.read_exact(&mut buf4)?;
    let len = u32::from_le_bytes(buf4) as usize;

    let remaining = reader.get_ref().len() - reader.position() as usize;
    if len > remaining {
        return Err(EngineError::DecompressionError(format!(
            "stream of {len} bytes exceeds remaining {remaining}"
        )));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(data)
}

/// Serializes pages into one extent buffer, trailer included.
pub fn encode_extent(
    extent_id: u64,
    pages: &[Arc<Page>],
    compression: CompressionType,
) -> Result<Vec<u8>> {
    let blocks: Vec<PageBlock> = pages
        .iter()
        .filter(|page| !page.is_empty())
        .map(|page| PageBlock::encode(page, compression))
        .collect();
    let payload_len: usize = blocks.iter().map(PageBlock::serialized_size).sum();

    let header = ExtentHeader {
        compression,
        extent_id,
        page_count: blocks.len() as u32,
        payload_len: u32::try_from(payload_len).map_err(|_| {
            EngineError::DecompressionError(format!("extent payload of {payload_len} bytes"))
        })?,
    };

    let mut buf = Vec::with_capacity(header.extent_len());
    header.write_to(&mut buf)?;
    for block in &blocks {
        block.write_to(&mut buf)?;
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&EXTENT_MAGIC_REVERSE);
    Ok(buf)
}

/// Checks structure and checksum of a complete extent buffer.
pub fn verify_extent(buf: &[u8]) -> Result<ExtentHeader> {
    let header = ExtentHeader::parse(buf)?;
    if buf.len() != header.extent_len() {
        return Err(EngineError::DecompressionError(format!(
            "extent length {} does not match header length {}",
            buf.len(),
            header.extent_len()
        )));
    }

    let body_end = buf.len() - EXTENT_TRAILER_SIZE;
    let trailer = &buf[body_end..];
    let magic: [u8; 4] = trailer[4..8].try_into().unwrap();
    if magic != EXTENT_MAGIC_REVERSE {
        return Err(EngineError::InvalidMagic(magic));
    }

    let expected = u32::from_le_bytes(trailer[0..4].try_into().unwrap());
    let actual = crc32fast::hash(&buf[..body_end]);
    if expected != actual {
        return Err(EngineError::ChecksumMismatch { expected, actual });
    }
    Ok(header)
}

/// Verifies an extent and parses all its page blocks.
pub fn decode_extent(buf: &[u8]) -> Result<(ExtentHeader, Vec<PageBlock>)> {
    let header = verify_extent(buf)?;
    let payload = &buf[EXTENT_HEADER_SIZE..buf.len() - EXTENT_TRAILER_SIZE];

    let mut cursor = Cursor::new(payload);
    let mut blocks = Vec::with_capacity(header.page_count as usize);
    for _ in 0..header.page_count {
        blocks.push(PageBlock::read_from(&mut cursor)?);
    }
    Ok((header, blocks))
}
