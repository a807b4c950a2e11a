//! Gorilla compression for page samples.
//!
//! Pages are written to extents with Facebook's Gorilla scheme: timestamps as
//! delta-of-delta, values as XOR against the previous value.
//!
//! # Timestamp Encoding (Delta-of-Delta)
//!
//! - First value: 64 bits raw
//! - Subsequent values use variable-length encoding based on delta-of-delta:
//!   - `0`: `'0'` (1 bit)
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - else: `'1111'` + 64 bits
//!
//! # Value Encoding (XOR-based)
//!
//! - First value: 64 bits raw (IEEE 754)
//! - Subsequent values:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Same window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits
//!
//! Decoding never trusts its input: every read is bounds checked and a short or
//! malformed stream surfaces as [`EngineError::DecompressionError`].

use crate::error::{EngineError, Result};
use bitvec::prelude::*;

/// Largest leading-zero count the 5-bit window header can carry.
const MAX_LEADING: u32 = 31;

/// Compressed block containing Gorilla-encoded timestamps and values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlock {
    /// Compressed timestamps using delta-of-delta encoding.
    pub timestamps: BitVec<u8, Msb0>,
    /// Compressed values using XOR encoding.
    pub values: BitVec<u8, Msb0>,
    /// Number of data points in the block.
    pub count: u32,
}

impl CompressedBlock {
    /// Compresses a sequence of (timestamp, value) pairs into a block.
    ///
    /// ```rust,ignore
    /// let points = vec![(1000, 1.0), (1001, 1.1), (1002, 1.2)];
    /// let block = CompressedBlock::compress(&points);
    /// assert_eq!(block.count, 3);
    /// ```
    pub fn compress(points: &[(i64, f64)]) -> Self {
        let mut ts_output = BitVec::<u8, Msb0>::new();
        let mut val_output = BitVec::<u8, Msb0>::new();

        let mut ts_encoder = TimestampEncoder::new();
        let mut val_encoder = ValueEncoder::new();

        for &(ts, val) in points {
            ts_encoder.encode(ts, &mut ts_output);
            val_encoder.encode(val, &mut val_output);
        }

        Self {
            timestamps: ts_output,
            values: val_output,
            count: points.len() as u32,
        }
    }

    /// Rebuilds a block from the byte-padded streams stored in an extent.
    pub fn from_bytes(timestamps: Vec<u8>, values: Vec<u8>, count: u32) -> Self {
        Self {
            timestamps: BitVec::from_vec(timestamps),
            values: BitVec::from_vec(values),
            count,
        }
    }

    /// Timestamp stream padded to whole bytes.
    pub fn timestamp_bytes(&self) -> &[u8] {
        self.timestamps.as_raw_slice()
    }

    /// Value stream padded to whole bytes.
    pub fn value_bytes(&self) -> &[u8] {
        self.values.as_raw_slice()
    }

    /// Decompresses the block back to a sequence of (timestamp, value) pairs.
    pub fn decompress(&self) -> Result<Vec<(i64, f64)>> {
        let mut ts_decoder = TimestampDecoder::new(&self.timestamps);
        let mut val_decoder = ValueDecoder::new(&self.values);

        let mut result = Vec::with_capacity(self.count as usize);

        for i in 0..self.count {
            let ts = ts_decoder.decode_next().ok_or_else(|| {
                EngineError::DecompressionError(format!("timestamp stream ended at point {i}"))
            })?;
            let val = val_decoder.decode_next().ok_or_else(|| {
                EngineError::DecompressionError(format!("value stream ended at point {i}"))
            })?;
            result.push((ts, val));
        }

        Ok(result)
    }
}

/// Bounds-checked MSB-first reader over a bit stream.
struct BitReader<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<bool> {
        let bit = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(bit)
    }

    fn read_bits(&mut self, n: u32) -> Option<u64> {
        if self.pos + n as usize > self.data.len() {
            return None;
        }
        let mut out = 0u64;
        for _ in 0..n {
            out = (out << 1) | u64::from(self.data[self.pos]);
            self.pos += 1;
        }
        Some(out)
    }
}

fn push_bits(output: &mut BitVec<u8, Msb0>, value: u64, n: u32) {
    for i in (0..n).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Encoder for timestamps using delta-of-delta encoding.
#[derive(Debug, Default)]
pub struct TimestampEncoder {
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl TimestampEncoder {
    /// Creates a new timestamp encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a timestamp into the output bit vector.
    pub fn encode(&mut self, timestamp: i64, output: &mut BitVec<u8, Msb0>) {
        if !self.started {
            self.started = true;
            self.prev_ts = timestamp;
            self.prev_delta = 0;
            push_bits(output, timestamp as u64, 64);
            return;
        }

        let delta = timestamp.wrapping_sub(self.prev_ts);
        let delta_of_delta = delta.wrapping_sub(self.prev_delta);

        if delta_of_delta == 0 {
            output.push(false);
        } else if (-63..=64).contains(&delta_of_delta) {
            push_bits(output, 0b10, 2);
            push_bits(output, (delta_of_delta + 63) as u64, 7);
        } else if (-255..=256).contains(&delta_of_delta) {
            push_bits(output, 0b110, 3);
            push_bits(output, (delta_of_delta + 255) as u64, 9);
        } else if (-2047..=2048).contains(&delta_of_delta) {
            push_bits(output, 0b1110, 4);
            push_bits(output, (delta_of_delta + 2047) as u64, 12);
        } else {
            // Full width so arbitrary gaps survive.
            push_bits(output, 0b1111, 4);
            push_bits(output, delta_of_delta as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_ts = timestamp;
    }
}

/// Decoder for delta-of-delta encoded timestamps.
pub struct TimestampDecoder<'a> {
    reader: BitReader<'a>,
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    /// Creates a new timestamp decoder.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            started: false,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    /// Decodes the next timestamp, or `None` if the stream is exhausted or
    /// truncated.
    pub fn decode_next(&mut self) -> Option<i64> {
        if !self.started {
            let ts = self.reader.read_bits(64)? as i64;
            self.started = true;
            self.prev_ts = ts;
            self.prev_delta = 0;
            return Some(ts);
        }

        let r = &mut self.reader;
        let delta_of_delta = if !r.read_bit()? {
            0
        } else if !r.read_bit()? {
            r.read_bits(7)? as i64 - 63
        } else if !r.read_bit()? {
            r.read_bits(9)? as i64 - 255
        } else if !r.read_bit()? {
            r.read_bits(12)? as i64 - 2047
        } else {
            r.read_bits(64)? as i64
        };

        let delta = self.prev_delta.wrapping_add(delta_of_delta);
        let ts = self.prev_ts.wrapping_add(delta);
        self.prev_delta = delta;
        self.prev_ts = ts;

        Some(ts)
    }
}

/// Encoder for float values using XOR compression.
#[derive(Debug, Default)]
pub struct ValueEncoder {
    started: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    /// Creates a new value encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a float value into the output bit vector.
    pub fn encode(&mut self, value: f64, output: &mut BitVec<u8, Msb0>) {
        let bits = value.to_bits();

        if !self.started {
            self.started = true;
            self.prev_value = bits;
            push_bits(output, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_value;

        if xor == 0 {
            output.push(false);
        } else {
            let leading = xor.leading_zeros().min(MAX_LEADING);
            let trailing = xor.trailing_zeros();

            if self.prev_leading + self.prev_trailing > 0
                && leading >= self.prev_leading
                && trailing >= self.prev_trailing
            {
                push_bits(output, 0b10, 2);
                let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
                push_bits(output, xor >> self.prev_trailing, meaningful_bits);
            } else {
                push_bits(output, 0b11, 2);
                push_bits(output, u64::from(leading), 5);

                // Length 1..=64 stored as 0..=63; computed from the capped
                // leading count so the decoder recovers the same window.
                let meaningful_bits = 64 - leading - trailing;
                push_bits(output, u64::from(meaningful_bits - 1), 6);
                push_bits(output, xor >> trailing, meaningful_bits);

                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value = bits;
    }
}

/// Decoder for XOR-encoded float values.
pub struct ValueDecoder<'a> {
    reader: BitReader<'a>,
    started: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    /// Creates a new value decoder.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            started: false,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Decodes the next float value, or `None` if the stream is exhausted or
    /// malformed.
    pub fn decode_next(&mut self) -> Option<f64> {
        if !self.started {
            let bits = self.reader.read_bits(64)?;
            self.started = true;
            self.prev_value = bits;
            return Some(f64::from_bits(bits));
        }

        let r = &mut self.reader;
        let xor = if !r.read_bit()? {
            0u64
        } else if !r.read_bit()? {
            if self.prev_leading + self.prev_trailing == 0 {
                // Same-window reuse before any window was established.
                return None;
            }
            let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
            r.read_bits(meaningful_bits)? << self.prev_trailing
        } else {
            let leading = r.read_bits(5)? as u32;
            let meaningful_bits = r.read_bits(6)? as u32 + 1;
            let trailing = 64u32.checked_sub(leading + meaningful_bits)?;
            let xor_value = r.read_bits(meaningful_bits)?;

            self.prev_leading = leading;
            self.prev_trailing = trailing;

            xor_value << trailing
        };

        let bits = self.prev_value ^ xor;
        self.prev_value = bits;

        Some(f64::from_bits(bits))
    }
}
