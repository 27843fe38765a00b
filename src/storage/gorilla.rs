//! Gorilla-compressed value blocks
//!
//! Each series owns one append-only block encoding `(ts, value)` pairs:
//! timestamps as delta-of-delta (u32 seconds on the wire) and values as
//! XOR against the previous value. Typical monitoring workloads land
//! around 1-2 bytes per point.
//!
//! Block byte layout: a `u32` point count followed by the bitstream. The
//! count prefix makes a raw stream read back from a segment file
//! self-describing.

use crate::storage::error::{StorageError, StorageResult};

/// Bit writer for encoding compressed data
#[derive(Debug, Default)]
struct BitWriter {
    buffer: Vec<u8>,
    current_byte: u8,
    bit_position: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn write_bit(&mut self, bit: bool) {
        if bit {
            self.current_byte |= 1 << (7 - self.bit_position);
        }
        self.bit_position += 1;

        if self.bit_position == 8 {
            self.buffer.push(self.current_byte);
            self.current_byte = 0;
            self.bit_position = 0;
        }
    }

    #[inline]
    fn write_bits(&mut self, value: u64, num_bits: usize) {
        debug_assert!(num_bits <= 64);
        for i in (0..num_bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// Copy of the stream so far, including the partially filled tail byte.
    fn snapshot(&self) -> Vec<u8> {
        let mut out = self.buffer.clone();
        if self.bit_position > 0 {
            out.push(self.current_byte);
        }
        out
    }
}

/// Bit reader for decoding compressed data
#[derive(Debug)]
struct BitReader {
    data: Vec<u8>,
    byte_position: usize,
    bit_position: u8,
}

impl BitReader {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            byte_position: 0,
            bit_position: 0,
        }
    }

    #[inline]
    fn read_bit(&mut self) -> Option<bool> {
        if self.byte_position >= self.data.len() {
            return None;
        }

        let bit = (self.data[self.byte_position] >> (7 - self.bit_position)) & 1 == 1;
        self.bit_position += 1;

        if self.bit_position == 8 {
            self.byte_position += 1;
            self.bit_position = 0;
        }

        Some(bit)
    }

    #[inline]
    fn read_bits(&mut self, num_bits: usize) -> Option<u64> {
        debug_assert!(num_bits <= 64);
        let mut value = 0u64;
        for _ in 0..num_bits {
            let bit = self.read_bit()?;
            value = (value << 1) | (bit as u64);
        }
        Some(value)
    }
}

/// Append-only Gorilla block for one series.
///
/// Callers guarantee strictly increasing timestamps; the outdated check
/// lives one level up in the series value store.
#[derive(Debug, Default)]
pub struct GorillaBlock {
    writer: BitWriter,
    count: u32,

    prev_ts: u32,
    prev_delta: i64,

    prev_value_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl GorillaBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append one point. Timestamps are truncated to u32 seconds.
    pub fn push(&mut self, ts: i64, value: f64) {
        let ts = ts as u32;
        if self.count == 0 {
            self.writer.write_bits(ts as u64, 32);
            let bits = value.to_bits();
            self.writer.write_bits(bits, 64);
            self.prev_ts = ts;
            self.prev_value_bits = bits;
        } else {
            self.push_timestamp(ts);
            self.push_value(value);
        }
        self.count += 1;
    }

    fn push_timestamp(&mut self, ts: u32) {
        let delta = ts as i64 - self.prev_ts as i64;
        let dod = delta - self.prev_delta;

        // Regular scrape intervals make dod almost always zero.
        if dod == 0 {
            self.writer.write_bit(false);
        } else if (-63..=64).contains(&dod) {
            self.writer.write_bits(0b10, 2);
            self.writer.write_bits((dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            self.writer.write_bits(0b110, 3);
            self.writer.write_bits((dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            self.writer.write_bits(0b1110, 4);
            self.writer.write_bits((dod + 2047) as u64, 12);
        } else {
            self.writer.write_bits(0b1111, 4);
            self.writer.write_bits(dod as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_ts = ts;
    }

    fn push_value(&mut self, value: f64) {
        let bits = value.to_bits();
        let xor = bits ^ self.prev_value_bits;

        if xor == 0 {
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);

            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if leading >= self.prev_leading && trailing >= self.prev_trailing {
                // Meaningful bits fit the previous window.
                self.writer.write_bit(false);
                let meaningful = 64 - self.prev_leading - self.prev_trailing;
                self.writer
                    .write_bits(xor >> self.prev_trailing, meaningful as usize);
            } else {
                self.writer.write_bit(true);
                self.writer.write_bits(leading as u64, 5);
                let meaningful = 64 - leading - trailing;
                // 0 in the 6-bit length field means 64
                self.writer.write_bits((meaningful & 0x3f) as u64, 6);
                self.writer.write_bits(xor >> trailing, meaningful as usize);

                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value_bits = bits;
    }

    /// Serialized form: u32 count prefix + bitstream.
    pub fn bytes(&self) -> Vec<u8> {
        let stream = self.writer.snapshot();
        let mut out = Vec::with_capacity(4 + stream.len());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&stream);
        out
    }

    /// Restartable single-pass iterator over the block contents.
    pub fn iter(&self) -> GorillaIter {
        GorillaIter::new(self.writer.snapshot(), self.count)
    }

    /// Decode a serialized block produced by [`GorillaBlock::bytes`].
    pub fn decode(data: &[u8]) -> StorageResult<GorillaIter> {
        if data.len() < 4 {
            return Err(StorageError::InvalidSize);
        }
        let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        Ok(GorillaIter::new(data[4..].to_vec(), count))
    }

    /// Build a block from points already sorted ascending by timestamp.
    pub fn from_sorted_points(points: &[(i64, f64)]) -> Self {
        let mut block = GorillaBlock::new();
        for &(ts, value) in points {
            block.push(ts, value);
        }
        block
    }
}

/// Decoding iterator over a Gorilla bitstream.
#[derive(Debug)]
pub struct GorillaIter {
    reader: BitReader,
    count: u32,
    decoded: u32,

    prev_ts: u32,
    prev_delta: i64,

    prev_value_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl GorillaIter {
    fn new(data: Vec<u8>, count: u32) -> Self {
        Self {
            reader: BitReader::new(data),
            count,
            decoded: 0,
            prev_ts: 0,
            prev_delta: 0,
            prev_value_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn next_timestamp(&mut self) -> Option<u32> {
        let dod = if !self.reader.read_bit()? {
            0
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(7)? as i64 - 63
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(9)? as i64 - 255
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(12)? as i64 - 2047
        } else {
            self.reader.read_bits(64)? as i64
        };

        let delta = self.prev_delta + dod;
        let ts = (self.prev_ts as i64 + delta) as u32;
        self.prev_delta = delta;
        self.prev_ts = ts;
        Some(ts)
    }

    fn next_value(&mut self) -> Option<f64> {
        if !self.reader.read_bit()? {
            return Some(f64::from_bits(self.prev_value_bits));
        }

        let (leading, meaningful) = if !self.reader.read_bit()? {
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            (self.prev_leading, meaningful)
        } else {
            let leading = self.reader.read_bits(5)? as u32;
            let mut meaningful = self.reader.read_bits(6)? as u32;
            if meaningful == 0 {
                meaningful = 64;
            }
            self.prev_leading = leading;
            self.prev_trailing = 64 - leading - meaningful;
            (leading, meaningful)
        };

        let raw = self.reader.read_bits(meaningful as usize)?;
        let trailing = 64 - leading - meaningful;
        let bits = self.prev_value_bits ^ (raw << trailing);
        self.prev_value_bits = bits;
        Some(f64::from_bits(bits))
    }
}

impl Iterator for GorillaIter {
    type Item = (i64, f64);

    fn next(&mut self) -> Option<(i64, f64)> {
        if self.decoded >= self.count {
            return None;
        }

        let item = if self.decoded == 0 {
            let ts = self.reader.read_bits(32)? as u32;
            let bits = self.reader.read_bits(64)?;
            self.prev_ts = ts;
            self.prev_value_bits = bits;
            (ts as i64, f64::from_bits(bits))
        } else {
            let ts = self.next_timestamp()?;
            let value = self.next_value()?;
            (ts as i64, value)
        };

        self.decoded += 1;
        Some(item)
    }
}
