//! Compact bit-per-part readiness record.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8` (little-endian bit order
//! within each byte). Trailing all-zero bytes carry no information and are
//! stripped on [`Bitmask::encode`]; decoding restores them implicitly because
//! any index past the end of the buffer reads as "not ready".
//!
//! The encoded form is what gets persisted inside partial location records,
//! so it must stay stable:
//!
//! ```text
//! ready parts {0, 1, 3, 9}
//!
//!   byte 0: 0b0000_1011   (bits 0, 1, 3)
//!   byte 1: 0b0000_0010   (bit 9)
//! ```

use std::fmt;

/// Set of ready part indices.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bitmask {
    data: Vec<u8>,
}

impl Bitmask {
    /// Creates an empty bitmask (no part ready).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bitmask with parts `0..count` marked ready.
    pub fn ones(count: usize) -> Self {
        let mut data = vec![0xff_u8; count / 8];
        if count % 8 != 0 {
            data.push((1u8 << (count % 8)) - 1);
        }
        Self { data }
    }

    /// Decodes a persisted bitmask. An empty slice means no parts are ready.
    pub fn decode(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    /// Serializes the bitmask.
    ///
    /// With `prefix_count = Some(n)` only parts `0..n` are kept, the boundary
    /// byte being masked so bits at or past `n` are cleared. Trailing zero
    /// bytes are always stripped, which makes the output deterministic for
    /// identical logical content.
    pub fn encode(&self, prefix_count: Option<usize>) -> Vec<u8> {
        let mut res = self.data.clone();
        if let Some(count) = prefix_count {
            let byte_count = count.div_ceil(8);
            if res.len() > byte_count {
                res.truncate(byte_count);
            }
            let tail_bits = count % 8;
            if tail_bits != 0 && res.len() == byte_count {
                res[byte_count - 1] &= (1u8 << tail_bits) - 1;
            }
        }
        while res.last() == Some(&0) {
            res.pop();
        }
        res
    }

    /// Returns whether `part_index` is ready. Out-of-range indices are not.
    pub fn get(&self, part_index: usize) -> bool {
        match self.data.get(part_index / 8) {
            Some(byte) => (byte >> (part_index % 8)) & 1 != 0,
            None => false,
        }
    }

    /// Marks `part_index` ready, growing the buffer as needed.
    pub fn set(&mut self, part_index: usize) {
        let byte = part_index / 8;
        if byte >= self.data.len() {
            self.data.resize(byte + 1, 0);
        }
        self.data[byte] |= 1u8 << (part_index % 8);
    }

    /// Length of the run of ready parts starting at `from`.
    pub fn get_ready_parts(&self, from: usize) -> usize {
        let mut count = 0;
        while self.get(from + count) {
            count += 1;
        }
        count
    }

    /// Number of contiguous ready bytes starting at byte `offset`.
    ///
    /// The run is measured in whole parts from the part containing `offset`
    /// and clamped to `file_size` when it is known (non-zero).
    pub fn get_ready_prefix_size(&self, offset: i64, part_size: i64, file_size: i64) -> i64 {
        assert!(offset >= 0, "negative offset {offset}");
        if part_size <= 0 {
            return 0;
        }
        let offset_part = (offset / part_size) as usize;
        let ready_parts = self.get_ready_parts(offset_part);
        if ready_parts == 0 {
            return 0;
        }

        let mut offset = offset;
        let mut ready_end = (offset_part + ready_parts) as i64 * part_size;
        if file_size > 0 && ready_end > file_size {
            ready_end = file_size;
            if offset > file_size {
                offset = file_size;
            }
        }
        ready_end - offset
    }

    /// Total byte length of all ready parts, the last one clamped to `file_size`.
    pub fn get_total_size(&self, part_size: i64, file_size: i64) -> i64 {
        self.as_vector()
            .into_iter()
            .map(|part| {
                let begin = part as i64 * part_size;
                if file_size > 0 {
                    (file_size - begin).clamp(0, part_size)
                } else {
                    part_size
                }
            })
            .sum()
    }

    /// Folds every run of `k` parts into one bit, set only when the whole
    /// run is ready.
    pub fn compress(&self, k: usize) -> Bitmask {
        assert!(k > 0, "compression factor must be positive");
        let mut res = Bitmask::new();
        let bit_count = self.data.len() * 8;
        let mut i = 0;
        while i * k < bit_count {
            if (0..k).all(|j| self.get(i * k + j)) {
                res.set(i);
            }
            i += 1;
        }
        res
    }

    /// All ready part indices in ascending order.
    pub fn as_vector(&self) -> Vec<usize> {
        (0..self.data.len() * 8).filter(|&i| self.get(i)).collect()
    }

    /// Number of ready parts.
    pub fn ready_count(&self) -> usize {
        self.data.iter().map(|byte| byte.count_ones() as usize).sum()
    }
}

impl fmt::Debug for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmask")
            .field("ready", &self.as_vector())
            .finish()
    }
}

impl fmt::Display for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.data {
            for bit in 0..8 {
                f.write_str(if (byte >> bit) & 1 != 0 { "1" } else { "0" })?;
            }
        }
        Ok(())
    }
}
