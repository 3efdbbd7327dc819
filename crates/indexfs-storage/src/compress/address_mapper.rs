//! Compressed block address mapper
//!
//! Maps a compressed block index to its byte offset and length inside the
//! compressed data, plus whether the block was compressed against hint
//! data. Two serialized forms exist and both are always readable:
//!
//! ```text
//! flat:    [0u8][flags u8][block_count u64][offset u64 x (block_count + 1)][hint bitmap][crc32c u32]
//! encoded: [1u8][flags u8][block_count u64][batch u32]
//!          per batch: [base offset u64][varint block length x batch]
//!          [hint bitmap][crc32c u32]
//! ```
//!
//! The encoded form is only written when it is strictly smaller than the
//! flat form; otherwise the writer falls back to flat silently.

use bytes::{Buf, BufMut, BytesMut};
use indexfs_common::{Error, Result};

const FORMAT_FLAT: u8 = 0;
const FORMAT_ENCODED: u8 = 1;
const FLAG_HINT: u8 = 0x1;
/// tag + flags + block count
const HEADER_LEN: usize = 1 + 1 + 8;
const CRC_LEN: usize = 4;

/// In-memory address mapper of one compressed file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompressFileAddressMapper {
    /// `block_count + 1` offsets, `offsets[0] == 0`
    offsets: Vec<u64>,
    /// Bit per block, empty when no block uses hint data
    hint_bitmap: Vec<u8>,
}

impl CompressFileAddressMapper {
    /// Empty mapper, ready to record blocks as they are written
    #[must_use]
    pub fn new() -> Self {
        Self {
            offsets: vec![0],
            hint_bitmap: Vec::new(),
        }
    }

    /// Record the next block
    pub fn add_block(&mut self, compressed_len: u64, use_hint: bool) {
        let idx = self.block_count();
        let last = self.offsets.last().copied().unwrap_or(0);
        self.offsets.push(last + compressed_len);
        if use_hint {
            let byte = idx / 8;
            if self.hint_bitmap.len() <= byte {
                self.hint_bitmap.resize(byte + 1, 0);
            }
            self.hint_bitmap[byte] |= 1 << (idx % 8);
        }
    }

    pub fn block_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Total length of the compressed blocks
    pub fn compress_file_length(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn compress_block_address(&self, idx: usize) -> u64 {
        self.offsets[idx]
    }

    pub fn compress_block_length(&self, idx: usize) -> u64 {
        self.offsets[idx + 1] - self.offsets[idx]
    }

    pub fn is_compress_block_use_hint_data(&self, idx: usize) -> bool {
        self.hint_bitmap
            .get(idx / 8)
            .is_some_and(|byte| byte & (1 << (idx % 8)) != 0)
    }

    /// Number of blocks compressed against hint data
    pub fn hint_block_count(&self) -> usize {
        self.hint_bitmap.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Approximate heap footprint
    pub fn memory_use(&self) -> u64 {
        (self.offsets.len() * 8 + self.hint_bitmap.len()) as u64
    }

    fn bitmap_len(&self) -> usize {
        if self.hint_bitmap.is_empty() {
            0
        } else {
            self.block_count().div_ceil(8)
        }
    }

    /// Serialize, choosing the encoded form only when it is strictly smaller
    ///
    /// Returns the bytes and whether the encoded form was used.
    pub fn serialize(&self, try_encode: bool, batch: u32) -> (Vec<u8>, bool) {
        let flat = self.serialize_flat();
        if !try_encode {
            return (flat, false);
        }
        let encoded = self.serialize_encoded(batch);
        if encoded.len() < flat.len() {
            (encoded, true)
        } else {
            tracing::debug!(
                "Address mapper encoding not smaller ({} >= {} bytes), storing flat",
                encoded.len(),
                flat.len()
            );
            (flat, false)
        }
    }

    fn put_header(&self, buf: &mut BytesMut, format: u8) {
        buf.put_u8(format);
        buf.put_u8(if self.hint_bitmap.is_empty() {
            0
        } else {
            FLAG_HINT
        });
        buf.put_u64_le(self.block_count() as u64);
    }

    fn put_trailer(&self, buf: &mut BytesMut) {
        if !self.hint_bitmap.is_empty() {
            let mut bitmap = self.hint_bitmap.clone();
            bitmap.resize(self.bitmap_len(), 0);
            buf.put_slice(&bitmap);
        }
        let crc = crc32c::crc32c(&buf[..]);
        buf.put_u32_le(crc);
    }

    fn serialize_flat(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            HEADER_LEN + self.offsets.len() * 8 + self.bitmap_len() + CRC_LEN,
        );
        self.put_header(&mut buf, FORMAT_FLAT);
        for offset in &self.offsets {
            buf.put_u64_le(*offset);
        }
        self.put_trailer(&mut buf);
        buf.to_vec()
    }

    fn serialize_encoded(&self, batch: u32) -> Vec<u8> {
        let batch = batch.max(1) as usize;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 4 + self.block_count() * 2);
        self.put_header(&mut buf, FORMAT_ENCODED);
        buf.put_u32_le(u32::try_from(batch).unwrap_or(u32::MAX));
        let count = self.block_count();
        let mut idx = 0;
        while idx < count {
            buf.put_u64_le(self.offsets[idx]);
            let end = (idx + batch).min(count);
            for block in idx..end {
                prost::encoding::encode_varint(self.compress_block_length(block), &mut buf);
            }
            idx = end;
        }
        self.put_trailer(&mut buf);
        buf.to_vec()
    }

    /// Decode either serialized form, verifying the checksum
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + CRC_LEN {
            return Err(Error::corruption(format!(
                "address mapper too short: {} bytes",
                data.len()
            )));
        }
        let (body, crc) = data.split_at(data.len() - CRC_LEN);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32c::crc32c(body) != expected {
            return Err(Error::corruption("address mapper checksum mismatch"));
        }

        let mut cur = body;
        let format = cur.get_u8();
        let flags = cur.get_u8();
        let count = usize::try_from(cur.get_u64_le())
            .map_err(|_| Error::corruption("address mapper block count overflow"))?;
        let bitmap_len = if flags & FLAG_HINT == 0 {
            0
        } else {
            count.div_ceil(8)
        };

        let mut offsets = Vec::with_capacity(count.saturating_add(1).min(cur.remaining() + 1));
        match format {
            FORMAT_FLAT => {
                let expected = count
                    .checked_add(1)
                    .and_then(|n| n.checked_mul(8))
                    .and_then(|n| n.checked_add(bitmap_len));
                if expected != Some(cur.remaining()) {
                    return Err(Error::corruption("flat address mapper length mismatch"));
                }
                for _ in 0..=count {
                    offsets.push(cur.get_u64_le());
                }
            }
            FORMAT_ENCODED => {
                if cur.remaining() < 4 {
                    return Err(Error::corruption("encoded address mapper truncated"));
                }
                let batch = cur.get_u32_le().max(1) as usize;
                let mut idx = 0;
                while idx < count {
                    if cur.remaining() < 8 {
                        return Err(Error::corruption("encoded address mapper truncated"));
                    }
                    let mut offset = cur.get_u64_le();
                    if idx == 0 {
                        offsets.push(offset);
                    } else if offsets.last() != Some(&offset) {
                        return Err(Error::corruption("address mapper batch base mismatch"));
                    }
                    let end = (idx + batch).min(count);
                    for _ in idx..end {
                        let len = prost::encoding::decode_varint(&mut cur).map_err(|e| {
                            Error::corruption(format!("address mapper varint: {e}"))
                        })?;
                        offset += len;
                        offsets.push(offset);
                    }
                    idx = end;
                }
                if count == 0 {
                    offsets.push(0);
                }
                if cur.remaining() != bitmap_len {
                    return Err(Error::corruption("encoded address mapper length mismatch"));
                }
            }
            other => {
                return Err(Error::corruption(format!(
                    "unknown address mapper format {other}"
                )));
            }
        }

        if offsets.first() != Some(&0) || offsets.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::corruption("address mapper offsets not monotonic"));
        }
        Ok(Self {
            offsets,
            hint_bitmap: cur[..bitmap_len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn build(lengths: &[u64], hints: &[bool]) -> CompressFileAddressMapper {
        let mut mapper = CompressFileAddressMapper::new();
        for (len, hint) in lengths.iter().zip(hints) {
            mapper.add_block(*len, *hint);
        }
        mapper
    }

    fn assert_same_blocks(a: &CompressFileAddressMapper, b: &CompressFileAddressMapper) {
        assert_eq!(a.block_count(), b.block_count());
        for i in 0..a.block_count() {
            assert_eq!(a.compress_block_address(i), b.compress_block_address(i));
            assert_eq!(a.compress_block_length(i), b.compress_block_length(i));
            assert_eq!(
                a.is_compress_block_use_hint_data(i),
                b.is_compress_block_use_hint_data(i)
            );
        }
    }

    #[test]
    fn test_queries() {
        let mapper = build(&[100, 50, 75], &[false, true, false]);
        assert_eq!(mapper.block_count(), 3);
        assert_eq!(mapper.compress_block_address(1), 100);
        assert_eq!(mapper.compress_block_length(2), 75);
        assert!(mapper.is_compress_block_use_hint_data(1));
        assert!(!mapper.is_compress_block_use_hint_data(2));
        assert_eq!(mapper.compress_file_length(), 225);
        assert_eq!(mapper.hint_block_count(), 1);
    }

    #[test]
    fn test_random_lengths_both_forms() {
        let mut rng = StdRng::seed_from_u64(42);
        for count in [0usize, 1, 7, 8, 9, 63, 64, 65, 500] {
            let lengths: Vec<u64> = (0..count).map(|_| rng.gen_range(1..5000)).collect();
            let hints: Vec<bool> = (0..count).map(|_| rng.gen_bool(0.3)).collect();
            let mapper = build(&lengths, &hints);
            for encode in [false, true] {
                let (bytes, _) = mapper.serialize(encode, 16);
                let decoded = CompressFileAddressMapper::deserialize(&bytes).unwrap();
                assert_same_blocks(&mapper, &decoded);
            }
        }
    }

    #[test]
    fn test_encoded_smaller_for_regular_blocks() {
        let mapper = build(&[1200; 100], &[false; 100]);
        let (bytes, encoded) = mapper.serialize(true, 64);
        assert!(encoded);
        let (flat, _) = mapper.serialize(false, 64);
        assert!(bytes.len() < flat.len());
    }

    #[test]
    fn test_falls_back_to_flat_when_not_smaller() {
        // Lengths above 2^56 take 9+ varint bytes, more than a u64 slot
        let mapper = build(&[1 << 60, 1 << 61], &[false, false]);
        let (bytes, encoded) = mapper.serialize(true, 1);
        assert!(!encoded);
        assert_eq!(bytes[0], FORMAT_FLAT);
        let decoded = CompressFileAddressMapper::deserialize(&bytes).unwrap();
        assert_same_blocks(&mapper, &decoded);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mapper = build(&[10, 20, 30], &[true, false, true]);
        let (mut bytes, _) = mapper.serialize(false, 64);
        bytes[12] ^= 0xff;
        assert!(matches!(
            CompressFileAddressMapper::deserialize(&bytes),
            Err(Error::Corruption(_))
        ));
        assert!(CompressFileAddressMapper::deserialize(&bytes[..5]).is_err());
    }
}
