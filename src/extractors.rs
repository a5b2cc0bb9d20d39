//! Built-in extractors used by the command line tool.

use crate::error::ExtractError;
use crate::extract::{ChunkExtractor, Consolidate};
use crate::pipeline::ChunkMetadata;
use serde::Serialize;

/// Byte and newline counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LineStats {
    pub bytes: u64,
    pub newlines: u64,
    /// Bytes that are not valid in any UTF-8 position (0xC0, 0xC1, 0xF5..=0xFF)
    pub invalid_utf8_bytes: u64,
}

impl Consolidate for LineStats {
    fn consolidate(parts: Vec<Self>) -> Self {
        parts.into_iter().fold(Self::default(), |acc, p| Self {
            bytes: acc.bytes + p.bytes,
            newlines: acc.newlines + p.newlines,
            invalid_utf8_bytes: acc.invalid_utf8_bytes + p.invalid_utf8_bytes,
        })
    }
}

/// Counts lines per chunk. Counting newlines keeps the result independent of
/// where chunk boundaries fall.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCounter;

impl ChunkExtractor for LineCounter {
    type Output = LineStats;

    fn extract(
        &mut self,
        bytes: &[u8],
        _offset: u64,
        _metadata: &ChunkMetadata,
    ) -> Result<LineStats, ExtractError> {
        Ok(LineStats {
            bytes: bytes.len() as u64,
            newlines: bytes.iter().filter(|b| **b == b'\n').count() as u64,
            invalid_utf8_bytes: bytes
                .iter()
                .filter(|b| matches!(**b, 0xC0 | 0xC1 | 0xF5..=0xFF))
                .count() as u64,
        })
    }
}

/// BLAKE3 digest of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkDigest {
    pub index: usize,
    pub offset: u64,
    pub size: usize,
    pub blake3: String,
}

/// Hashes every chunk with BLAKE3.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumExtractor;

impl ChunkExtractor for ChecksumExtractor {
    type Output = Vec<ChunkDigest>;

    fn extract(
        &mut self,
        bytes: &[u8],
        offset: u64,
        metadata: &ChunkMetadata,
    ) -> Result<Vec<ChunkDigest>, ExtractError> {
        Ok(vec![ChunkDigest {
            index: metadata.index,
            offset,
            size: bytes.len(),
            blake3: blake3::hash(bytes).to_hex().to_string(),
        }])
    }
}

/// Counts payload bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteCounter;

impl ChunkExtractor for ByteCounter {
    type Output = u64;

    fn extract(
        &mut self,
        bytes: &[u8],
        _offset: u64,
        _metadata: &ChunkMetadata,
    ) -> Result<u64, ExtractError> {
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(index: usize, offset: u64, size: usize) -> ChunkMetadata {
        ChunkMetadata {
            index,
            offset,
            size,
            total_size: 100,
            attempt: 1,
            is_last: false,
        }
    }

    #[test]
    fn test_line_counts_merge_across_boundaries() {
        let text = b"one\ntwo\nthree\n";
        let mut counter = LineCounter;
        let parts = vec![
            counter.extract(&text[..5], 0, &metadata(0, 0, 5)).unwrap(),
            counter.extract(&text[5..], 5, &metadata(1, 5, 9)).unwrap(),
        ];
        let total = LineStats::consolidate(parts);
        assert_eq!(total.newlines, 3);
        assert_eq!(total.bytes, text.len() as u64);
        assert_eq!(total.invalid_utf8_bytes, 0);
    }

    #[test]
    fn test_invalid_utf8_bytes() {
        let stats = LineCounter
            .extract(&[0xFF, b'a', 0xC0], 0, &metadata(0, 0, 3))
            .unwrap();
        assert_eq!(stats.invalid_utf8_bytes, 2);
    }

    #[test]
    fn test_checksum_matches_blake3() {
        let digests = ChecksumExtractor
            .extract(b"hello", 10, &metadata(2, 10, 5))
            .unwrap();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].index, 2);
        assert_eq!(digests[0].offset, 10);
        assert_eq!(digests[0].blake3, blake3::hash(b"hello").to_hex().to_string());
    }

    #[test]
    fn test_byte_counter() {
        assert_eq!(ByteCounter.extract(b"abcd", 0, &metadata(0, 0, 4)).unwrap(), 4);
    }
}
