//! Frame compression
//!
//! Large frames (table snapshots, sprite lists) are compressed before they hit
//! the wire. Small frames are sent as-is.

use crate::ProtocolError;
use std::io::{Read, Write};

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum CompressionAlgorithm {
    /// Zstandard compression (better ratio, slightly slower)
    #[cfg_attr(feature = "clap", value(name = "zstd"))]
    Zstd,
    /// LZ4 compression (faster, lower ratio)
    #[cfg_attr(feature = "clap", value(name = "lz4"))]
    Lz4,
}

impl CompressionAlgorithm {
    /// Frame flag identifying this algorithm
    pub fn flag(self) -> u8 {
        match self {
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 2,
        }
    }

    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            1 => Some(CompressionAlgorithm::Lz4),
            2 => Some(CompressionAlgorithm::Zstd),
            _ => None,
        }
    }
}

/// Compressor wrapper supporting multiple algorithms
#[derive(Debug, Clone)]
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    compression_level: i32,
}

impl Compressor {
    /// Create a new compressor with specified algorithm
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self {
            algorithm,
            compression_level: match algorithm {
                CompressionAlgorithm::Zstd => 3, // Default zstd level
                CompressionAlgorithm::Lz4 => 0,  // LZ4 doesn't use levels
            },
        }
    }

    /// Compress data
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self.algorithm {
            CompressionAlgorithm::Zstd => self.compress_zstd(data),
            CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    /// Decompress data produced by `algorithm`, refusing output larger than `limit` bytes
    pub fn decompress(
        algorithm: CompressionAlgorithm,
        data: &[u8],
        limit: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        match algorithm {
            CompressionAlgorithm::Zstd => Self::decompress_zstd(data, limit),
            CompressionAlgorithm::Lz4 => Self::decompress_lz4(data, limit),
        }
    }

    fn decompress_lz4(data: &[u8], limit: usize) -> Result<Vec<u8>, ProtocolError> {
        let prefix: [u8; 4] = data
            .get(..4)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| ProtocolError::Compression("LZ4 size prefix missing".to_string()))?;
        let size = u32::from_le_bytes(prefix) as usize;
        if size > limit {
            return Err(ProtocolError::FrameTooLarge(size));
        }

        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ProtocolError::Compression(format!("LZ4 decompression failed: {e}")))
    }

    fn compress_zstd(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut encoder = zstd::Encoder::new(Vec::new(), self.compression_level).map_err(|e| {
            ProtocolError::Compression(format!("Failed to create zstd encoder: {e}"))
        })?;

        encoder.write_all(data).map_err(|e| {
            ProtocolError::Compression(format!("Failed to write to zstd encoder: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| ProtocolError::Compression(format!("Failed to finish zstd encoding: {e}")))
    }

    fn decompress_zstd(data: &[u8], limit: usize) -> Result<Vec<u8>, ProtocolError> {
        let decoder = zstd::Decoder::new(data).map_err(|e| {
            ProtocolError::Compression(format!("Failed to create zstd decoder: {e}"))
        })?;

        // One byte past the limit is enough to tell an oversized frame apart
        let mut decompressed = Vec::new();
        decoder
            .take(limit as u64 + 1)
            .read_to_end(&mut decompressed)
            .map_err(|e| {
                ProtocolError::Compression(format!("Failed to decompress zstd data: {e}"))
            })?;
        if decompressed.len() > limit {
            return Err(ProtocolError::FrameTooLarge(decompressed.len()));
        }

        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_distinct() {
        for algo in [CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd] {
            assert_eq!(CompressionAlgorithm::from_flag(algo.flag()), Some(algo));
        }
        assert_eq!(CompressionAlgorithm::from_flag(0), None);
    }

    #[test]
    fn test_zstd_shrinks_repetitive_payload() {
        let data = br#"{"type":"sprite_move","data":{"x":1}}"#.repeat(200);
        let compressor = Compressor::new(CompressionAlgorithm::Zstd);
        let packed = compressor.compress(&data).unwrap();
        assert!(packed.len() < data.len() / 4);
        assert_eq!(
            Compressor::decompress(CompressionAlgorithm::Zstd, &packed, data.len()).unwrap(),
            data
        );
    }

    #[test]
    fn test_lz4_rejects_garbage() {
        assert!(Compressor::decompress(CompressionAlgorithm::Lz4, &[5, 0, 0, 0, 0xff], 64).is_err());
        assert!(Compressor::decompress(CompressionAlgorithm::Lz4, &[5, 0], 64).is_err());
    }

    #[test]
    fn test_output_limit_is_enforced() {
        let data = vec![b'a'; 64 * 1024];
        for algo in [CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd] {
            let packed = Compressor::new(algo).compress(&data).unwrap();
            assert!(matches!(
                Compressor::decompress(algo, &packed, 1024),
                Err(ProtocolError::FrameTooLarge(_))
            ));
            assert_eq!(Compressor::decompress(algo, &packed, data.len()).unwrap(), data);
        }
    }
}
