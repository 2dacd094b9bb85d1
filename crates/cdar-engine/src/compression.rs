//! Per-chunk codecs: LZMA (xz), LZ4 and Zstd behind one compress/decompress contract

use crate::error::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Highest accepted Zstd level
pub const ZSTD_MAX_LEVEL: i32 = 19;

/// Highest accepted LZMA preset
pub const LZMA_MAX_LEVEL: u32 = 9;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    None,
    /// LZ4 block with prepended size; fastest
    Lz4,
    /// Zstandard; better ratio
    Zstd {
        /// Compression level (1=fastest, 19=best ratio)
        level: i32,
    },
    /// LZMA in an xz container; best ratio, slowest
    Lzma {
        /// Preset level (0=fastest, 9=best ratio)
        level: u32,
    },
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Zstd { level: 6 }
    }
}

impl CompressionAlgorithm {
    /// Reject out-of-range levels
    pub fn validate(&self) -> Result<()> {
        match *self {
            CompressionAlgorithm::Zstd { level } if !(1..=ZSTD_MAX_LEVEL).contains(&level) => {
                Err(ArchiveError::InvalidParameters(format!(
                    "zstd level {level} not within 1..={ZSTD_MAX_LEVEL}"
                )))
            }
            CompressionAlgorithm::Lzma { level } if level > LZMA_MAX_LEVEL => {
                Err(ArchiveError::InvalidParameters(format!(
                    "lzma level {level} not within 0..={LZMA_MAX_LEVEL}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// True for the identity codec
    pub fn is_none(&self) -> bool {
        matches!(self, CompressionAlgorithm::None)
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            CompressionAlgorithm::None => write!(f, "none"),
            CompressionAlgorithm::Lz4 => write!(f, "lz4"),
            CompressionAlgorithm::Zstd { level } => write!(f, "zstd (level {level})"),
            CompressionAlgorithm::Lzma { level } => write!(f, "lzma (level {level})"),
        }
    }
}

/// Compress data with the given algorithm. Returns compressed bytes.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| ArchiveError::Codec(e.to_string()))
        }
        CompressionAlgorithm::Lzma { level } => {
            let mut out = Vec::with_capacity(data.len() / 2);
            xz2::read::XzEncoder::new(data, level)
                .read_to_end(&mut out)
                .map_err(|e| ArchiveError::Codec(e.to_string()))?;
            Ok(out)
        }
    }
}

/// Decompress data and check it decodes to exactly `declared_len` bytes.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm, declared_len: usize) -> Result<Vec<u8>> {
    let decoded = match algo {
        CompressionAlgorithm::None => data.to_vec(),
        CompressionAlgorithm::Lz4 => decompress_lz4(data, declared_len)?,
        CompressionAlgorithm::Zstd { .. } => zstd::bulk::decompress(data, declared_len)
            .map_err(|e| ArchiveError::Codec(e.to_string()))?,
        CompressionAlgorithm::Lzma { .. } => decompress_lzma(data, declared_len)?,
    };
    if decoded.len() != declared_len {
        return Err(ArchiveError::Codec(format!(
            "decoded {} bytes, expected {}",
            decoded.len(),
            declared_len
        )));
    }
    Ok(decoded)
}

/// Checks the prepended size before allocating, so a corrupt header cannot request gigabytes.
fn decompress_lz4(data: &[u8], declared_len: usize) -> Result<Vec<u8>> {
    let header: [u8; 4] = data
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| ArchiveError::Codec("lz4 block shorter than its size header".into()))?;
    let prepended = u32::from_le_bytes(header) as usize;
    if prepended != declared_len {
        return Err(ArchiveError::Codec(format!(
            "lz4 block declares {prepended} bytes, expected {declared_len}"
        )));
    }
    lz4_flex::decompress(&data[4..], declared_len).map_err(|e| ArchiveError::Codec(e.to_string()))
}

/// Stops one byte past `declared_len`, enough to detect an overlong stream.
fn decompress_lzma(data: &[u8], declared_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(declared_len);
    xz2::read::XzDecoder::new(data)
        .take(declared_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ArchiveError::Codec(e.to_string()))?;
    Ok(out)
}

/// Compress unless that does not shrink the chunk.
/// Returns the bytes to store and the codec actually applied.
pub fn compress_or_raw(data: &[u8], algo: CompressionAlgorithm) -> Result<(Vec<u8>, CompressionAlgorithm)> {
    if algo.is_none() {
        return Ok((data.to_vec(), CompressionAlgorithm::None));
    }
    let compressed = compress(data, algo)?;
    if compressed.len() >= data.len() {
        Ok((data.to_vec(), CompressionAlgorithm::None))
    } else {
        Ok((compressed, algo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_lz4_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000)) {
            let c = compress(&data, CompressionAlgorithm::Lz4).unwrap();
            let d = decompress(&c, CompressionAlgorithm::Lz4, data.len()).unwrap();
            prop_assert_eq!(d, data);
        }
        #[test]
        fn prop_zstd_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000)) {
            let c = compress(&data, CompressionAlgorithm::Zstd { level: 3 }).unwrap();
            let d = decompress(&c, CompressionAlgorithm::Zstd { level: 3 }, data.len()).unwrap();
            prop_assert_eq!(d, data);
        }
        #[test]
        fn prop_lzma_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000), level in 0u32..=3) {
            let c = compress(&data, CompressionAlgorithm::Lzma { level }).unwrap();
            let d = decompress(&c, CompressionAlgorithm::Lzma { level }, data.len()).unwrap();
            prop_assert_eq!(d, data);
        }
    }

    #[test]
    fn empty_roundtrips() {
        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd { level: 3 },
            CompressionAlgorithm::Lzma { level: 6 },
        ] {
            let c = compress(&[], algo).unwrap();
            let d = decompress(&c, algo, 0).unwrap();
            assert_eq!(d, b"");
        }
    }

    #[test]
    fn wrong_declared_length_is_codec_error() {
        let data = b"some chunk payload".repeat(20);
        let c = compress(&data, CompressionAlgorithm::Lz4).unwrap();
        assert!(matches!(
            decompress(&c, CompressionAlgorithm::Lz4, data.len() - 1),
            Err(ArchiveError::Codec(_))
        ));
    }

    #[test]
    fn corrupt_zstd_frame_is_codec_error() {
        let data = b"zstd frame content ".repeat(100);
        let mut c = compress(&data, CompressionAlgorithm::Zstd { level: 3 }).unwrap();
        c[0] ^= 0xff;
        assert!(matches!(
            decompress(&c, CompressionAlgorithm::Zstd { level: 3 }, data.len()),
            Err(ArchiveError::Codec(_))
        ));
    }

    #[test]
    fn incompressible_chunk_stored_raw() {
        let mut seed = 0x9e37_79b9_u32;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as u8
            })
            .collect();
        let (stored, algo) = compress_or_raw(&noise, CompressionAlgorithm::Zstd { level: 3 }).unwrap();
        assert_eq!(algo, CompressionAlgorithm::None);
        assert_eq!(stored, noise);

        let text = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(64);
        let (stored, algo) = compress_or_raw(&text, CompressionAlgorithm::Lz4).unwrap();
        assert_eq!(algo, CompressionAlgorithm::Lz4);
        assert!(stored.len() < text.len());
    }

    #[test]
    fn level_validation() {
        assert!(CompressionAlgorithm::Zstd { level: 0 }.validate().is_err());
        assert!(CompressionAlgorithm::Zstd { level: 20 }.validate().is_err());
        assert!(CompressionAlgorithm::Zstd { level: 19 }.validate().is_ok());
        assert!(CompressionAlgorithm::Lz4.validate().is_ok());
        assert!(CompressionAlgorithm::Lzma { level: 0 }.validate().is_ok());
        assert!(CompressionAlgorithm::Lzma { level: 9 }.validate().is_ok());
        assert!(CompressionAlgorithm::Lzma { level: 10 }.validate().is_err());
    }

    #[test]
    fn zstd_output_capped_by_declared_length() {
        let data = vec![0u8; 1 << 20];
        let c = compress(&data, CompressionAlgorithm::Zstd { level: 3 }).unwrap();
        assert!(matches!(
            decompress(&c, CompressionAlgorithm::Zstd { level: 3 }, 4096),
            Err(ArchiveError::Codec(_))
        ));
    }

    #[test]
    fn lzma_longer_than_declared_is_codec_error() {
        let data = b"lzma payload ".repeat(500);
        let c = compress(&data, CompressionAlgorithm::Lzma { level: 6 }).unwrap();
        assert!(c.len() < data.len());
        assert!(matches!(
            decompress(&c, CompressionAlgorithm::Lzma { level: 6 }, 100),
            Err(ArchiveError::Codec(_))
        ));
        assert!(matches!(
            decompress(&c, CompressionAlgorithm::Lzma { level: 6 }, data.len() + 1),
            Err(ArchiveError::Codec(_))
        ));
        let mut corrupt = c.clone();
        corrupt[0] ^= 0xff;
        assert!(decompress(&corrupt, CompressionAlgorithm::Lzma { level: 6 }, data.len()).is_err());
    }
}
