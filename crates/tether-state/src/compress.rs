//! Compression of encoded sync payloads
//!
//! Per-tick patches are usually tiny, so small payloads are stored raw and
//! only larger ones (bootstraps, busy ticks) go through zstd or LZ4. Tagged
//! payloads carry a leading algorithm byte so the receiver never has to guess.

use crate::SyncError;
use std::io::{Read, Write};

/// Largest payload a decompressor will produce
pub const MAX_DECOMPRESSED_LEN: usize = 16 * 1024 * 1024;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum CompressionAlgorithm {
    /// Store the payload as is
    #[cfg_attr(feature = "clap", value(name = "none"))]
    None,
    /// Zstandard, better ratio for bootstrap snapshots
    #[default]
    #[cfg_attr(feature = "clap", value(name = "zstd"))]
    Zstd,
    /// LZ4, cheaper for per-tick patches
    #[cfg_attr(feature = "clap", value(name = "lz4"))]
    Lz4,
}

impl CompressionAlgorithm {
    pub fn to_byte(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Zstd => 1,
            CompressionAlgorithm::Lz4 => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, SyncError> {
        match byte {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Zstd),
            2 => Ok(CompressionAlgorithm::Lz4),
            other => Err(SyncError::CompressionError(format!(
                "Unknown compression algorithm byte: {other:#04x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    level: i32,
    max_output: usize,
}

impl Compressor {
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self {
            algorithm,
            level: 3,
            max_output: MAX_DECOMPRESSED_LEN,
        }
    }

    /// Cap on decompressed output. Larger payloads are rejected.
    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    /// Set the zstd level. Ignored by the other algorithms.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, SyncError> {
        match self.algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Zstd => {
                let mut encoder = zstd::Encoder::new(Vec::new(), self.level).map_err(|e| {
                    SyncError::CompressionError(format!("Failed to create zstd encoder: {e}"))
                })?;
                encoder.write_all(data).map_err(|e| {
                    SyncError::CompressionError(format!("Failed to write to zstd encoder: {e}"))
                })?;
                encoder.finish().map_err(|e| {
                    SyncError::CompressionError(format!("Failed to finish zstd encoding: {e}"))
                })
            }
            CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, SyncError> {
        let out = match self.algorithm {
            CompressionAlgorithm::None => data.to_vec(),
            CompressionAlgorithm::Zstd => {
                let decoder = zstd::Decoder::new(data).map_err(|e| {
                    SyncError::CompressionError(format!("Failed to create zstd decoder: {e}"))
                })?;
                let mut out = Vec::new();
                decoder
                    .take(self.max_output as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        SyncError::CompressionError(format!("Failed to decompress zstd data: {e}"))
                    })?;
                out
            }
            CompressionAlgorithm::Lz4 => {
                let declared = data
                    .get(..4)
                    .and_then(|prefix| <[u8; 4]>::try_from(prefix).ok())
                    .map(u32::from_le_bytes)
                    .ok_or_else(|| {
                        SyncError::CompressionError("LZ4 payload without size prefix".to_string())
                    })?;
                self.check_size(declared as usize)?;
                lz4_flex::decompress_size_prepended(data).map_err(|e| {
                    SyncError::CompressionError(format!("LZ4 decompression failed: {e}"))
                })?
            }
        };
        self.check_size(out.len())?;
        Ok(out)
    }

    fn check_size(&self, len: usize) -> Result<(), SyncError> {
        if len > self.max_output {
            return Err(SyncError::CompressionError(format!(
                "Decompressed payload exceeds {} bytes",
                self.max_output
            )));
        }
        Ok(())
    }
}

/// Picks raw storage for small payloads and the preferred algorithm otherwise
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveCompressor {
    preferred: Compressor,
    size_threshold: usize,
}

impl Default for AdaptiveCompressor {
    fn default() -> Self {
        Self::new(CompressionAlgorithm::Zstd)
    }
}

impl AdaptiveCompressor {
    pub const DEFAULT_THRESHOLD: usize = 256;

    pub fn new(preferred: CompressionAlgorithm) -> Self {
        Self {
            preferred: Compressor::new(preferred),
            size_threshold: Self::DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, size_threshold: usize) -> Self {
        self.size_threshold = size_threshold;
        self
    }

    /// Compress and prefix the algorithm byte
    pub fn compress_tagged(&self, data: &[u8]) -> Result<Vec<u8>, SyncError> {
        let compressor = if data.len() < self.size_threshold {
            Compressor::new(CompressionAlgorithm::None)
        } else {
            self.preferred
        };

        let body = compressor.compress(data)?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(compressor.algorithm().to_byte());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decompress_tagged(&self, data: &[u8]) -> Result<Vec<u8>, SyncError> {
        let (&tag, body) = data
            .split_first()
            .ok_or_else(|| SyncError::CompressionError("Empty payload".to_string()))?;
        let algorithm = CompressionAlgorithm::from_byte(tag)?;
        Compressor::new(algorithm).decompress(body)
    }
}
