//! Sync payload encoding: bincode, then tagged compression

use crate::protocol::Frame;
use crate::NetworkError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_state::{AdaptiveCompressor, CompressionAlgorithm, SyncError};
use tracing::trace;

#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec {
    compressor: AdaptiveCompressor,
}

impl PayloadCodec {
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self {
            compressor: AdaptiveCompressor::new(algorithm),
        }
    }

    /// Payloads smaller than `threshold` bytes are sent uncompressed
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.compressor = self.compressor.with_threshold(threshold);
        self
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, NetworkError> {
        let raw = bincode::serialize(value)
            .map_err(|e| SyncError::SerializationError(e.to_string()))?;
        let encoded = self.compressor.compress_tagged(&raw)?;
        trace!(raw = raw.len(), encoded = encoded.len(), "Encoded payload");
        Ok(Bytes::from(encoded))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, NetworkError> {
        let raw = self.compressor.decompress_tagged(bytes)?;
        let value = bincode::deserialize(&raw)
            .map_err(|e| SyncError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    /// Encode `value` as a sync frame
    pub fn frame<T: Serialize>(&self, value: &T) -> Result<Frame, NetworkError> {
        self.encode(value).map(Frame::Sync)
    }
}
