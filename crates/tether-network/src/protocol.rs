//! Framing and control messages
//!
//! Every frame is a big-endian `u32` length, a tag byte and the payload. The
//! length covers the tag. Tags in [`SYNC_TAGS`] belong to sync traffic; any
//! other tag is handed back untouched as [`Frame::Foreign`].

use crate::NetworkError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rkyv::{Archive, Deserialize, Serialize};
use std::ops::RangeInclusive;
use tether_state::sync::timestamp_now;

pub const PROTOCOL_VERSION: u32 = 1;

/// Tags reserved for sync traffic
pub const SYNC_TAGS: RangeInclusive<u8> = 0x40..=0x4F;

/// Encoded [`SyncMessage`](tether_state::SyncMessage) bundle
pub const TAG_SYNC_PATCH: u8 = 0x40;

/// rkyv-encoded [`ControlMessage`]
pub const TAG_SYNC_CONTROL: u8 = 0x41;

/// Also the most a sync payload may decompress to
pub const MAX_FRAME_LEN: usize = tether_state::MAX_DECOMPRESSED_LEN;

const HEADER_LEN: usize = 4;

/// Out-of-band messages between a sync client and server
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum ControlMessage {
    /// First message from a client
    Hello { version: u32, client_id: u32 },

    /// Client asks for a full bootstrap on the next flush
    ResyncRequest,

    Ping { timestamp: u64 },

    Pong { timestamp: u64 },

    /// Either side is leaving
    Goodbye,
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<Bytes, NetworkError> {
        let bytes = rkyv::to_bytes::<_, 64>(self)
            .map_err(|e| NetworkError::ProtocolError(format!("Serialization failed: {e}")))?;
        Ok(Bytes::from(bytes.to_vec()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        // rkyv needs an aligned buffer
        let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);

        let archived = rkyv::check_archived_root::<Self>(&aligned)
            .map_err(|e| NetworkError::ProtocolError(format!("Validation failed: {e}")))?;

        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| NetworkError::ProtocolError(format!("Deserialization failed: {e:?}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Encoded sync bundle, decoded by [`PayloadCodec`](crate::PayloadCodec)
    Sync(Bytes),
    Control(ControlMessage),
    /// Traffic of another protocol sharing the stream
    Foreign { tag: u8, payload: Bytes },
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Sync(_) => TAG_SYNC_PATCH,
            Frame::Control(_) => TAG_SYNC_CONTROL,
            Frame::Foreign { tag, .. } => *tag,
        }
    }
}

pub struct FramedCodec;

impl FramedCodec {
    /// Append one frame to `buf`
    pub fn encode(frame: &Frame, buf: &mut BytesMut) -> Result<(), NetworkError> {
        let control;
        let payload: &[u8] = match frame {
            Frame::Sync(payload) => payload,
            Frame::Control(message) => {
                control = message.to_bytes()?;
                &control
            }
            Frame::Foreign { tag, payload } => {
                if SYNC_TAGS.contains(tag) {
                    return Err(NetworkError::ProtocolError(format!(
                        "Foreign frame uses reserved tag {tag:#04x}"
                    )));
                }
                payload
            }
        };

        let len = payload.len() + 1;
        if len > MAX_FRAME_LEN {
            return Err(NetworkError::FrameTooLarge(len));
        }

        buf.reserve(HEADER_LEN + len);
        buf.put_u32(len as u32);
        buf.put_u8(frame.tag());
        buf.extend_from_slice(payload);
        Ok(())
    }

    /// Take one complete frame off the front of `buf`. Returns `None` until
    /// enough bytes have arrived.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, NetworkError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_LEN];
        length_bytes.copy_from_slice(&buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(length_bytes) as usize;

        if len == 0 {
            return Err(NetworkError::ProtocolError("Frame without tag".to_string()));
        }
        if len > MAX_FRAME_LEN {
            return Err(NetworkError::FrameTooLarge(len));
        }
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let tag = buf.get_u8();
        let payload = buf.split_to(len - 1).freeze();

        let frame = match tag {
            TAG_SYNC_PATCH => Frame::Sync(payload),
            TAG_SYNC_CONTROL => Frame::Control(ControlMessage::from_bytes(&payload)?),
            tag if SYNC_TAGS.contains(&tag) => return Err(NetworkError::UnknownTag(tag)),
            tag => Frame::Foreign { tag, payload },
        };
        Ok(Some(frame))
    }
}

/// Traffic counters for one endpoint
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_rtt_micros: Option<u64>,
}

impl MessageStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Update RTT from the timestamp echoed in a pong
    pub fn update_rtt(&mut self, sent_timestamp: u64) {
        let now = timestamp_now();
        if now > sent_timestamp {
            self.last_rtt_micros = Some(now - sent_timestamp);
        }
    }
}
