//! Wire layer for Tether
//!
//! Frames sync traffic with a stable tag range so it can share one stream
//! with unrelated protocols, encodes sync bundles with bincode plus optional
//! compression, and abstracts the byte transport behind a small async trait.

pub mod codec;
pub mod protocol;
pub mod transport;

pub use codec::PayloadCodec;
pub use protocol::{
    ControlMessage, Frame, FramedCodec, MessageStats, MAX_FRAME_LEN, PROTOCOL_VERSION,
    SYNC_TAGS, TAG_SYNC_CONTROL, TAG_SYNC_PATCH,
};
pub use transport::{ChannelTransport, FramedTransport, LinkConditions, Transport};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unknown sync tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State error: {0}")]
    State(#[from] tether_state::SyncError),
}
