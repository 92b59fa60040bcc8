//! State replication for Tether
//!
//! Keeps per-client mirrors of authoritative entity state in sync while
//! enforcing per-client visibility. Entities record property-level changes,
//! collections diff their key sets between flushes, and the broadcaster turns
//! one shared structural patch into a leak-free patch per client.

pub mod broadcaster;
pub mod collection;
pub mod compress;
pub mod event;
pub mod mirror;
pub mod movement;
pub mod patch;
pub mod schema;
pub mod sync;
pub mod tracked;

pub use broadcaster::{Broadcaster, ClientSyncState, FlushResult, VisibilityPolicy};
pub use collection::EntityCollection;
pub use compress::{AdaptiveCompressor, CompressionAlgorithm, Compressor, MAX_DECOMPRESSED_LEN};
pub use event::PendingEvent;
pub use mirror::{ClientMirror, MirrorSettings, Reconciler, Verbatim};
pub use movement::{Direction, Movable, Movement, MovementEvent, MovementPartial};
pub use patch::{EntityId, Operation, OperationKind, Patch};
pub use schema::{Schema, Visibility};
pub use sync::{ClientSession, Received, ResyncReason, SessionConfig, SessionStats, SyncMessage};
pub use tracked::{Property, PropertyOptions, Tracked, TrackingMode};

use thiserror::Error;

/// A property-level update was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Malformed value for property '{property}'")]
    Malformed { property: String },
}

impl UpdateError {
    /// Prefix the failing property with the name of the field that contains it
    pub fn within(self, parent: &str) -> Self {
        match self {
            UpdateError::Malformed { property } => UpdateError::Malformed {
                property: format!("{parent}.{property}"),
            },
        }
    }
}

/// Applying an operation to a collection failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// An update targeted an id the collection does not hold. Indicates a
    /// missed add, out-of-order delivery or a server bug.
    #[error("Entity not found: {collection}[{id}]")]
    EntityNotFound { collection: &'static str, id: String },

    #[error("Failed to update {collection}[{id}]: {source}")]
    Update {
        collection: &'static str,
        id: String,
        #[source]
        source: UpdateError,
    },
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Patch application failed: {0}")]
    PatchApplication(#[source] ApplyError),

    #[error("Stale patch: arrived {latency:?} after it was produced")]
    StalePatch { latency: std::time::Duration },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),
}
