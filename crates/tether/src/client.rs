//! Mirroring side of the simulation

use crate::server::WorldMessage;
use crate::world::{ClientId, World, WorldEvent, WorldReconciler};
use std::time::Duration;
use tether_network::{ControlMessage, Frame, PayloadCodec, PROTOCOL_VERSION};
use tether_state::{ClientMirror, ClientSession, MirrorSettings, SessionConfig, SessionStats};
use tracing::{debug, info, trace, warn};

pub struct Client {
    id: ClientId,
    session: ClientSession<World, WorldReconciler>,
    codec: PayloadCodec,
    events_seen: u64,
    closed: bool,
}

impl Client {
    pub fn new(
        id: ClientId,
        settings: MirrorSettings,
        config: SessionConfig,
        codec: PayloadCodec,
    ) -> Self {
        Self {
            id,
            session: ClientSession::new(ClientMirror::new(WorldReconciler, settings), config),
            codec,
            events_seen: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// First message to send on a fresh connection
    pub fn hello(&self) -> ControlMessage {
        ControlMessage::Hello {
            version: PROTOCOL_VERSION,
            client_id: self.id,
        }
    }

    /// Handle one inbound frame. Returns the control message to send back, if
    /// any.
    pub fn handle_frame(&mut self, frame: Frame) -> Option<ControlMessage> {
        match frame {
            Frame::Sync(payload) => match self.codec.decode::<WorldMessage>(&payload) {
                Ok(message) => self.receive(message),
                Err(err) => self.reject(err),
            },
            Frame::Control(ControlMessage::Ping { timestamp }) => {
                Some(ControlMessage::Pong { timestamp })
            }
            Frame::Control(ControlMessage::Goodbye) => {
                info!(client = self.id, "Server said goodbye");
                self.closed = true;
                None
            }
            Frame::Control(other) => {
                debug!(client = self.id, ?other, "Ignoring control message");
                None
            }
            Frame::Foreign { tag, payload } => {
                trace!(client = self.id, tag, len = payload.len(), "Ignoring foreign frame");
                None
            }
        }
    }

    /// Account for a sync message lost to a decode or framing error
    pub fn reject(&mut self, reason: impl std::fmt::Display) -> Option<ControlMessage> {
        self.session.reject(reason).map(|reason| {
            warn!(client = self.id, ?reason, "Asking for full state");
            ControlMessage::ResyncRequest
        })
    }

    /// Feed one decoded message into the session
    pub fn receive(&mut self, message: WorldMessage) -> Option<ControlMessage> {
        let tick = message.tick;
        let received = self.session.receive(message);
        self.events_seen += received.events.len() as u64;
        for event in &received.events {
            if let WorldEvent::Attack { target, .. } = event {
                if *target == self.id {
                    debug!(client = self.id, tick, "Under attack");
                }
            }
        }

        received.resync.map(|reason| {
            warn!(client = self.id, tick, ?reason, "Asking for full state");
            ControlMessage::ResyncRequest
        })
    }

    pub fn advance(&mut self, dt: Duration) {
        self.session.advance(dt);
    }

    pub fn state(&self) -> &World {
        self.session.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    /// Set once the server has sent a goodbye
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
