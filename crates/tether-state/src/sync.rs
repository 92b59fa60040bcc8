//! Client sync session
//!
//! Wraps a [`ClientMirror`] with the checks that decide when the mirror can no
//! longer be trusted. Patches that arrive too late or fail to apply both end
//! in the same recovery, a request for a fresh bootstrap, throttled so a burst
//! of bad patches produces one request.

use crate::mirror::{ClientMirror, Reconciler};
use crate::patch::Patch;
use crate::schema::Schema;
use crate::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Per-client bundle produced by one server flush
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage<Op, Ev> {
    pub tick: u64,
    /// Server wall clock when the bundle was produced
    pub server_time_micros: u64,
    /// `None` when the flush had nothing for this client
    pub patch: Option<Patch<Op>>,
    pub events: Vec<Ev>,
}

/// Microseconds since the Unix epoch
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Patches older than this on arrival are considered stale
    pub stale_threshold: Duration,
    /// Minimum time between two resync requests
    pub resync_cooldown: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_millis(1500),
            resync_cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResyncReason {
    Stale { latency: Duration },
    Failed(String),
}

/// Outcome of receiving one message
#[derive(Debug, Clone, PartialEq)]
pub struct Received<Ev> {
    pub events: Vec<Ev>,
    /// Set when the caller should ask the server for a full bootstrap
    pub resync: Option<ResyncReason>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub messages: u64,
    pub patches_applied: u64,
    pub stale_patches: u64,
    pub failed_patches: u64,
    pub resyncs_requested: u64,
    pub last_tick: Option<u64>,
}

pub struct ClientSession<S, R> {
    mirror: ClientMirror<S, R>,
    config: SessionConfig,
    last_resync: Option<Instant>,
    stats: SessionStats,
}

impl<S, R> ClientSession<S, R>
where
    S: Schema + Default,
    R: Reconciler<S>,
{
    pub fn new(mirror: ClientMirror<S, R>, config: SessionConfig) -> Self {
        Self {
            mirror,
            config,
            last_resync: None,
            stats: SessionStats::default(),
        }
    }

    pub fn receive(&mut self, message: SyncMessage<S::Operation, R::Event>) -> Received<R::Event> {
        self.receive_at(message, timestamp_now(), Instant::now())
    }

    /// Receive a message as if the wall clock read `now_micros`. `now` drives
    /// the resync throttle.
    pub fn receive_at(
        &mut self,
        message: SyncMessage<S::Operation, R::Event>,
        now_micros: u64,
        now: Instant,
    ) -> Received<R::Event> {
        let SyncMessage {
            tick,
            server_time_micros,
            patch,
            events,
        } = message;

        self.stats.messages += 1;
        self.stats.last_tick = Some(tick);

        let mut trouble = None;

        let latency = Duration::from_micros(now_micros.saturating_sub(server_time_micros));
        if latency > self.config.stale_threshold {
            self.stats.stale_patches += 1;
            let err = SyncError::StalePatch { latency };
            warn!(tick, %err, "Stale patch detected");
            trouble = Some(ResyncReason::Stale { latency });
        }

        // Stale patches are still applied; a bootstrap will correct them later
        if patch.is_some() || !events.is_empty() {
            match self.mirror.apply_patch(patch.unwrap_or_default(), &events) {
                Ok(()) => self.stats.patches_applied += 1,
                Err(err) => {
                    self.stats.failed_patches += 1;
                    error!(tick, %err, "Could not apply patch");
                    trouble = Some(ResyncReason::Failed(err.to_string()));
                }
            }
        }

        let resync = self.throttle(trouble, now);
        Received { events, resync }
    }

    /// Count a message that never made it to the mirror, such as a payload
    /// that failed to decode. Returns the resync to request, if any.
    pub fn reject(&mut self, reason: impl fmt::Display) -> Option<ResyncReason> {
        self.reject_at(reason, Instant::now())
    }

    pub fn reject_at(&mut self, reason: impl fmt::Display, now: Instant) -> Option<ResyncReason> {
        self.stats.messages += 1;
        self.stats.failed_patches += 1;
        error!(%reason, "Dropped undecodable message");
        self.throttle(Some(ResyncReason::Failed(reason.to_string())), now)
    }

    fn throttle(&mut self, trouble: Option<ResyncReason>, now: Instant) -> Option<ResyncReason> {
        let resync = trouble.filter(|_| self.may_request_resync(now));
        if let Some(reason) = &resync {
            debug!(?reason, "Requesting full state");
            self.stats.resyncs_requested += 1;
            self.last_resync = Some(now);
        }
        resync
    }

    fn may_request_resync(&self, now: Instant) -> bool {
        self.last_resync
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.resync_cooldown)
    }

    /// Advance local interpolation
    pub fn advance(&mut self, dt: Duration) {
        self.mirror.advance(dt);
    }

    pub fn mirror(&self) -> &ClientMirror<S, R> {
        &self.mirror
    }

    pub fn mirror_mut(&mut self) -> &mut ClientMirror<S, R> {
        &mut self.mirror
    }

    pub fn state(&self) -> &S {
        self.mirror.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }
}
