//! Byte transports
//!
//! [`Transport`] moves opaque chunks of bytes. [`FramedTransport`] layers the
//! tagged framing on top, and [`ChannelTransport`] is an in-process link that
//! can simulate latency, jitter and loss.

use crate::protocol::{Frame, FramedCodec, MessageStats};
use crate::NetworkError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{trace, warn};

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, bytes: Bytes) -> Result<(), NetworkError>;

    /// Next chunk from the peer. `None` once the peer has gone away.
    async fn recv(&mut self) -> Result<Option<Bytes>, NetworkError>;
}

/// Impairments applied to every chunk sent over a [`ChannelTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkConditions {
    pub latency: Duration,
    /// Extra delay drawn uniformly from `0..=jitter`
    pub jitter: Duration,
    /// Probability of dropping a chunk, 0.0 to 1.0
    pub packet_loss: f64,
}

impl LinkConditions {
    pub fn perfect() -> Self {
        Self::default()
    }

    pub fn mobile() -> Self {
        Self {
            latency: Duration::from_millis(150),
            jitter: Duration::from_millis(50),
            packet_loss: 0.02,
        }
    }

    pub fn poor() -> Self {
        Self {
            latency: Duration::from_millis(500),
            jitter: Duration::from_millis(200),
            packet_loss: 0.10,
        }
    }
}

struct Chunk {
    deliver_at: Instant,
    bytes: Bytes,
}

/// One end of an in-process link
///
/// Chunks are delivered in order. Jitter only ever delays a chunk behind its
/// predecessor, it never reorders.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Chunk>,
    rx: mpsc::UnboundedReceiver<Chunk>,
    conditions: LinkConditions,
    rng: StdRng,
    last_delivery: Option<Instant>,
    in_flight: Option<Chunk>,
}

impl ChannelTransport {
    /// Connected pair with a perfect link
    pub fn pair() -> (Self, Self) {
        Self::pair_with(LinkConditions::perfect(), LinkConditions::perfect(), 0)
    }

    /// Connected pair. `a_to_b` impairs what the first end sends, `b_to_a`
    /// what the second end sends.
    pub fn pair_with(a_to_b: LinkConditions, b_to_a: LinkConditions, seed: u64) -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        let a = Self {
            tx: tx_a,
            rx: rx_a,
            conditions: a_to_b,
            rng: StdRng::seed_from_u64(seed),
            last_delivery: None,
            in_flight: None,
        };
        let b = Self {
            tx: tx_b,
            rx: rx_b,
            conditions: b_to_a,
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            last_delivery: None,
            in_flight: None,
        };
        (a, b)
    }

    pub fn conditions(&self) -> LinkConditions {
        self.conditions
    }

    fn delivery_time(&mut self) -> Instant {
        let jitter = if self.conditions.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.rng.gen_range(Duration::ZERO..=self.conditions.jitter)
        };
        let at = Instant::now() + self.conditions.latency + jitter;
        let at = self.last_delivery.map_or(at, |last| at.max(last));
        self.last_delivery = Some(at);
        at
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, bytes: Bytes) -> Result<(), NetworkError> {
        if self.conditions.packet_loss > 0.0 && self.rng.gen_bool(self.conditions.packet_loss.min(1.0)) {
            trace!(len = bytes.len(), "Dropped chunk");
            return Ok(());
        }

        let deliver_at = self.delivery_time();
        self.tx
            .send(Chunk { deliver_at, bytes })
            .map_err(|_| NetworkError::ChannelClosed)
    }

    // Cancel safe: a chunk still waiting on its delivery time is kept
    async fn recv(&mut self) -> Result<Option<Bytes>, NetworkError> {
        if self.in_flight.is_none() {
            self.in_flight = self.rx.recv().await;
        }
        let Some(deliver_at) = self.in_flight.as_ref().map(|chunk| chunk.deliver_at) else {
            return Ok(None);
        };
        tokio::time::sleep_until(deliver_at).await;
        Ok(self.in_flight.take().map(|chunk| chunk.bytes))
    }
}

/// Frame-level view of a byte transport
pub struct FramedTransport<T> {
    inner: T,
    read_buf: BytesMut,
    stats: MessageStats,
}

impl<T: Transport> FramedTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
            stats: MessageStats::default(),
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), NetworkError> {
        let mut buf = BytesMut::new();
        FramedCodec::encode(frame, &mut buf)?;
        self.stats.record_sent(buf.len());
        self.inner.send(buf.freeze()).await
    }

    /// Next complete frame. `None` once the peer has gone away.
    ///
    /// A frame that fails to decode is returned as an error and dropped, so
    /// the next call carries on with whatever arrives after it.
    ///
    /// Cancel safe when the inner transport's `recv` is.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, NetworkError> {
        loop {
            let before = self.read_buf.len();
            match FramedCodec::decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    self.stats.record_received(before - self.read_buf.len());
                    return Ok(Some(frame));
                }
                Ok(None) => {}
                Err(err) => {
                    // A rejected header leaves nothing to resume framing from
                    if self.read_buf.len() == before {
                        warn!(%err, discarded = before, "Discarding unframeable bytes");
                        self.read_buf.clear();
                    }
                    return Err(err);
                }
            }

            match self.inner.recv().await? {
                Some(chunk) => self.read_buf.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
    }

    pub fn stats(&self) -> &MessageStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut MessageStats {
        &mut self.stats
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}
