use anyhow::{Context, Result};
use std::time::Duration;
use tether_network::{ChannelTransport, Frame, FramedTransport, LinkConditions};

/// Named link profiles for tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkConditions {
    Perfect,
    /// Typical 4G link
    Mobile,
    Poor,
    /// High latency, little loss
    Satellite,
}

impl NetworkConditions {
    pub fn link(self) -> LinkConditions {
        match self {
            NetworkConditions::Perfect => LinkConditions::perfect(),
            NetworkConditions::Mobile => LinkConditions::mobile(),
            NetworkConditions::Poor => LinkConditions::poor(),
            NetworkConditions::Satellite => LinkConditions {
                latency: Duration::from_millis(600),
                jitter: Duration::from_millis(100),
                packet_loss: 0.01,
            },
        }
    }
}

/// Framed server and client ends. Only the server to client direction is
/// impaired.
pub fn framed_pair(
    downstream: NetworkConditions,
    seed: u64,
) -> (
    FramedTransport<ChannelTransport>,
    FramedTransport<ChannelTransport>,
) {
    let (server, client) =
        ChannelTransport::pair_with(downstream.link(), LinkConditions::perfect(), seed);
    (FramedTransport::new(server), FramedTransport::new(client))
}

/// Receive one frame or fail after `limit`
pub async fn recv_within(
    transport: &mut FramedTransport<ChannelTransport>,
    limit: Duration,
) -> Result<Option<Frame>> {
    let frame = tokio::time::timeout(limit, transport.recv_frame())
        .await
        .context("Timed out waiting for frame")??;
    Ok(frame)
}
