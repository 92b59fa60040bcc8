//! Server and clients wired together over simulated links
//!
//! Every client gets its own [`ChannelTransport`] pair. On the server side a
//! connection task owns the link, forwarding queued frames out and control
//! messages in, so the tick loop itself never waits on the network.

use crate::client::Client;
use crate::server::{Server, ServerConfig};
use crate::world::{self, ClientId, RadiusPolicy};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::time::Duration;
use tether_network::{
    ChannelTransport, ControlMessage, Frame, FramedTransport, LinkConditions, MessageStats,
    PayloadCodec,
};
use tether_state::{
    CompressionAlgorithm, MirrorSettings, SessionConfig, SessionStats, TrackingMode,
    VisibilityPolicy,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Tether simulation - an authoritative world mirrored to clients over simulated links"
)]
struct Args {
    /// Number of connected clients
    #[arg(long, default_value = "4")]
    clients: u32,

    /// Number of actors in the world (clients control the first ones)
    #[arg(long, default_value = "32")]
    actors: u32,

    /// Number of server ticks to run
    #[arg(long, default_value = "200")]
    ticks: u64,

    /// Tick length in milliseconds
    #[arg(long, default_value = "50")]
    tick_ms: u64,

    /// How far a client can see around its actor
    #[arg(long, default_value = "12.0")]
    view_radius: f32,

    /// Side length of the square world
    #[arg(long, default_value = "64.0", value_parser = parse_world_size)]
    world_size: f32,

    /// Compression applied to sync payloads
    #[arg(long, value_enum, default_value = "zstd")]
    compression: CompressionAlgorithm,

    /// Change tracking and patch reconciliation mode
    #[arg(long, value_enum, default_value = "optimized")]
    tracking: TrackingMode,

    /// Do not interpolate movement between patches on the clients
    #[arg(long)]
    no_interpolation: bool,

    /// One-way latency from server to clients in milliseconds
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// Extra random delay in milliseconds
    #[arg(long, default_value = "0")]
    jitter_ms: u64,

    /// Probability of losing a server to client chunk
    #[arg(long, default_value = "0.0")]
    packet_loss: f64,

    /// Patches older than this on arrival trigger a resync
    #[arg(long, default_value = "1500")]
    stale_ms: u64,

    /// Seed for the world and the links
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn parse_world_size(value: &str) -> Result<f32, String> {
    let size: f32 = value.parse().map_err(|e| format!("{e}"))?;
    if size.is_finite() && size > 0.0 {
        Ok(size)
    } else {
        Err(format!("world size must be a positive number, got {value}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimConfig {
    pub server: ServerConfig,
    pub clients: u32,
    pub ticks: u64,
    pub tick: Duration,
    /// Impairments on the server to client direction
    pub downstream: LinkConditions,
    pub upstream: LinkConditions,
    pub compression: CompressionAlgorithm,
    pub mirror: MirrorSettings,
    pub session: SessionConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            clients: 4,
            ticks: 200,
            tick: Duration::from_millis(50),
            downstream: LinkConditions::perfect(),
            upstream: LinkConditions::perfect(),
            compression: CompressionAlgorithm::default(),
            mirror: MirrorSettings::optimized(),
            session: SessionConfig::default(),
        }
    }
}

impl From<&Args> for SimConfig {
    fn from(args: &Args) -> Self {
        let mut mirror = match args.tracking {
            TrackingMode::Exact => MirrorSettings::exact(),
            TrackingMode::Optimized => MirrorSettings::optimized(),
        };
        if args.no_interpolation {
            mirror.interpolate = false;
        }

        Self {
            server: ServerConfig {
                actors: args.actors.max(args.clients),
                world_size: args.world_size,
                view_radius: args.view_radius,
                tracking: args.tracking,
                seed: args.seed,
                ..ServerConfig::default()
            },
            clients: args.clients,
            ticks: args.ticks,
            tick: Duration::from_millis(args.tick_ms.max(1)),
            downstream: LinkConditions {
                latency: Duration::from_millis(args.latency_ms),
                jitter: Duration::from_millis(args.jitter_ms),
                packet_loss: args.packet_loss.clamp(0.0, 1.0),
            },
            upstream: LinkConditions::perfect(),
            compression: args.compression,
            mirror,
            session: SessionConfig {
                stale_threshold: Duration::from_millis(args.stale_ms),
                ..SessionConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientReport {
    pub id: ClientId,
    /// Traffic as seen by the server end of the link
    pub link: MessageStats,
    pub session: SessionStats,
    pub events_seen: u64,
    /// Visible entities the mirror gets wrong at the end of the run
    pub divergence: usize,
    pub actors_mirrored: usize,
    pub items_mirrored: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimReport {
    pub ticks: u64,
    pub resync_requests: u64,
    pub clients: Vec<ClientReport>,
}

impl SimReport {
    pub fn bytes_sent(&self) -> u64 {
        self.clients.iter().map(|client| client.link.bytes_sent).sum()
    }

    pub fn total_divergence(&self) -> usize {
        self.clients.iter().map(|client| client.divergence).sum()
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "ticks={} clients={} bytes_sent={} resync_requests={} divergence={}",
            self.ticks,
            self.clients.len(),
            self.bytes_sent(),
            self.resync_requests,
            self.total_divergence()
        )?;
        for client in &self.clients {
            writeln!(
                f,
                "client={} bytes={} frames={} applied={} stale={} failed={} resyncs={} events={} actors={} items={} divergence={}",
                client.id,
                client.link.bytes_sent,
                client.link.messages_sent,
                client.session.patches_applied,
                client.session.stale_patches,
                client.session.failed_patches,
                client.session.resyncs_requested,
                client.events_seen,
                client.actors_mirrored,
                client.items_mirrored,
                client.divergence
            )?;
        }
        Ok(())
    }
}

/// Run the whole simulation and report what every client ended up with
pub async fn simulate(config: SimConfig) -> Result<SimReport> {
    let codec = PayloadCodec::new(config.compression);
    let mut server = Server::new(config.server);
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

    let mut outbound = BTreeMap::new();
    let mut connections: Vec<JoinHandle<Result<MessageStats>>> = Vec::new();
    let mut clients: Vec<JoinHandle<Result<Client>>> = Vec::new();

    for id in 0..config.clients {
        let (server_end, client_end) = ChannelTransport::pair_with(
            config.downstream,
            config.upstream,
            config.server.seed.wrapping_add(u64::from(id) * 2),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        outbound.insert(id, tx);
        connections.push(tokio::spawn(serve_connection(
            id,
            FramedTransport::new(server_end),
            rx,
            inbound_tx.clone(),
        )));

        let client = Client::new(id, config.mirror, config.session, codec);
        clients.push(tokio::spawn(run_client(
            client,
            FramedTransport::new(client_end),
            config.tick,
        )));
    }
    drop(inbound_tx);

    let mut interval = tokio::time::interval(config.tick);
    for _ in 0..config.ticks {
        interval.tick().await;

        while let Ok((client, message)) = inbound_rx.try_recv() {
            if let Some(reply) = server.handle_control(client, message) {
                queue(&outbound, client, Frame::Control(reply));
            }
        }

        server.step(config.tick);
        for (client, message) in server.flush() {
            let frame = codec.frame(&message).context("Failed to encode sync message")?;
            queue(&outbound, client, frame);
        }
    }

    // Connections finish once their backlog is sent
    drop(outbound);
    let mut links = Vec::with_capacity(connections.len());
    for connection in connections {
        links.push(connection.await.context("Connection task panicked")??);
    }

    let policy = RadiusPolicy {
        radius: config.server.view_radius,
    };
    let mut reports = Vec::with_capacity(clients.len());
    for (handle, link) in clients.into_iter().zip(links) {
        let client = handle.await.context("Client task panicked")??;
        let visible = policy.visibility(&client.id(), server.world());
        let divergence = world::divergence(server.world(), client.state(), &visible);
        if divergence > 0 {
            warn!(client = client.id(), divergence, "Mirror diverged from server");
        }
        reports.push(ClientReport {
            id: client.id(),
            link,
            session: client.stats(),
            events_seen: client.events_seen(),
            divergence,
            actors_mirrored: client.state().actors.len(),
            items_mirrored: client.state().items.len(),
        });
    }

    Ok(SimReport {
        ticks: server.tick(),
        resync_requests: server.resync_requests(),
        clients: reports,
    })
}

fn queue(outbound: &BTreeMap<ClientId, mpsc::UnboundedSender<Frame>>, client: ClientId, frame: Frame) {
    let delivered = outbound
        .get(&client)
        .map_or(false, |tx| tx.send(frame).is_ok());
    if !delivered {
        debug!(client, "Dropping frame for closed connection");
    }
}

/// Server end of one client link
async fn serve_connection(
    client: ClientId,
    mut link: FramedTransport<ChannelTransport>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<(ClientId, ControlMessage)>,
) -> Result<MessageStats> {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if let Err(err) = link.send_frame(&frame).await {
                    debug!(client, %err, "Client link closed");
                    break;
                }
            }
            frame = link.recv_frame() => match frame? {
                Some(Frame::Control(message)) => {
                    if inbound.send((client, message)).is_err() {
                        break;
                    }
                }
                Some(other) => debug!(client, tag = other.tag(), "Ignoring frame from client"),
                None => break,
            },
        }
    }
    Ok(link.stats().clone())
}

/// Client end of one link. Returns the client once the server hangs up.
async fn run_client(
    mut client: Client,
    mut link: FramedTransport<ChannelTransport>,
    tick: Duration,
) -> Result<Client> {
    link.send_frame(&Frame::Control(client.hello()))
        .await
        .context("Failed to send hello")?;

    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = interval.tick() => client.advance(tick),
            frame = link.recv_frame() => {
                let reply = match frame {
                    Ok(Some(frame)) => client.handle_frame(frame),
                    Ok(None) => break,
                    Err(err) => client.reject(err),
                };
                if let Some(reply) = reply {
                    if let Err(err) = link.send_frame(&Frame::Control(reply)).await {
                        debug!(client = client.id(), %err, "Server link closed");
                        break;
                    }
                }
                if client.is_closed() {
                    break;
                }
            }
        }
    }
    Ok(client)
}

pub async fn run() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level {
        LogLevel::Trace => tracing::Level::TRACE,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Error => tracing::Level::ERROR,
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .init();

    let config = SimConfig::from(&args);
    info!(
        clients = config.clients,
        actors = config.server.actors,
        ticks = config.ticks,
        tick_ms = config.tick.as_millis() as u64,
        "Starting simulation"
    );

    let report = simulate(config).await?;
    info!(
        bytes_sent = report.bytes_sent(),
        resync_requests = report.resync_requests,
        divergence = report.total_divergence(),
        "Simulation finished"
    );
    print!("{report}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_to_config() {
        let args = Args::parse_from([
            "tether-sim",
            "--clients",
            "8",
            "--actors",
            "2",
            "--tracking",
            "exact",
            "--latency-ms",
            "120",
            "--packet-loss",
            "2.0",
            "--compression",
            "lz4",
        ]);
        let config = SimConfig::from(&args);

        assert_eq!(config.clients, 8);
        // Every client needs an actor of its own
        assert_eq!(config.server.actors, 8);
        assert_eq!(config.server.tracking, TrackingMode::Exact);
        assert_eq!(config.mirror, MirrorSettings::exact());
        assert_eq!(config.downstream.latency, Duration::from_millis(120));
        assert_eq!(config.downstream.packet_loss, 1.0);
        assert_eq!(config.compression, CompressionAlgorithm::Lz4);
    }

    #[test]
    fn test_world_size_must_be_positive() {
        for bad in ["0", "-3", "nan", "inf", "wide"] {
            let flag = format!("--world-size={bad}");
            assert!(
                Args::try_parse_from(["tether-sim", flag.as_str()]).is_err(),
                "{bad} accepted"
            );
        }

        let args = Args::parse_from(["tether-sim", "--world-size", "0.5"]);
        assert_eq!(SimConfig::from(&args).server.world_size, 0.5);
    }

    #[test]
    fn test_no_interpolation_flag() {
        let args = Args::parse_from(["tether-sim", "--no-interpolation"]);
        let config = SimConfig::from(&args);
        assert!(config.mirror.optimize_patches);
        assert!(!config.mirror.interpolate);
    }
}
