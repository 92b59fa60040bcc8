//! Shared setup for tether integration tests

#![allow(dead_code)]

use std::time::Duration;
use tether::server::ServerConfig;
use tether::sim::SimConfig;
use tether_state::{MirrorSettings, TrackingMode};
use tether_test_utils::NetworkConditions;

/// Small, busy world that runs quickly under a paused clock
pub fn quick_config(clients: u32, seed: u64) -> SimConfig {
    SimConfig {
        server: ServerConfig {
            actors: clients.max(12),
            world_size: 32.0,
            view_radius: 10.0,
            seed,
            ..ServerConfig::default()
        },
        clients,
        ticks: 120,
        tick: Duration::from_millis(50),
        ..SimConfig::default()
    }
}

pub fn over(mut config: SimConfig, downstream: NetworkConditions) -> SimConfig {
    config.downstream = downstream.link();
    config
}

pub fn exact(mut config: SimConfig) -> SimConfig {
    config.server.tracking = TrackingMode::Exact;
    config.mirror = MirrorSettings::exact();
    config
}
