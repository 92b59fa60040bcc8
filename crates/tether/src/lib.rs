//! Tether simulation
//!
//! A tick-driven server owns a [`world::World`] of walking, fighting actors
//! and mirrors it to every client, each of which only sees what is near its
//! own actor.

pub mod client;
pub mod server;
pub mod sim;
pub mod world;
