//! YeiciCap Hub: NatNet multicast in, coordinate-remapped JSON lines out over TCP.
//!
//! Three concurrent activities: the multicast receive loop ([`ingest`]), the TCP
//! accept/liveness tasks ([`server`]) and the pull-transform-broadcast loop ([`bridge`]).

pub mod bridge;
pub mod config;
pub mod ingest;
pub mod server;

pub use bridge::{Bridge, BridgeError, BridgeStats};
pub use config::{Config, ConfigError};
pub use ingest::{IngestConfig, IngestError, IngestStats, Ingestion};
pub use server::{ServerConfig, ServerError, StreamServer};
