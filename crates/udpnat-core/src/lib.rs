//! udpnat-core — shared types and configuration for the UDP NAT table.
//! The `udpnat` crate builds the session table on top of these.

pub mod config;
pub mod packet;

pub use config::{ConfigError, NatConfig};
pub use packet::{FlowTuple, Packet};
