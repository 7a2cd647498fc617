//! udpnat — user-space UDP NAT table.
//!
//! Inbound datagrams are grouped by flow key into virtual packet
//! connections ([`NatSession`]). The first packet of a flow creates its
//! session and hands it to a [`FlowHandler`] exactly once; later packets are
//! queued to the same session until the flow finishes or sits idle past the
//! table's max age.
//!
//! # Organization
//! - [`NatService`] is the per-packet entry point
//! - [`NatTable`] holds the LRU/TTL mapping from key to session
//! - [`NatSession`] is the read/write/close side a handler works with
//! - [`WriteBack`] and [`PacketWriter`] carry a flow's return traffic

pub mod deadline;
pub mod error;
pub mod handler;
pub mod service;
pub mod session;
pub mod table;
pub mod writer;

pub use deadline::Deadline;
pub use error::{CloseReason, NatError};
pub use handler::{FlowDone, FlowHandler};
pub use service::{NatService, MAX_SUBMIT_ATTEMPTS};
pub use session::NatSession;
pub use table::NatTable;
pub use writer::{DirectBackWriter, PacketWriter, WriteBack};

pub use udpnat_core::{ConfigError, FlowTuple, NatConfig, Packet};
