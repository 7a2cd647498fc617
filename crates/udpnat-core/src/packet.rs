//! Datagram and flow-key types shared by the table and its callers.

use bytes::Bytes;
use std::net::SocketAddr;

/// A datagram queued on a flow.
///
/// The buffer is owned: whoever holds the `Packet` holds the only release
/// obligation, and dropping it is the release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub buffer: Bytes,
    /// Where the datagram was addressed when it entered the table.
    pub destination: SocketAddr,
}

impl Packet {
    pub fn new(buffer: Bytes, destination: SocketAddr) -> Self {
        Self {
            buffer,
            destination,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// The usual flow key: one client talking to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl FlowTuple {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }
}
