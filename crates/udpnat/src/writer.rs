//! Write-back targets — where a flow's outbound packets go.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::session::NatSession;

/// Sink for a flow's return traffic.
///
/// Calls on one writer are not expected to overlap; the flow handler
/// serializes its own writes.
#[async_trait]
pub trait PacketWriter: Send + Sync {
    async fn write_packet(&self, buffer: Bytes, destination: SocketAddr) -> io::Result<()>;
}

#[async_trait]
impl PacketWriter for UdpSocket {
    async fn write_packet(&self, buffer: Bytes, destination: SocketAddr) -> io::Result<()> {
        self.send_to(&buffer, destination).await.map(|_| ())
    }
}

#[async_trait]
impl<W: PacketWriter + ?Sized> PacketWriter for Arc<W> {
    async fn write_packet(&self, buffer: Bytes, destination: SocketAddr) -> io::Result<()> {
        (**self).write_packet(buffer, destination).await
    }
}

type CloseFn = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// A writer bound to one flow, plus the resource to release when the flow
/// closes, if it has one.
pub struct WriteBack {
    writer: Box<dyn PacketWriter>,
    close: Mutex<Option<CloseFn>>,
}

impl WriteBack {
    pub fn new(writer: impl PacketWriter + 'static) -> Self {
        Self {
            writer: Box::new(writer),
            close: Mutex::new(None),
        }
    }

    /// Attach a close function. It runs at most once, on the first close of
    /// the owning session.
    pub fn with_close(self, close: impl FnOnce() -> io::Result<()> + Send + 'static) -> Self {
        Self {
            writer: self.writer,
            close: Mutex::new(Some(Box::new(close))),
        }
    }

    pub fn writer(&self) -> &dyn PacketWriter {
        self.writer.as_ref()
    }

    pub fn is_closable(&self) -> bool {
        match self.close.lock() {
            Ok(close) => close.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    pub(crate) fn close(&self) -> io::Result<()> {
        let close = match self.close.lock() {
            Ok(mut close) => close.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match close {
            Some(close) => close(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WriteBack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBack")
            .field("closable", &self.is_closable())
            .finish()
    }
}

/// Sends every reply straight back to the flow's client through the socket
/// the flow arrived on, whatever address the handler writes to.
pub struct DirectBackWriter<W> {
    source: W,
    client: SocketAddr,
}

impl<W: PacketWriter> DirectBackWriter<W> {
    pub fn new(source: W, client: SocketAddr) -> Self {
        Self { source, client }
    }

    /// Writer for a session being created: replies go to its local address.
    pub fn for_session(source: W, session: &NatSession) -> Self {
        Self::new(source, session.local_addr())
    }

    pub fn source(&self) -> &W {
        &self.source
    }
}

#[async_trait]
impl<W: PacketWriter> PacketWriter for DirectBackWriter<W> {
    async fn write_packet(&self, buffer: Bytes, _destination: SocketAddr) -> io::Result<()> {
        self.source.write_packet(buffer, self.client).await
    }
}
