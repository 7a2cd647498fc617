//! Virtual packet connection for one flow.
//!
//! State machine: live → closed, one way. Closing is idempotent and may come
//! from the table (eviction, teardown), the handler side (flow finished) or
//! the submission context being cancelled.

use std::io;
use std::net::SocketAddr;
use std::sync::OnceLock;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use udpnat_core::Packet;

use crate::deadline::Deadline;
use crate::error::{CloseReason, NatError};
use crate::writer::WriteBack;

pub struct NatSession {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    inbound_tx: mpsc::Sender<Packet>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
    cancel: CancellationToken,
    reason: OnceLock<CloseReason>,
    write_back: OnceLock<WriteBack>,
    read_deadline: Deadline,
}

impl NatSession {
    /// A live session whose lifetime is bounded by `parent`.
    pub(crate) fn new(
        parent: &CancellationToken,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        capacity: usize,
    ) -> Self {
        let (inbound_tx, inbound) = mpsc::channel(capacity.max(1));
        Self {
            local_addr,
            remote_addr,
            inbound_tx,
            inbound: Mutex::new(inbound),
            cancel: parent.child_token(),
            reason: OnceLock::new(),
            write_back: OnceLock::new(),
            read_deadline: Deadline::new(),
        }
    }

    /// Bind the write-back target. Only the first call takes effect.
    pub(crate) fn bind(&self, write_back: WriteBack) -> bool {
        self.write_back.set(write_back).is_ok()
    }

    /// The flow's source address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The flow's destination address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn write_back(&self) -> Option<&WriteBack> {
        self.write_back.get()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why the session closed, or `None` while it is live.
    pub fn close_reason(&self) -> Option<CloseReason> {
        if !self.is_closed() {
            return None;
        }
        Some(
            self.reason
                .get()
                .copied()
                .unwrap_or(CloseReason::ContextCancelled),
        )
    }

    /// Token cancelled when the session closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Queue bound; a submitter blocks once this many packets are waiting.
    pub fn capacity(&self) -> usize {
        self.inbound_tx.max_capacity()
    }

    /// Packets waiting to be read.
    pub fn queued(&self) -> usize {
        self.inbound_tx.max_capacity() - self.inbound_tx.capacity()
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Next packet in arrival order.
    ///
    /// Fails with `Closed` once the session is closed, even if packets are
    /// still queued, and with `DeadlineExceeded` when the read deadline
    /// passes first. A queued packet wins over an elapsed deadline.
    pub async fn read_packet(&self) -> Result<Packet, NatError> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NatError::Closed),
            packet = async { self.inbound.lock().await.recv().await } => {
                packet.ok_or(NatError::Closed)
            }
            _ = self.read_deadline.wait() => Err(NatError::DeadlineExceeded),
        };
        self.settle_read(result)
    }

    /// A close that raced this read skipped the drain while the queue was
    /// held; release what is left now that it is free.
    fn settle_read(&self, result: Result<Packet, NatError>) -> Result<Packet, NatError> {
        if self.is_closed() {
            self.drain();
        }
        result
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline.get()
    }

    /// Only the read deadline is modelled.
    pub fn set_deadline(&self, _at: Option<Instant>) -> Result<(), NatError> {
        Err(NatError::InvalidArgument)
    }

    /// Writes pass straight through to the write-back target and have no
    /// timeout of their own.
    pub fn set_write_deadline(&self, _at: Option<Instant>) -> Result<(), NatError> {
        Err(NatError::InvalidArgument)
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Send a packet out through the write-back target.
    ///
    /// Not meant to be called concurrently; the handler serializes its writes.
    pub async fn write_packet(&self, buffer: Bytes, destination: SocketAddr) -> Result<(), NatError> {
        let write_back = self.write_back.get().ok_or_else(|| {
            NatError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "write-back target not bound",
            ))
        })?;
        write_back.writer().write_packet(buffer, destination).await?;
        Ok(())
    }

    // ── Closing ──────────────────────────────────────────────────────────────

    pub fn close(&self) -> Result<(), NatError> {
        self.close_with(CloseReason::Closed)
    }

    pub(crate) fn close_with(&self, reason: CloseReason) -> Result<(), NatError> {
        if !self.cancel.is_cancelled() {
            let _ = self.reason.set(reason);
            self.cancel.cancel();
        }
        self.drain();
        match self.write_back.get() {
            Some(write_back) => write_back.close().map_err(NatError::from),
            None => Ok(()),
        }
    }

    /// Hand a packet to the reader. Blocks while the queue is full; the packet
    /// is dropped if the session closes or `ctx` is cancelled first.
    pub(crate) async fn enqueue(&self, ctx: &CancellationToken, packet: Packet) -> bool {
        if self.is_closed() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.inbound_tx.send(packet) => sent.is_ok(),
            _ = ctx.cancelled() => false,
        }
    }

    /// Release queued packets once closed. Skipped while a reader holds the
    /// queue; that reader drains on its way out.
    fn drain(&self) {
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.close();
            while inbound.try_recv().is_ok() {}
        }
    }
}

impl std::fmt::Debug for NatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatSession")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("close_reason", &self.close_reason())
            .finish()
    }
}
