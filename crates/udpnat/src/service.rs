//! Packet intake — routes each inbound datagram to its flow.
//!
//! Three things race on one key: a new packet, the previous flow finishing,
//! and TTL eviction. The table makes creation atomic per key; `submit`
//! covers the rest by re-checking the session after lookup and retrying
//! on a fresh slot when it finds one that is already closing.

use std::fmt::Debug;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use udpnat_core::{ConfigError, NatConfig, Packet};

use crate::error::CloseReason;
use crate::handler::{FlowDone, FlowHandler};
use crate::session::NatSession;
use crate::table::NatTable;
use crate::writer::WriteBack;

/// Upper bound on lookups per submitted packet. Each retry follows the
/// removal of a closed session, so hitting this takes a flow that keeps
/// closing as fast as it is re-created.
pub const MAX_SUBMIT_ATTEMPTS: usize = 16;

pub struct NatService<K: Eq + Hash> {
    table: Arc<NatTable<K>>,
    handler: Arc<dyn FlowHandler>,
    config: NatConfig,
}

impl<K> NatService<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(config: NatConfig, handler: impl FlowHandler) -> Result<Self, ConfigError> {
        Self::with_handler(config, Arc::new(handler))
    }

    pub fn with_handler(
        config: NatConfig,
        handler: Arc<dyn FlowHandler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            table: Arc::new(NatTable::new(&config)),
            handler,
            config,
        })
    }

    pub fn table(&self) -> &Arc<NatTable<K>> {
        &self.table
    }

    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    pub fn active_flows(&self) -> usize {
        self.table.len()
    }

    /// Start the periodic eviction sweep at the configured interval.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.table
            .spawn_sweeper(self.config.sweep_interval(), shutdown)
    }

    /// Close every flow. Returns how many were open.
    pub fn close(&self) -> usize {
        self.table.close_all()
    }

    /// Route one inbound datagram.
    ///
    /// The first packet for a key creates its session, binds the write-back
    /// target from `writer_factory` and launches the handler without waiting
    /// on it. The packet is then queued; a full queue blocks the caller.
    ///
    /// `writer_factory` runs while the table holds the key's shard lock and
    /// must not call back into this service. Returns whether the packet was
    /// queued; a dropped packet has already been released.
    pub async fn submit<F>(
        &self,
        ctx: &CancellationToken,
        key: K,
        buffer: Bytes,
        source: SocketAddr,
        destination: SocketAddr,
        writer_factory: F,
    ) -> bool
    where
        F: Fn(&NatSession) -> WriteBack,
    {
        let packet = Packet::new(buffer, destination);

        for _ in 0..MAX_SUBMIT_ATTEMPTS {
            let (session, existing) = self.table.lookup_or_create(key.clone(), || {
                let session = Arc::new(NatSession::new(
                    ctx,
                    source,
                    destination,
                    self.config.queue_capacity,
                ));
                session.bind(writer_factory(&session));
                session
            });

            if !existing {
                tracing::debug!(key = ?key, %source, %destination, "new flow");
                self.spawn_flow(ctx, key.clone(), session.clone(), source, destination);
            }

            if session.is_closed() {
                // Closed but not yet removed: clear the stale slot and go again.
                self.table.remove_session(&key, &session);
                if ctx.is_cancelled() {
                    tracing::trace!(key = ?key, "submission cancelled, packet dropped");
                    return false;
                }
                continue;
            }

            let queued = session.enqueue(ctx, packet).await;
            if !queued {
                tracing::trace!(key = ?key, "flow closed while queueing, packet dropped");
            }
            return queued;
        }

        tracing::warn!(
            key = ?key,
            attempts = MAX_SUBMIT_ATTEMPTS,
            "flow closed on every attempt, packet dropped"
        );
        false
    }

    fn spawn_flow(
        &self,
        ctx: &CancellationToken,
        key: K,
        session: Arc<NatSession>,
        source: SocketAddr,
        destination: SocketAddr,
    ) {
        let done = {
            let table = Arc::downgrade(&self.table);
            let weak = Arc::downgrade(&session);
            FlowDone::new(self.handler.clone(), move || {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                if let Some(table) = table.upgrade() {
                    if table.remove_session(&key, &session) {
                        tracing::debug!(key = ?key, "flow finished");
                    }
                }
                if let Err(e) = session.close_with(CloseReason::HandlerFinished) {
                    tracing::debug!(key = ?key, error = %e, "write-back close failed");
                }
            })
        };

        let handler = self.handler.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = handler
                .new_flow(ctx, session, source, destination, done.clone())
                .await;
            done.done(result);
        });
    }
}

impl<K: Eq + Hash> std::fmt::Debug for NatService<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatService")
            .field("active_flows", &self.table.len())
            .field("config", &self.config)
            .finish()
    }
}
