//! Handler contract — what happens to a flow once the table has created it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::session::NatSession;

/// Receives each new flow exactly once.
///
/// The handler owns the flow from here on: it reads from the session,
/// writes replies through it, and returns when the flow is over. Returning
/// releases the flow; so does calling `done` earlier.
#[async_trait]
pub trait FlowHandler: Send + Sync + 'static {
    async fn new_flow(
        &self,
        ctx: CancellationToken,
        session: Arc<NatSession>,
        source: SocketAddr,
        destination: SocketAddr,
        done: FlowDone,
    ) -> anyhow::Result<()>;

    /// Error sink for failed flows. Never called on the dispatch path.
    fn flow_error(&self, error: anyhow::Error) {
        tracing::warn!(error = %format!("{error:#}"), "flow handler failed");
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Completion handle for one flow.
///
/// The first `done` removes the flow from the table and closes its session;
/// later calls only report their error. Dropping every clone without calling
/// `done` (a panicking handler, for one) releases the flow as well.
#[derive(Clone)]
pub struct FlowDone {
    inner: Arc<DoneState>,
}

struct DoneState {
    handler: Arc<dyn FlowHandler>,
    release: Mutex<Option<ReleaseFn>>,
}

impl FlowDone {
    pub(crate) fn new(handler: Arc<dyn FlowHandler>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(DoneState {
                handler,
                release: Mutex::new(Some(Box::new(release))),
            }),
        }
    }

    pub fn done(&self, result: anyhow::Result<()>) {
        if let Err(error) = result {
            self.inner.handler.flow_error(error);
        }
        self.inner.release();
    }

    pub fn is_done(&self) -> bool {
        match self.inner.release.lock() {
            Ok(release) => release.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl DoneState {
    fn release(&self) {
        let release = match self.release.lock() {
            Ok(mut release) => release.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(release) = release {
            release();
        }
    }
}

impl Drop for DoneState {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for FlowDone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDone")
            .field("done", &self.is_done())
            .finish()
    }
}
