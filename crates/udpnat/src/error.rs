//! Errors surfaced by a flow's virtual connection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NatError {
    /// The session was closed; nothing more will be read from it.
    #[error("connection closed")]
    Closed,

    /// The read deadline passed with no packet. The session is still open.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Only a read deadline is modelled.
    #[error("invalid argument")]
    InvalidArgument,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NatError {
    /// True when the same call may succeed later on this session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NatError::DeadlineExceeded)
    }
}

/// Why a session left the `live` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed explicitly through `NatSession::close`.
    Closed,
    /// Idle past the table's max age, or pushed out by capacity.
    Evicted,
    /// The handler's flow loop ended.
    HandlerFinished,
    /// The owning table was torn down.
    TableClosed,
    /// The submission context the session was created under was cancelled.
    ContextCancelled,
}
