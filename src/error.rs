//! Error types for the host connection pool.
//!
//! `ConnectionError` is what a [`ConnectionFactory`](crate::connection::ConnectionFactory)
//! or [`HttpConnection`](crate::connection::HttpConnection) implementation returns; it
//! carries the original cause for logging. `PoolError` is what callers of the pool see —
//! a small, `Clone`-able classification that the slot state machine reasons about directly,
//! matching the error kinds enumerated in the design (connect failures, mid-stream
//! failures, subscription timeouts, and pool shutdown).

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// An opaque, boxed cause, so `ConnectionFactory`/`HttpConnection` implementors can use
/// whatever error type their transport produces.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors produced by a connection factory or an established connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The factory's establishment attempt failed before any bytes were exchanged.
    #[error("connection attempt failed: {0}")]
    ConnectFailed(#[source] BoxError),
    /// A live connection failed (reset, I/O error, unexpected close) after being established.
    #[error("connection failed after being established: {0}")]
    FailedAfterEstablished(#[source] BoxError),
    /// The connection was closed cleanly by the peer while the slot still considered
    /// it live (e.g. observed while idle).
    #[error("connection closed by peer")]
    ClosedByPeer,
    /// The caller's request body failed mid-send.
    #[error("request entity stream failed: {0}")]
    RequestEntityFailed(#[source] BoxError),
    /// The response body failed mid-receive.
    #[error("response entity stream failed: {0}")]
    ResponseEntityFailed(#[source] BoxError),
}

impl ConnectionError {
    /// Classifies this error as the [`PoolError`] a caller or the state machine should see.
    pub fn classify(&self) -> PoolError {
        match self {
            ConnectionError::ConnectFailed(_) => PoolError::ConnectAttemptFailed,
            ConnectionError::FailedAfterEstablished(_) | ConnectionError::ClosedByPeer => {
                PoolError::ConnectionFailedAfterEstablished
            }
            ConnectionError::RequestEntityFailed(_) => PoolError::RequestEntityStreamFailed,
            ConnectionError::ResponseEntityFailed(_) => PoolError::ResponseEntityStreamFailed,
        }
    }
}

/// Errors a caller of the pool may observe for a single request, or that the slot state
/// machine uses internally to decide retry/close behavior.
///
/// Kept small and `Clone` so the pure state-transition functions in [`crate::slot`] can
/// carry it around without reference to the original (non-`Clone`) cause; the cause itself
/// is logged via `tracing` at the point the `ConnectionError` is classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The factory's establishment future failed.
    #[error("connection attempt failed")]
    ConnectAttemptFailed,
    /// A stream error from a connection that had already been established.
    #[error("connection failed after being established")]
    ConnectionFailedAfterEstablished,
    /// The response entity stream failed; surfaced to the caller through the entity
    /// stream itself, and used by the slot to decide to abort the connection.
    #[error("response entity stream failed")]
    ResponseEntityStreamFailed,
    /// The caller's request body failed mid-send. Never retried: the server may already
    /// have received a partial request.
    #[error("request entity stream failed")]
    RequestEntityStreamFailed,
    /// The caller did not subscribe to (or drain) the response entity within
    /// `response_entity_subscription_timeout`.
    #[error("caller did not subscribe to the response entity in time")]
    SubscriptionTimeout,
    /// The pool was shut down with this request still outstanding.
    #[error("pool was shut down")]
    PoolShutdown,
    /// Internal invariant violation: a single external event caused more transitions
    /// than the fixpoint bound allows. This forces the whole pool to shut down, since it
    /// indicates a bug rather than a recoverable per-slot condition.
    #[error("internal pool invariant violated: transition loop overflow in slot {0}")]
    TransitionLoopOverflow(u32),
}

impl From<ConnectionError> for PoolError {
    fn from(err: ConnectionError) -> Self {
        err.classify()
    }
}

/// A simple string-carrying error for the entity stream stand-ins in [`crate::entity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyError(pub String);

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body stream error: {}", self.0)
    }
}

impl StdError for BodyError {}
