//! The connection factory contract: the pool's one external collaborator
//! for actually talking to a host. HTTP wire parsing, TLS, and TCP are out of scope
//! and live entirely behind these two traits.

use async_trait::async_trait;

use crate::error::ConnectionError;
use crate::request::{HttpRequest, HttpResponse};

/// Produces connections to one host (one scheme + authority). A pool holds exactly one
/// factory for its entire lifetime.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type this factory produces.
    type Connection: HttpConnection;

    /// Attempts to establish a new connection. A factory that fails to establish a
    /// connection reports it here, as a failed future, rather than through any later
    /// in-stream error.
    async fn connect(&self) -> Result<Self::Connection, ConnectionError>;
}

/// A single established connection capable of sending one request at a time.
///
/// Collapses what could be a bidirectional request/response stream pair into
/// connect-then-pipeline-of-sends, which is equivalent as long as pipelining stays
/// sequential per connection (the only mode this crate supports).
#[async_trait]
pub trait HttpConnection: Send + 'static {
    /// Sends one request and awaits its response. Must not be called again until the
    /// previous call has resolved (the pool enforces `pipelining_limit` by construction:
    /// a slot occupies at most one request at a time).
    async fn send_request(&mut self, request: HttpRequest) -> Result<HttpResponse, ConnectionError>;

    /// Resolves when the connection fails or is closed by the peer independent of any
    /// particular request (e.g. observed while idle). A connection that is never closed
    /// by the peer should leave this pending forever; it is only ever raced against other
    /// events by the pool, never polled to completion on its own.
    async fn wait_closed(&mut self) -> ConnectionError;

    /// Closes the connection. Best-effort; errors are not surfaced. Called at most once
    /// per connection.
    async fn shutdown(self: Box<Self>);
}
