//! A bounded, single-host async HTTP connection pool.
//!
//! [`Pool`] multiplexes an unbounded stream of `(HttpRequest, tag)` submissions across
//! at most [`PoolConfig::max_connections`] concurrent connections to one host, produced
//! by a caller-supplied [`ConnectionFactory`]. Each submission gets back exactly one
//! [`ResponseContext`], carrying whatever opaque tag the caller handed in, whether the
//! request ultimately succeeded, was retried and then succeeded, or exhausted its
//! retries.
//!
//! This crate does not parse HTTP, speak TLS, or open sockets — those live entirely
//! behind [`ConnectionFactory`]/[`HttpConnection`]. It owns the hard part: slot
//! lifecycle, request/response pairing, retries, connection-failure backoff
//! (`EmbargoController`), idle/lifetime recycling, and minimum-warm-connections
//! maintenance. Fanning a client's traffic out across multiple hosts (by scheme +
//! authority) is a thin `HashMap<Authority, Pool<F, T>>` wrapper left to the caller;
//! this crate manages exactly one host.
//!
//! ```no_run
//! use host_pool::{ConnectionFactory, HttpConnection, HttpRequest, Pool, PoolConfigBuilder};
//! # async fn docs<F: ConnectionFactory>(factory: F) {
//! let pool = Pool::new(factory, PoolConfigBuilder::new().max_connections(8).build());
//! let response = pool.send(HttpRequest::new("GET", "/"), 42u64).await;
//! # }
//! ```

#![warn(missing_docs, missing_debug_implementations)]

pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod request;

mod adapter;
mod embargo;
mod pool;
mod slot;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use connection::{ConnectionFactory, HttpConnection};
pub use entity::{BodyChunk, EntityEvent, KillSwitch, RequestEntity, ResponseEntity};
pub use error::{BodyError, ConnectionError, PoolError};
pub use request::{HttpRequest, HttpResponse, RequestContext, ResponseContext};

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use pool::Submission;

/// A handle to a running host connection pool. Cheaply `Clone`-able; every clone
/// shares the same underlying stage task and slot set. The stage task runs until the
/// last `Pool` handle (and every clone of it) is dropped, at which point every slot is
/// shut down and any requests still in flight fail with [`PoolError::PoolShutdown`].
pub struct Pool<F: ConnectionFactory, T> {
    sub_tx: mpsc::Sender<Submission<T>>,
    _factory: PhantomData<fn() -> F>,
}

impl<F: ConnectionFactory, T> Clone for Pool<F, T> {
    fn clone(&self) -> Self {
        Pool {
            sub_tx: self.sub_tx.clone(),
            _factory: PhantomData,
        }
    }
}

impl<F: ConnectionFactory, T> fmt::Debug for Pool<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("max_open_requests", &self.sub_tx.max_capacity())
            .finish()
    }
}

impl<F, T> Pool<F, T>
where
    F: ConnectionFactory,
    T: Clone + Send + 'static,
{
    /// Spawns a new pool stage for `factory`, bound by `config`. The stage task runs on
    /// the current Tokio runtime until every [`Pool`] handle referring to it is dropped.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let config = Arc::new(config);
        let factory = Arc::new(factory);
        let (sub_tx, sub_rx) = mpsc::channel(config.max_open_requests);
        tokio::spawn(pool::run(config, factory, sub_rx));
        Pool {
            sub_tx,
            _factory: PhantomData,
        }
    }

    /// Submits `request` for dispatch, tagged with the caller-supplied `tag`, and
    /// awaits the paired response.
    ///
    /// On success, the response's entity (if any, and if not statically empty) is
    /// caller-owned: it must be subscribed to (polled at least once) and drained within
    /// [`PoolConfig::response_entity_subscription_timeout`], or the slot serving it
    /// aborts the stream and reclaims the connection.
    ///
    /// If every [`Pool`] handle for this stage has already been dropped, resolves
    /// immediately with [`PoolError::PoolShutdown`].
    ///
    /// Returns a `'static` future that holds only a cloned sender, not a borrow of
    /// `self` — so a caller's in-flight `send` is never what keeps the pool's stage
    /// alive; it is dropping every [`Pool`] *handle* that triggers shutdown.
    pub fn send(&self, request: HttpRequest, tag: T) -> impl std::future::Future<Output = ResponseContext<T>> + 'static
    where
        T: 'static,
    {
        use tracing::Instrument;
        let span = tracing::info_span!("pool_send", method = %request.method, uri = %request.uri);
        let tx = self.sub_tx.clone();
        async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            let submission = Submission {
                request,
                tag: tag.clone(),
                reply: reply_tx,
            };
            if tx.send(submission).await.is_err() {
                return ResponseContext {
                    tag,
                    outcome: Err(PoolError::PoolShutdown),
                };
            }
            reply_rx.await.unwrap_or(ResponseContext {
                tag,
                outcome: Err(PoolError::PoolShutdown),
            })
        }
        .instrument(span)
    }
}
