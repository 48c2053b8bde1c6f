//! Request/response entity (body) stand-ins, and the instrumentation that lets the pool
//! observe subscription, completion, and failure of a streamed body without owning it
//! without owning it.
//!
//! A body is either statically known to be empty (`Empty`), fully buffered (`Strict`), or
//! a live stream. Strict and empty bodies never need instrumentation: the driver
//! synthesizes the subscribed/completed events immediately. Streamed
//! bodies are wrapped so that polling them reports lifecycle events back to the slot that
//! produced them, modeled after the `Poolable`/reservation wrapping pattern used by
//! `hyper-util`'s legacy pool for pooled resources the caller consumes independently of
//! the pool's own bookkeeping.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_channel::{mpsc, oneshot};
use futures_core::Stream;

use crate::error::BodyError;

/// One chunk of a body stream.
pub type BodyChunk = Result<Bytes, BodyError>;
type BoxBodyStream = Pin<Box<dyn Stream<Item = BodyChunk> + Send>>;

/// An externally triggerable abort for an in-progress response entity stream
/// Held by the pool so a subscription timeout
/// (§4.2 `WaitingForResponseEntitySubscription`) can abort a body the caller never
/// subscribed to.
pub struct KillSwitch {
    tx: Option<oneshot::Sender<BodyError>>,
}

impl KillSwitch {
    /// Aborts the stream with `reason`. A no-op if the stream already completed or was
    /// already killed.
    pub fn kill(mut self, reason: BodyError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(reason);
        }
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("armed", &self.tx.is_some())
            .finish()
    }
}

/// Lifecycle events an instrumented body reports back to the slot that owns it.
#[derive(Debug, Clone)]
pub enum EntityEvent {
    /// The caller polled the stream for the first time.
    Subscribed,
    /// The stream ended (successfully or via the kill-switch).
    Completed,
    /// The stream produced an error, or was killed.
    Failed(BodyError),
}

/// A request body. Streamed bodies are instrumented so the slot learns when the
/// caller-supplied body finishes sending or fails mid-send.
pub enum RequestEntity {
    Empty,
    Strict(Bytes),
    Streamed(BoxBodyStream),
}

impl RequestEntity {
    /// Whether this body is statically known to carry no bytes; such bodies short-circuit
    /// the completion event because no stream exists to drive it.
    pub fn is_known_empty(&self) -> bool {
        match self {
            RequestEntity::Empty => true,
            RequestEntity::Strict(b) => b.is_empty(),
            RequestEntity::Streamed(_) => false,
        }
    }

    /// Wraps a streamed body so that, as the connection drains it, `Completed`/`Failed`
    /// events are reported on `events`. No-op for `Empty`/`Strict` bodies.
    pub fn instrumented(self, events: mpsc::UnboundedSender<EntityEvent>) -> Self {
        match self {
            RequestEntity::Streamed(inner) => RequestEntity::Streamed(Box::pin(InstrumentedBody {
                inner,
                events,
                report_subscribe: false,
                kill_rx: None,
                done: false,
            })),
            other => other,
        }
    }
}

impl std::fmt::Debug for RequestEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestEntity::Empty => write!(f, "RequestEntity::Empty"),
            RequestEntity::Strict(b) => write!(f, "RequestEntity::Strict({} bytes)", b.len()),
            RequestEntity::Streamed(_) => write!(f, "RequestEntity::Streamed(..)"),
        }
    }
}

impl Clone for RequestEntity {
    fn clone(&self) -> Self {
        match self {
            RequestEntity::Empty => RequestEntity::Empty,
            RequestEntity::Strict(b) => RequestEntity::Strict(b.clone()),
            // A live stream has no meaningful clone; tests that need to clone a
            // `HttpRequest` carrying a streamed body don't exist, but `RequestContext`
            // derives `Clone` for convenience (e.g. logging), so we degrade gracefully.
            RequestEntity::Streamed(_) => RequestEntity::Empty,
        }
    }
}

/// A response body, with the same statically-known-empty short circuit as
/// [`RequestEntity`], plus a kill-switch for streamed bodies.
pub enum ResponseEntity {
    Empty,
    Strict(Bytes),
    Streamed(BoxBodyStream),
}

impl ResponseEntity {
    pub fn is_known_empty(&self) -> bool {
        match self {
            ResponseEntity::Empty => true,
            ResponseEntity::Strict(b) => b.is_empty(),
            ResponseEntity::Streamed(_) => false,
        }
    }

    /// Whether this body is a live stream the caller must subscribe to and drain.
    /// `Empty`/`Strict` bodies are already fully in the caller's hands the moment the
    /// response is dispatched, so they need no subscription/completion tracking.
    pub fn is_streamed(&self) -> bool {
        matches!(self, ResponseEntity::Streamed(_))
    }

    /// Wraps a streamed body, reporting `Subscribed`/`Completed`/`Failed` on `events`,
    /// and returns the [`KillSwitch`] the pool should hold to abort it on a subscription
    /// timeout. No-op (returns `None`) for `Empty`/`Strict` bodies.
    pub fn instrumented(self, events: mpsc::UnboundedSender<EntityEvent>) -> (Self, Option<KillSwitch>) {
        match self {
            ResponseEntity::Streamed(inner) => {
                let (kill_tx, kill_rx) = oneshot::channel();
                let wrapped = InstrumentedBody {
                    inner,
                    events,
                    report_subscribe: true,
                    kill_rx: Some(kill_rx),
                    done: false,
                };
                (
                    ResponseEntity::Streamed(Box::pin(wrapped)),
                    Some(KillSwitch { tx: Some(kill_tx) }),
                )
            }
            other => (other, None),
        }
    }
}

impl std::fmt::Debug for ResponseEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseEntity::Empty => write!(f, "ResponseEntity::Empty"),
            ResponseEntity::Strict(b) => write!(f, "ResponseEntity::Strict({} bytes)", b.len()),
            ResponseEntity::Streamed(_) => write!(f, "ResponseEntity::Streamed(..)"),
        }
    }
}

impl Clone for ResponseEntity {
    fn clone(&self) -> Self {
        match self {
            ResponseEntity::Empty => ResponseEntity::Empty,
            ResponseEntity::Strict(b) => ResponseEntity::Strict(b.clone()),
            ResponseEntity::Streamed(_) => ResponseEntity::Empty,
        }
    }
}

/// The shared instrumentation wrapper backing both [`RequestEntity::Streamed`] and
/// [`ResponseEntity::Streamed`] once instrumented. `kill_rx`/`report_subscribe` are only
/// ever populated for response bodies; request bodies have no subscription concept or
/// kill-switch; request bodies have no subscription concept to arm one for.
struct InstrumentedBody {
    inner: BoxBodyStream,
    events: mpsc::UnboundedSender<EntityEvent>,
    report_subscribe: bool,
    kill_rx: Option<oneshot::Receiver<BodyError>>,
    done: bool,
}

// `inner` is a `Pin<Box<_>>`, which is `Unpin` regardless of the pointee, and every other
// field is `Unpin`, so `InstrumentedBody` is `Unpin` and plain `&mut` projection is sound.
impl Stream for InstrumentedBody {
    type Item = BodyChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.report_subscribe {
            this.report_subscribe = false;
            let _ = this.events.unbounded_send(EntityEvent::Subscribed);
        }
        if let Some(kill_rx) = this.kill_rx.as_mut() {
            if let Poll::Ready(Ok(reason)) = Pin::new(kill_rx).poll(cx) {
                this.done = true;
                let _ = this.events.unbounded_send(EntityEvent::Failed(reason.clone()));
                return Poll::Ready(Some(Err(reason)));
            }
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.done = true;
                let _ = this.events.unbounded_send(EntityEvent::Completed);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                let _ = this.events.unbounded_send(EntityEvent::Failed(e.clone()));
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}
