//! The pool stage: owns every slot, the idle index, the retry buffer, and the
//! pool-wide embargo, and drives them from a single `tokio::spawn`ed task reached only
//! through [`crate::Pool::send`]. This is the "stage's single execution context" the
//! design calls for — every external completion (a connection attempt resolving, a
//! response arriving, a timer firing, a response entity finishing) is funnelled through
//! one of three channels read by [`run`]'s `select!` loop, so slot state is mutated from
//! exactly one place.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace, warn};

use crate::adapter::{self, AdapterEventKind, AdapterHandle, AdapterMessage};
use crate::config::PoolConfig;
use crate::connection::ConnectionFactory;
use crate::embargo::EmbargoController;
use crate::entity::EntityEvent;
use crate::error::{BodyError, PoolError};
use crate::request::{HttpRequest, HttpResponse, RequestContext, ResponseContext};
use crate::slot::{Effect, Slot, SlotEvent, SlotId, SlotState, TransitionCtx};

/// A request handed to [`crate::Pool::send`], paired with the private channel its
/// caller is waiting on. `T` is the caller's opaque correlation tag; it never
/// influences dispatch, only gets echoed back on the [`ResponseContext`].
pub(crate) struct Submission<T> {
    pub request: HttpRequest,
    pub tag: T,
    pub reply: oneshot::Sender<ResponseContext<T>>,
}

/// Glues a caller's opaque tag to the bookkeeping the stage needs to find the right
/// reply channel again after a retry moves a request to a different slot (or back
/// onto the retry buffer). Transparent to [`crate::slot`], which only ever clones and
/// carries it around.
struct Ticket<T> {
    serial: u64,
    tag: T,
}

impl<T: Clone> Clone for Ticket<T> {
    fn clone(&self) -> Self {
        Ticket {
            serial: self.serial,
            tag: self.tag.clone(),
        }
    }
}

/// Events that don't arrive via a connection adapter: timer firings and response-entity
/// lifecycle notifications. Kept free of `T` so spawning a timer or an entity forwarder
/// doesn't need to know the caller's tag type.
enum MiscEvent {
    SlotTimer(SlotId, u64),
    Entity(SlotId, u64, EntityEvent),
}

/// `disconnect_deadline` for a connection just established with a finite
/// `max_connection_lifetime`: `now + lifetime + jitter`, where
/// `jitter ∈ [0, max(lifetime/10, 2ms))`, per spec.md §4.7.
fn jittered_lifetime_deadline(now: Instant, lifetime: Duration) -> Instant {
    let bound = std::cmp::max(lifetime / 10, Duration::from_millis(2));
    let jitter = Duration::from_nanos(rand::thread_rng().gen_range(0..bound.as_nanos() as u64));
    now + lifetime + jitter
}

/// All mutable pool-wide state: the slots themselves, their live connections, the idle
/// index, the retry buffer, the embargo controller, and the map from request serial to
/// the caller's reply channel.
struct PoolState<F: ConnectionFactory, T> {
    config: Arc<PoolConfig>,
    factory: Arc<F>,
    slots: Vec<Slot<Ticket<T>>>,
    connections: Vec<Option<AdapterHandle>>,
    connect_tasks: Vec<Option<JoinHandle<()>>>,
    /// Bumped every time a slot opens or drops a connection, so a late [`AdapterMessage`]
    /// from a connection the slot has since abandoned is recognized and dropped.
    conn_epoch: Vec<u64>,
    idle_index: BTreeSet<SlotId>,
    retry_buffer: VecDeque<RequestContext<Ticket<T>>>,
    pending: HashMap<u64, oneshot::Sender<ResponseContext<T>>>,
    next_serial: u64,
    embargo: EmbargoController,
    kill_switches: HashMap<SlotId, crate::entity::KillSwitch>,
    adapter_tx: mpsc::UnboundedSender<AdapterMessage>,
    misc_tx: mpsc::UnboundedSender<MiscEvent>,
    /// Set when a slot's transition fixpoint overflows (`PoolError::TransitionLoopOverflow`).
    /// Checked by `run` after every event; once set the whole stage shuts down rather than
    /// resetting the one offending slot.
    fatal: bool,
}

impl<F, T> PoolState<F, T>
where
    F: ConnectionFactory,
    T: Clone + Send + 'static,
{
    fn new(
        config: Arc<PoolConfig>,
        factory: Arc<F>,
        adapter_tx: mpsc::UnboundedSender<AdapterMessage>,
        misc_tx: mpsc::UnboundedSender<MiscEvent>,
        now: Instant,
    ) -> Self {
        let n = config.max_connections as usize;
        let slots = (0..n).map(|i| Slot::new(SlotId(i as u32), now)).collect::<Vec<_>>();
        let idle_index = slots.iter().map(|s| s.id).collect();
        let embargo = EmbargoController::new(config.base_connection_backoff, config.max_connection_backoff);
        let mut state = PoolState {
            config,
            factory,
            slots,
            connections: (0..n).map(|_| None).collect(),
            connect_tasks: (0..n).map(|_| None).collect(),
            conn_epoch: vec![0; n],
            idle_index,
            retry_buffer: VecDeque::new(),
            pending: HashMap::new(),
            next_serial: 0,
            embargo,
            kill_switches: HashMap::new(),
            adapter_tx,
            misc_tx,
            fatal: false,
        };
        let warm = state.config.min_connections.min(state.config.max_connections);
        for i in 0..warm {
            state.dispatch_slot_event(SlotId(i), SlotEvent::PreConnect);
        }
        state
    }

    fn connected_count(&self) -> u32 {
        self.slots.iter().filter(|s| s.state.is_connected()).count() as u32
    }

    fn update_idle_membership(&mut self, slot_id: SlotId) {
        let idx = slot_id.0 as usize;
        if self.slots[idx].state.is_idle() {
            self.idle_index.insert(slot_id);
        } else {
            self.idle_index.remove(&slot_id);
        }
    }

    /// Drives one event through one slot's transition fixpoint, then executes whatever
    /// effects fall out. Does not itself drain the retry buffer — callers do that once
    /// per top-level event, after state has settled.
    ///
    /// A `TransitionLoopOverflow` is not a recoverable per-slot condition: it means the
    /// pure transition table is looping, which is a bug, not a transient per-connection
    /// failure. Rather than reset the one slot and carry on, this sets `self.fatal` so
    /// `run`'s loop shuts the whole stage down.
    fn dispatch_slot_event(&mut self, slot_id: SlotId, event: SlotEvent<Ticket<T>>) {
        let idx = slot_id.0 as usize;
        let now = Instant::now();
        let ctx = TransitionCtx {
            config: &self.config,
            embargo_level: self.embargo.current(),
            connected_count: self.connected_count(),
            min_connections: self.config.min_connections,
            now,
            disconnect_deadline: self.slots[idx].disconnect_deadline,
        };
        match self.slots[idx].apply(event, &ctx) {
            Ok(effects) => {
                self.update_idle_membership(slot_id);
                self.apply_effects(slot_id, effects);
            }
            Err(err) => {
                error!(slot = idx, %err, "internal invariant violated; shutting down the pool stage");
                self.fatal = true;
            }
        }
    }

    fn close_connection(&mut self, slot_id: SlotId, abort: bool) {
        let idx = slot_id.0 as usize;
        self.conn_epoch[idx] = self.conn_epoch[idx].wrapping_add(1);
        if let Some(task) = self.connect_tasks[idx].take() {
            task.abort();
        }
        if let Some(handle) = self.connections[idx].take() {
            if abort {
                handle.abort();
            } else {
                handle.shutdown();
            }
        }
        self.kill_switches.remove(&slot_id);
    }

    fn apply_effects(&mut self, slot_id: SlotId, effects: Vec<Effect<Ticket<T>>>) {
        for effect in effects {
            match effect {
                Effect::OpenConnection { request: _ } => {
                    let idx = slot_id.0 as usize;
                    self.conn_epoch[idx] = self.conn_epoch[idx].wrapping_add(1);
                    let epoch = self.conn_epoch[idx];
                    let task = adapter::spawn_connect(self.factory.clone(), slot_id, epoch, self.adapter_tx.clone());
                    self.connect_tasks[idx] = Some(task);
                }
                Effect::PushRequest(req) => {
                    let idx = slot_id.0 as usize;
                    let sent = self.connections[idx].as_ref().map(|h| h.send_request(req.request));
                    match sent {
                        Some(Ok(())) => {}
                        Some(Err(_)) | None => {
                            warn!(slot = idx, "no live connection to push request to; treating as connection failure");
                            self.dispatch_slot_event(slot_id, SlotEvent::ConnectionFailed(PoolError::ConnectionFailedAfterEstablished));
                        }
                    }
                }
                Effect::CloseConnection(reason) => {
                    match &reason {
                        Some(err) => warn!(slot = slot_id.0, %err, "closing connection"),
                        None => debug!(slot = slot_id.0, "closing idle connection"),
                    }
                    let abort = matches!(reason, Some(PoolError::PoolShutdown));
                    self.close_connection(slot_id, abort);
                }
                Effect::ArmTimer(d) => {
                    let idx = slot_id.0 as usize;
                    let generation = self.slots[idx].generation;
                    let tx = self.misc_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(d).await;
                        let _ = tx.send(MiscEvent::SlotTimer(slot_id, generation));
                    });
                }
                Effect::EmitResponse(req, result) => {
                    self.complete_request(req.tag.serial, req.tag.tag, result, Some(slot_id));
                }
                Effect::RequestFailed(req, err) => {
                    self.dispatch_response_result(req, Err(err), true);
                }
                Effect::RequestFailedNonRetryable(req, err) => {
                    self.dispatch_response_result(req, Err(err), false);
                }
                Effect::Requeue(req) => {
                    self.retry_buffer.push_front(req);
                }
                Effect::ReportConnectFailure { embargo_at_start } => {
                    if let Some(new_level) = self.embargo.on_connect_failed(embargo_at_start) {
                        warn!(embargo_ms = new_level.as_millis() as u64, "connection embargo escalated");
                        self.notify_embargo_change();
                    }
                }
                Effect::ReportConnectSuccess => {
                    if self.embargo.on_connect_succeeded().is_some() {
                        debug!("connection embargo reset after successful connect");
                        self.notify_embargo_change();
                    }
                }
                Effect::KillResponseEntity => {
                    if let Some(ks) = self.kill_switches.remove(&slot_id) {
                        ks.kill(BodyError("caller did not subscribe to the response entity in time".into()));
                    }
                }
                Effect::Followup(_) => {
                    unreachable!("Slot::apply drains Followup internally")
                }
            }
        }
    }

    /// Finalizes one request: removes its reply channel and sends the outcome. On
    /// success with a streamed body, wraps the entity so subscription/completion/kill
    /// events flow back into this slot before handing the response to the caller.
    fn complete_request(&mut self, serial: u64, tag: T, result: Result<HttpResponse, PoolError>, slot_id: Option<SlotId>) {
        let result = match result {
            Ok(mut response) if response.entity.is_streamed() => {
                if let Some(sid) = slot_id {
                    let idx = sid.0 as usize;
                    let generation = self.slots[idx].generation;
                    let (fwd_tx, mut fwd_rx) = futures_channel::mpsc::unbounded();
                    let misc_tx = self.misc_tx.clone();
                    tokio::spawn(async move {
                        while let Some(ev) = fwd_rx.next().await {
                            if misc_tx.send(MiscEvent::Entity(sid, generation, ev)).is_err() {
                                break;
                            }
                        }
                    });
                    let (entity, kill) = response.entity.instrumented(fwd_tx);
                    response.entity = entity;
                    if let Some(ks) = kill {
                        self.kill_switches.insert(sid, ks);
                    }
                }
                Ok(response)
            }
            other => other,
        };
        if let Some(reply) = self.pending.remove(&serial) {
            let _ = reply.send(ResponseContext { tag, outcome: result });
        }
    }

    /// The dispatcher decision: retry to the tail of the buffer if retries
    /// remain and the failure happened before the response was dispatched, else
    /// finalize the request as a failure.
    fn dispatch_response_result(&mut self, req: RequestContext<Ticket<T>>, result: Result<HttpResponse, PoolError>, retryable: bool) {
        let serial = req.tag.serial;
        let tag = req.tag.tag.clone();
        if retryable && result.is_err() {
            if let Some(retried) = req.into_retry() {
                debug!(retries_left = retried.retries_left, "retrying request on a new slot");
                self.retry_buffer.push_back(retried);
                return;
            }
        }
        self.complete_request(serial, tag, result, None);
    }

    fn notify_embargo_change(&mut self) {
        let ids: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Unconnected))
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.dispatch_slot_event(id, SlotEvent::NewConnectionEmbargo);
        }
    }

    /// Serves the head of the retry buffer from the lowest idle slot until one side or
    /// the other runs dry. Called once per top-level event, after state has settled.
    fn drain_retry_buffer(&mut self) {
        while !self.retry_buffer.is_empty() {
            let Some(&slot_id) = self.idle_index.iter().next() else {
                break;
            };
            let req = self.retry_buffer.pop_front().expect("checked non-empty above");
            self.dispatch_slot_event(slot_id, SlotEvent::NewRequest(req));
        }
    }

    fn on_new_request(&mut self, submission: Submission<T>) {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.pending.insert(serial, submission.reply);
        let req = RequestContext::new(
            submission.request,
            self.config.max_retries,
            Ticket {
                serial,
                tag: submission.tag,
            },
        );
        if let Some(&slot_id) = self.idle_index.iter().next() {
            self.dispatch_slot_event(slot_id, SlotEvent::NewRequest(req));
        } else {
            // The puller already spent the one unit of capacity this request consumed;
            // put it at the front so it's the very next thing served once a slot frees.
            self.retry_buffer.push_front(req);
        }
    }

    fn handle_adapter_message(&mut self, msg: AdapterMessage) {
        let AdapterMessage { slot_id, generation, kind } = msg;
        let idx = slot_id.0 as usize;
        if generation != self.conn_epoch[idx] {
            trace!(slot = idx, "dropping adapter message from an abandoned connection");
            return;
        }
        match kind {
            AdapterEventKind::Connected(handle) => {
                self.connections[idx] = Some(handle);
                if let Some(lifetime) = self.config.max_connection_lifetime {
                    self.slots[idx].disconnect_deadline = Some(jittered_lifetime_deadline(Instant::now(), lifetime));
                }
                self.dispatch_slot_event(slot_id, SlotEvent::ConnectionAttemptSucceeded);
            }
            AdapterEventKind::ConnectFailed(err) => {
                self.dispatch_slot_event(slot_id, SlotEvent::ConnectionAttemptFailed(err.classify()));
            }
            AdapterEventKind::ResponseReceived(res) => {
                self.dispatch_slot_event(slot_id, SlotEvent::ResponseReceived(res));
            }
            AdapterEventKind::RequestFailed(err) => {
                let classified = err.classify();
                let event = if classified == PoolError::RequestEntityStreamFailed {
                    SlotEvent::RequestEntityFailed(classified)
                } else {
                    SlotEvent::ConnectionFailed(classified)
                };
                self.dispatch_slot_event(slot_id, event);
            }
            AdapterEventKind::Closed(err) => {
                self.dispatch_slot_event(slot_id, SlotEvent::ConnectionFailed(err.classify()));
            }
        }
    }

    fn handle_misc_event(&mut self, ev: MiscEvent) {
        match ev {
            MiscEvent::SlotTimer(slot_id, generation) => {
                let idx = slot_id.0 as usize;
                if generation != self.slots[idx].generation {
                    trace!(slot = idx, "dropping stale timer firing");
                    return;
                }
                self.dispatch_slot_event(slot_id, SlotEvent::Timeout);
            }
            MiscEvent::Entity(slot_id, generation, ev) => {
                let idx = slot_id.0 as usize;
                if generation != self.slots[idx].generation {
                    trace!(slot = idx, "dropping stale response entity event");
                    return;
                }
                let event = match ev {
                    EntityEvent::Subscribed => SlotEvent::ResponseEntitySubscribed,
                    EntityEvent::Completed => SlotEvent::ResponseEntityCompleted,
                    EntityEvent::Failed(_) => SlotEvent::ResponseEntityFailed(PoolError::ResponseEntityStreamFailed),
                };
                self.dispatch_slot_event(slot_id, event);
            }
        }
    }

    fn begin_shutdown(&mut self) {
        let ids: Vec<SlotId> = self.slots.iter().map(|s| s.id).collect();
        for id in ids {
            self.dispatch_slot_event(id, SlotEvent::Shutdown);
        }
        while let Some(req) = self.retry_buffer.pop_front() {
            self.complete_request(req.tag.serial, req.tag.tag, Err(PoolError::PoolShutdown), None);
        }
    }

    fn all_quiesced(&self) -> bool {
        self.pending.is_empty() && self.slots.iter().all(|s| matches!(s.state, SlotState::Unconnected))
    }

    fn final_cleanup(&mut self) {
        for idx in 0..self.slots.len() {
            if let Some(handle) = self.connections[idx].take() {
                handle.abort();
            }
            if let Some(task) = self.connect_tasks[idx].take() {
                task.abort();
            }
        }
    }
}

/// The pool stage's main loop. Spawned once per [`crate::Pool`] and run until every
/// clone of the handle is dropped (closing `sub_rx`), at which point every slot is fed
/// `Shutdown` and any outstanding requests fail with [`PoolError::PoolShutdown`].
#[instrument(skip_all)]
pub(crate) async fn run<F, T>(config: Arc<PoolConfig>, factory: Arc<F>, mut sub_rx: mpsc::Receiver<Submission<T>>)
where
    F: ConnectionFactory,
    T: Clone + Send + 'static,
{
    let (adapter_tx, mut adapter_rx) = mpsc::unbounded_channel::<AdapterMessage>();
    let (misc_tx, mut misc_rx) = mpsc::unbounded_channel::<MiscEvent>();
    let now = Instant::now();
    let mut state = PoolState::new(config, factory, adapter_tx, misc_tx, now);
    let mut closing = false;

    loop {
        if closing {
            if state.all_quiesced() {
                break;
            }
            tokio::select! {
                Some(msg) = adapter_rx.recv() => state.handle_adapter_message(msg),
                Some(ev) = misc_rx.recv() => state.handle_misc_event(ev),
            }
        } else {
            let want_pull = !state.idle_index.is_empty() && state.retry_buffer.is_empty();
            tokio::select! {
                biased;
                Some(msg) = adapter_rx.recv() => state.handle_adapter_message(msg),
                Some(ev) = misc_rx.recv() => state.handle_misc_event(ev),
                maybe_sub = sub_rx.recv(), if want_pull => {
                    match maybe_sub {
                        Some(sub) => state.on_new_request(sub),
                        None => {
                            debug!("input closed; shutting down pool stage");
                            closing = true;
                            state.begin_shutdown();
                        }
                    }
                }
            }
        }
        state.drain_retry_buffer();
        if !closing && state.fatal {
            error!("transition loop overflow; shutting down the pool stage");
            closing = true;
            state.begin_shutdown();
        }
    }

    state.final_cleanup();
    debug!("pool stage stopped");
}
