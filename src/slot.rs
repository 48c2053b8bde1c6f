//! The per-slot state machine: a pure, total function from
//! `(SlotState, Event)` to a new `SlotState` plus a list of [`Effect`]s for the driver
//! (in `pool.rs`) to carry out. Kept free of any actual I/O or async so it can be
//! unit-tested directly without an async executor.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::request::{HttpResponse, RequestContext};

/// A dense slot identifier, `0 .. max_connections`. Orders so the lowest id is preferred
/// by the idle index, so lower ids see more traffic and higher ids get the chance to idle out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u32);

/// The fixpoint bound on synthesized follow-up transitions per external event
/// here. Exceeding it is treated as an internal bug, not a recoverable
/// per-slot condition, and forces the whole pool to shut down.
pub const MAX_TRANSITIONS_PER_EVENT: u32 = 10;

/// Per-slot state. The payload each variant carries is
/// exactly what that state needs: the request in flight, the response pending dispatch,
/// or the failure to report on close.
#[derive(Debug)]
pub enum SlotState<T> {
    /// No connection, not attempting one. The only state a slot is *created* in; never
    /// transitioned to directly except by the driver completing an actual close.
    Unconnected,
    /// Opening a connection to maintain `min_connections`, not serving a request.
    /// Carries the embargo level observed when the attempt began, so the embargo
    /// controller can tell a stale attempt's failure from the one that should actually
    /// escalate it.
    PreConnecting { embargo_at_start: Duration },
    /// Opening a connection to serve `request` (or, if `request` is `None`, a preconnect
    /// that raced with this slot being picked for a pending request).
    Connecting {
        request: Option<RequestContext<T>>,
        embargo_at_start: Duration,
    },
    /// Connected, no outstanding request.
    Idle,
    /// Transient: about to hand `request` to the connection. Always immediately
    /// followed by `RequestDispatched`.
    PushingRequestToConnection(RequestContext<T>),
    /// Connected, request sent, awaiting the response.
    WaitingForResponse(RequestContext<T>),
    /// The response has arrived and is queued for the caller; always immediately
    /// followed by `ResponseDispatchable` in this implementation (see `pool.rs`'s doc
    /// comment on why "downstream demand" is always satisfied here).
    WaitingForResponseDispatch(RequestContext<T>, HttpResponse),
    /// The response has been handed to the caller; waiting for them to start consuming
    /// the entity (or for the subscription timeout to fire).
    WaitingForResponseEntitySubscription {
        request: RequestContext<T>,
        close_after: bool,
    },
    /// The caller is draining the entity; waiting for it to finish (or fail).
    WaitingForEndOfResponseEntity {
        request: RequestContext<T>,
        close_after: bool,
    },
    /// Transient: the driver closes the live connection (reporting `reason` as the
    /// connection-level failure, if any) and re-enters `Unconnected`.
    ToBeClosed(Option<PoolError>),
    /// Carries a hard failure that could not be attributed to a specific in-flight
    /// request; the driver's error-isolation path resets from here.
    Failed(PoolError),
    /// Unconnected, under an active embargo; `stateTimeout` is the remaining embargo
    /// wait, already jittered by the embargo controller.
    OutOfEmbargo(Duration),
}

impl<T> SlotState<T> {
    /// A slot is idle iff this reports `true` (the `Unconnected`-under-embargo
    /// carve-out is handled by the driver, since it needs the pool-wide embargo level).
    ///
    /// `PreConnecting`/`Connecting { request: None, .. }` count toward `min_connections`
    /// bookkeeping (see `is_connected`) but are deliberately excluded here: a connect
    /// attempt in flight is not yet accepting requests, so the dispatcher must leave a
    /// pending request in the retry buffer rather than route it to a slot with nowhere
    /// to put it.
    pub fn is_idle(&self) -> bool {
        matches!(self, SlotState::Unconnected | SlotState::Idle)
    }

    /// Whether this slot currently counts toward `min_connections`/`max_connections`
    /// "connected" bookkeeping.
    pub fn is_connected(&self) -> bool {
        !matches!(
            self,
            SlotState::Unconnected | SlotState::OutOfEmbargo(_) | SlotState::Failed(_)
        )
    }

    /// The state-declared timeout, if any.
    pub fn state_timeout(&self, cfg: &PoolConfig) -> Option<Duration> {
        match self {
            SlotState::Idle => cfg.idle_timeout,
            SlotState::WaitingForResponse(_) => Some(cfg.response_timeout),
            SlotState::WaitingForResponseEntitySubscription { .. } => {
                Some(cfg.response_entity_subscription_timeout)
            }
            SlotState::OutOfEmbargo(wait) => Some(*wait),
            _ => None,
        }
    }

    /// If this state wants the live connection closed, the failure to report (if any).
    /// `Unconnected` is reached only through this path.
    fn should_close_connection(&self) -> Option<Option<PoolError>> {
        match self {
            SlotState::ToBeClosed(reason) => Some(reason.clone()),
            SlotState::Failed(reason) => Some(Some(reason.clone())),
            _ => None,
        }
    }
}

/// Events the driver feeds into a slot, plus `NewConnectionEmbargo`, used to wake an
/// otherwise-untouched idle slot when the pool-wide embargo changes.
#[derive(Debug)]
pub enum SlotEvent<T> {
    PreConnect,
    ConnectionAttemptSucceeded,
    ConnectionAttemptFailed(PoolError),
    NewConnectionEmbargo,
    NewRequest(RequestContext<T>),
    RequestDispatched,
    RequestEntityFailed(PoolError),
    ResponseReceived(HttpResponse),
    ResponseDispatchable,
    ResponseEntitySubscribed,
    ResponseEntityCompleted,
    ResponseEntityFailed(PoolError),
    ConnectionCompleted,
    ConnectionFailed(PoolError),
    Timeout,
    Shutdown,
}

/// Instructions the pure transition function hands back to the driver. Anything the
/// driver must actually *do* (open a connection, push bytes, arm a timer) is an effect;
/// `Followup` is the one exception, consumed internally by [`Slot::apply`]'s fixpoint
/// loop rather than ever reaching `pool.rs`.
pub enum Effect<T> {
    /// Open a new connection for this slot (a request-driven connect if `Some`, a
    /// preconnect if `None`).
    OpenConnection { request: Option<RequestContext<T>> },
    /// Hand `request` to the slot's current connection.
    PushRequest(RequestContext<T>),
    /// Close the slot's current connection, reporting `reason` as the cause if any.
    CloseConnection(Option<PoolError>),
    /// Arm a timer that fires `Timeout` after `Duration`, tagged with the slot's current
    /// generation so a stale firing is ignored.
    ArmTimer(Duration),
    /// The response is ready for the caller; hand it off now (our oneshot-per-request
    /// output model treats "downstream demand" as always satisfied — see `pool.rs`).
    EmitResponse(RequestContext<T>, Result<HttpResponse, PoolError>),
    /// A request failed before a response was ever dispatched; the dispatcher (in
    /// `pool.rs`) decides whether to retry it or surface the failure.
    RequestFailed(RequestContext<T>, PoolError),
    /// Same as `RequestFailed`, but never retried regardless of `retries_left`
    /// since a request-entity failure may have left a partial request on the wire.
    RequestFailedNonRetryable(RequestContext<T>, PoolError),
    /// Hand the request back to the dispatcher to try on a different slot, without
    /// spending any of `retries_left`: this slot never actually attempted anything.
    Requeue(RequestContext<T>),
    /// A connection attempt failed; report it to the pool-wide embargo controller, using
    /// the embargo level this attempt began at.
    ReportConnectFailure { embargo_at_start: Duration },
    /// A connection attempt succeeded; reset the pool-wide embargo.
    ReportConnectSuccess,
    /// Trigger the response entity's kill-switch (subscription timeout).
    KillResponseEntity,
    /// Re-synthesize `event` against this same slot, immediately, as part of the bounded
    /// fixpoint of internally-synthesized follow-up events. Never escapes `apply`.
    Followup(SlotEvent<T>),
}

/// Read-only, pool-wide context a slot needs to decide embargo/preconnect follow-ups
/// (the embargo and preconnect follow-ups depend on pool-wide
/// state no single slot owns) plus the handful of per-slot values the pure transition
/// function needs but that live on `Slot` itself (kept out of `SlotState` so state
/// variants stay minimal).
pub struct TransitionCtx<'a> {
    pub config: &'a PoolConfig,
    pub embargo_level: Duration,
    pub connected_count: u32,
    pub min_connections: u32,
    pub now: Instant,
    /// This slot's `disconnect_deadline`, consulted when a response is
    /// dispatched to decide `close_after`.
    pub disconnect_deadline: Option<Instant>,
}

/// A slot: one execution context bound to at most one connection, processing at most
/// one request at a time.
pub struct Slot<T> {
    pub id: SlotId,
    pub state: SlotState<T>,
    pub changed_into_state_at: Instant,
    /// Bumped on every transition so a timer armed against a stale state is ignored
    /// against a now-stale state.
    pub generation: u64,
    /// Set when a connection with a finite `max_connection_lifetime` is established;
    /// consulted when the response is dispatched.
    pub disconnect_deadline: Option<Instant>,
}

impl<T> Slot<T> {
    pub fn new(id: SlotId, now: Instant) -> Self {
        Slot {
            id,
            state: SlotState::Unconnected,
            changed_into_state_at: now,
            generation: 0,
            disconnect_deadline: None,
        }
    }

    /// Drives the bounded transition fixpoint for one external `event`. Returns the
    /// effects the caller (`pool.rs`) must perform, in the order they were produced, or
    /// `PoolError::TransitionLoopOverflow` if the fixpoint didn't settle within
    /// [`MAX_TRANSITIONS_PER_EVENT`] iterations.
    pub fn apply(&mut self, event: SlotEvent<T>, ctx: &TransitionCtx<'_>) -> Result<Vec<Effect<T>>, PoolError>
    where
        T: Clone,
    {
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(event);
        let mut iterations = 0u32;
        while let Some(ev) = queue.pop_front() {
            iterations += 1;
            if iterations > MAX_TRANSITIONS_PER_EVENT {
                return Err(PoolError::TransitionLoopOverflow(self.id.0));
            }
            for effect in self.apply_one(ev, ctx) {
                match effect {
                    Effect::Followup(next) => queue.push_back(next),
                    other => out.push(other),
                }
            }
        }
        Ok(out)
    }

    /// One step of the driver: cancel the old timer (implicit — the generation bump
    /// below invalidates it), transition, perform the generic close/idle/timer
    /// bookkeeping, and synthesize the pool-wide-context-dependent follow-ups.
    fn apply_one(&mut self, event: SlotEvent<T>, ctx: &TransitionCtx<'_>) -> Vec<Effect<T>>
    where
        T: Clone,
    {
        self.generation += 1;
        let prev = std::mem::replace(&mut self.state, SlotState::Unconnected);
        let (mut next, mut effects) = transition(prev, event, ctx);

        if let Some(reason) = next.should_close_connection() {
            effects.push(Effect::CloseConnection(reason));
            next = SlotState::Unconnected;
            self.disconnect_deadline = None;
        }

        if matches!(next, SlotState::Unconnected) {
            if !ctx.embargo_level.is_zero() {
                next = SlotState::OutOfEmbargo(crate::embargo::EmbargoController::jittered_wait(ctx.embargo_level));
            } else if ctx.connected_count < ctx.min_connections {
                effects.push(Effect::Followup(SlotEvent::PreConnect));
            }
        }

        if let Some(d) = next.state_timeout(ctx.config) {
            effects.push(Effect::ArmTimer(d));
        }

        self.changed_into_state_at = ctx.now;
        self.state = next;
        effects
    }
}

/// The pure per-(state, event) transition table, encoding each state's contracts.
/// Returns the next state and any effects *other* than the generic close/idle/timer
/// bookkeeping `apply_one` layers on afterward.
fn transition<T: Clone>(state: SlotState<T>, event: SlotEvent<T>, ctx: &TransitionCtx<'_>) -> (SlotState<T>, Vec<Effect<T>>) {
    use SlotEvent::*;
    use SlotState::*;

    match (state, event) {
        // -- Unconnected --------------------------------------------------------
        (Unconnected, NewRequest(req)) => (
            Connecting {
                request: Some(req.clone()),
                embargo_at_start: ctx.embargo_level,
            },
            vec![Effect::OpenConnection { request: Some(req) }],
        ),
        (Unconnected, PreConnect) => (
            PreConnecting {
                embargo_at_start: ctx.embargo_level,
            },
            vec![Effect::OpenConnection { request: None }],
        ),
        (Unconnected, NewConnectionEmbargo) => (Unconnected, vec![]),
        (Unconnected, Shutdown) => (Unconnected, vec![]),

        // -- OutOfEmbargo --------------------------------------------------------
        (OutOfEmbargo(_), Timeout) => (Unconnected, vec![]),
        (OutOfEmbargo(wait), NewRequest(req)) => {
            // Embargoed: don't connect through the cooldown. The dispatcher shouldn't
            // normally route here (an embargoed slot isn't in the available set), but
            // handle it defensively by bouncing the request back unharmed.
            (OutOfEmbargo(wait), vec![Effect::Requeue(req)])
        }
        (OutOfEmbargo(_), Shutdown) => (ToBeClosed(None), vec![]),

        // -- PreConnecting / Connecting ------------------------------------------
        (PreConnecting { .. }, ConnectionAttemptSucceeded) => (Idle, vec![Effect::ReportConnectSuccess]),
        (PreConnecting { embargo_at_start }, ConnectionAttemptFailed(err)) => (
            ToBeClosed(Some(err)),
            vec![Effect::ReportConnectFailure { embargo_at_start }],
        ),
        (PreConnecting { .. }, Shutdown) => (ToBeClosed(Some(PoolError::PoolShutdown)), vec![]),

        (Connecting { request: Some(req), .. }, ConnectionAttemptSucceeded) => (
            PushingRequestToConnection(req.clone()),
            vec![
                Effect::ReportConnectSuccess,
                Effect::PushRequest(req),
                Effect::Followup(RequestDispatched),
            ],
        ),
        (Connecting { request: None, .. }, ConnectionAttemptSucceeded) => {
            (Idle, vec![Effect::ReportConnectSuccess])
        }
        (Connecting { request, embargo_at_start }, ConnectionAttemptFailed(err)) => {
            let mut effects = vec![Effect::ReportConnectFailure { embargo_at_start }];
            if let Some(req) = request {
                effects.push(Effect::RequestFailed(req, err.clone()));
            }
            (ToBeClosed(Some(err)), effects)
        }
        (Connecting { request, .. }, Shutdown) => {
            let mut effects = Vec::new();
            if let Some(req) = request {
                effects.push(Effect::RequestFailed(req, PoolError::PoolShutdown));
            }
            (ToBeClosed(Some(PoolError::PoolShutdown)), effects)
        }

        // -- Idle -----------------------------------------------------------------
        (Idle, NewRequest(req)) => (
            PushingRequestToConnection(req.clone()),
            vec![Effect::PushRequest(req), Effect::Followup(RequestDispatched)],
        ),
        (Idle, Timeout) => {
            if ctx.connected_count > ctx.min_connections {
                (ToBeClosed(None), vec![])
            } else {
                // At or below the floor min_connections is trying to maintain: stay
                // idle. `apply_one` re-arms the idle timer since `Idle` still declares
                // one, so a connection held to satisfy the minimum never idle-times-out.
                (Idle, vec![])
            }
        }
        (Idle, ConnectionCompleted) => (ToBeClosed(None), vec![]),
        (Idle, ConnectionFailed(err)) => (ToBeClosed(Some(err)), vec![]),
        (Idle, Shutdown) => (ToBeClosed(Some(PoolError::PoolShutdown)), vec![]),

        // -- PushingRequestToConnection --------------------------------------------
        (PushingRequestToConnection(req), RequestDispatched) => (WaitingForResponse(req), vec![]),
        (PushingRequestToConnection(req), Shutdown) => (
            ToBeClosed(Some(PoolError::PoolShutdown)),
            vec![Effect::RequestFailed(req, PoolError::PoolShutdown)],
        ),

        // -- WaitingForResponse ------------------------------------------------------
        (WaitingForResponse(req), ResponseReceived(res)) => (
            WaitingForResponseDispatch(req, res),
            vec![Effect::Followup(ResponseDispatchable)],
        ),
        (WaitingForResponse(req), Timeout) => (
            ToBeClosed(Some(PoolError::ConnectionFailedAfterEstablished)),
            vec![Effect::RequestFailed(req, PoolError::ConnectionFailedAfterEstablished)],
        ),
        (WaitingForResponse(req), ConnectionFailed(err)) => {
            (ToBeClosed(Some(err.clone())), vec![Effect::RequestFailed(req, err)])
        }
        (WaitingForResponse(req), ConnectionCompleted) => (
            ToBeClosed(Some(PoolError::ConnectionFailedAfterEstablished)),
            vec![Effect::RequestFailed(req, PoolError::ConnectionFailedAfterEstablished)],
        ),
        (WaitingForResponse(req), RequestEntityFailed(err)) => (
            ToBeClosed(Some(err.clone())),
            vec![Effect::RequestFailedNonRetryable(req, err)],
        ),
        (WaitingForResponse(req), Shutdown) => (
            ToBeClosed(Some(PoolError::PoolShutdown)),
            vec![Effect::RequestFailed(req, PoolError::PoolShutdown)],
        ),

        // -- WaitingForResponseDispatch -----------------------------------------------
        (WaitingForResponseDispatch(req, res), ResponseDispatchable) => {
            let close_after = req.request.wants_connection_close()
                || res.wants_connection_close()
                || ctx.disconnect_deadline.map(|deadline| ctx.now >= deadline).unwrap_or(false);
            dispatch_response(req, res, close_after)
        }
        (WaitingForResponseDispatch(req, res), Shutdown) => {
            let _ = res;
            (
                ToBeClosed(Some(PoolError::PoolShutdown)),
                vec![Effect::EmitResponse(req, Err(PoolError::PoolShutdown))],
            )
        }

        // -- WaitingForResponseEntitySubscription --------------------------------------
        (WaitingForResponseEntitySubscription { request, close_after }, ResponseEntitySubscribed) => {
            (WaitingForEndOfResponseEntity { request, close_after }, vec![])
        }
        (WaitingForResponseEntitySubscription { .. }, Timeout) => (
            ToBeClosed(Some(PoolError::SubscriptionTimeout)),
            vec![Effect::KillResponseEntity],
        ),
        (WaitingForResponseEntitySubscription { request, close_after }, ResponseEntityCompleted) => {
            (WaitingForEndOfResponseEntity { request, close_after }, vec![])
        }
        (WaitingForResponseEntitySubscription { .. }, ResponseEntityFailed(err)) => {
            (ToBeClosed(Some(err)), vec![])
        }
        (WaitingForResponseEntitySubscription { .. }, Shutdown) => {
            (ToBeClosed(Some(PoolError::PoolShutdown)), vec![])
        }

        // -- WaitingForEndOfResponseEntity -----------------------------------------------
        (WaitingForEndOfResponseEntity { close_after: true, .. }, ResponseEntityCompleted) => {
            (ToBeClosed(None), vec![])
        }
        (WaitingForEndOfResponseEntity { close_after: false, .. }, ResponseEntityCompleted) => (Idle, vec![]),
        (WaitingForEndOfResponseEntity { .. }, ResponseEntityFailed(err)) => (ToBeClosed(Some(err)), vec![]),
        (WaitingForEndOfResponseEntity { .. }, Shutdown) => (ToBeClosed(Some(PoolError::PoolShutdown)), vec![]),

        // -- Transient / unreachable-as-current states: ignore defensively ---------------
        (ToBeClosed(reason), _) => (ToBeClosed(reason), vec![]),
        (Failed(err), _) => (Failed(err), vec![]),

        // -- Anything else: the event doesn't apply to this state; ignore it ------------
        (other, _unhandled) => (other, vec![]),
    }
}

/// Shared tail of the `ResponseDispatchable` handling: hand the response to the caller
/// exactly once, then decide whether the body is a live stream needing a caller
/// subscription, or already fully in the caller's hands (`Empty`/`Strict`) — short-circuiting
/// straight to `WaitingForEndOfResponseEntity` with a synthesized completion event.
fn dispatch_response<T: Clone>(req: RequestContext<T>, res: HttpResponse, close_after: bool) -> (SlotState<T>, Vec<Effect<T>>) {
    let needs_subscription = res.entity.is_streamed();
    let mut effects = vec![Effect::EmitResponse(req.clone(), Ok(res))];
    if !needs_subscription {
        effects.push(Effect::Followup(SlotEvent::ResponseEntityCompleted));
        (
            SlotState::WaitingForEndOfResponseEntity { request: req, close_after },
            effects,
        )
    } else {
        (
            SlotState::WaitingForResponseEntitySubscription { request: req, close_after },
            effects,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HttpRequest;
    use std::time::{Duration, Instant};

    fn ctx(cfg: &PoolConfig, now: Instant) -> TransitionCtx<'_> {
        TransitionCtx {
            config: cfg,
            embargo_level: Duration::ZERO,
            connected_count: 1,
            min_connections: 0,
            now,
            disconnect_deadline: None,
        }
    }

    fn req(retries: u32) -> RequestContext<u64> {
        RequestContext::new(HttpRequest::new("GET", "/"), retries, 7)
    }

    #[test]
    fn unconnected_new_request_opens_connection() {
        let cfg = PoolConfig::default();
        let now = Instant::now();
        let mut slot: Slot<u64> = Slot::new(SlotId(0), now);
        let effects = slot.apply(SlotEvent::NewRequest(req(3)), &ctx(&cfg, now)).unwrap();
        assert!(matches!(slot.state, SlotState::Connecting { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::OpenConnection { request: Some(_) })));
    }

    #[test]
    fn connecting_success_pushes_request_and_dispatches() {
        let cfg = PoolConfig::default();
        let now = Instant::now();
        let mut slot: Slot<u64> = Slot::new(SlotId(0), now);
        slot.apply(SlotEvent::NewRequest(req(3)), &ctx(&cfg, now)).unwrap();
        let effects = slot
            .apply(SlotEvent::ConnectionAttemptSucceeded, &ctx(&cfg, now))
            .unwrap();
        assert!(matches!(slot.state, SlotState::WaitingForResponse(_)));
        assert!(effects.iter().any(|e| matches!(e, Effect::PushRequest(_))));
    }

    #[test]
    fn idle_timeout_closes_above_min_connections() {
        let cfg = PoolConfig::default();
        let now = Instant::now();
        let mut slot: Slot<u64> = Slot::new(SlotId(0), now);
        slot.state = SlotState::Idle;
        let tctx = TransitionCtx {
            config: &cfg,
            embargo_level: Duration::ZERO,
            connected_count: 2,
            min_connections: 1,
            now,
            disconnect_deadline: None,
        };
        let effects = slot.apply(SlotEvent::Timeout, &tctx).unwrap();
        assert!(matches!(slot.state, SlotState::Unconnected));
        assert!(effects.iter().any(|e| matches!(e, Effect::CloseConnection(None))));
    }

    #[test]
    fn idle_timeout_preserved_at_min_connections() {
        let cfg = PoolConfig::default();
        let now = Instant::now();
        let mut slot: Slot<u64> = Slot::new(SlotId(0), now);
        slot.state = SlotState::Idle;
        let tctx = TransitionCtx {
            config: &cfg,
            embargo_level: Duration::ZERO,
            connected_count: 1,
            min_connections: 1,
            now,
            disconnect_deadline: None,
        };
        slot.apply(SlotEvent::Timeout, &tctx).unwrap();
        assert!(matches!(slot.state, SlotState::Idle));
    }

    #[test]
    fn retries_left_decrements_to_zero() {
        let r = req(2);
        let r = r.into_retry().unwrap();
        assert_eq!(r.retries_left, 1);
        let r = r.into_retry().unwrap();
        assert_eq!(r.retries_left, 0);
        assert!(r.into_retry().is_none());
    }

    #[test]
    fn unconnected_reentry_under_embargo_goes_out_of_embargo() {
        let cfg = PoolConfig::default();
        let now = Instant::now();
        let mut slot: Slot<u64> = Slot::new(SlotId(0), now);
        slot.state = SlotState::Idle;
        let tctx = TransitionCtx {
            config: &cfg,
            embargo_level: Duration::from_millis(50),
            connected_count: 5,
            min_connections: 0,
            now,
            disconnect_deadline: None,
        };
        slot.apply(SlotEvent::ConnectionFailed(PoolError::ConnectionFailedAfterEstablished), &tctx)
            .unwrap();
        assert!(matches!(slot.state, SlotState::OutOfEmbargo(_)));
    }

    #[test]
    fn preconnect_synthesized_below_minimum() {
        let cfg = PoolConfig::default();
        let now = Instant::now();
        let mut slot: Slot<u64> = Slot::new(SlotId(0), now);
        slot.state = SlotState::Idle;
        let tctx = TransitionCtx {
            config: &cfg,
            embargo_level: Duration::ZERO,
            connected_count: 0,
            min_connections: 2,
            now,
            disconnect_deadline: None,
        };
        let effects = slot
            .apply(SlotEvent::ConnectionCompleted, &tctx)
            .unwrap();
        assert!(matches!(slot.state, SlotState::PreConnecting { .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::OpenConnection { request: None })));
    }

    #[test]
    fn empty_body_response_short_circuits_straight_to_idle() {
        use crate::request::HttpResponse;
        let cfg = PoolConfig::default();
        let now = Instant::now();
        let mut slot: Slot<u64> = Slot::new(SlotId(0), now);
        slot.state = SlotState::WaitingForResponse(req(3));
        let tctx = ctx(&cfg, now);
        let effects = slot
            .apply(SlotEvent::ResponseReceived(HttpResponse::new(204)), &tctx)
            .unwrap();
        assert!(matches!(slot.state, SlotState::Idle));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitResponse(_, Ok(_)))));
    }

    #[test]
    fn transition_fixpoint_terminates() {
        let cfg = PoolConfig::default();
        let now = Instant::now();
        let mut slot: Slot<u64> = Slot::new(SlotId(0), now);
        slot.state = SlotState::Idle;
        let tctx = ctx(&cfg, now);
        let result = slot.apply(SlotEvent::NewRequest(req(1)), &tctx);
        assert!(result.is_ok());
    }
}
