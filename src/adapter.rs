//! Drives one live connection on its own task.
//!
//! A connection is `&mut self`-exclusive (see [`crate::connection::HttpConnection`]), but
//! the pool stage needs to both push it a request and race it against an unprompted
//! close while otherwise idle. Rather than share the connection behind a lock, each
//! connected slot gets its own actor task that owns the connection outright and talks to
//! the stage only through two unbounded channels — commands in, events out.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionFactory, HttpConnection};
use crate::error::ConnectionError;
use crate::request::{HttpRequest, HttpResponse};
use crate::slot::SlotId;

/// A command accepted by a running connection actor.
pub enum AdapterCommand {
    /// Send this request and report the outcome as an [`AdapterEventKind`].
    SendRequest(HttpRequest),
    /// Close the connection and stop the actor. No reply is sent.
    Shutdown,
}

/// What happened, tagged with the slot and the generation it happened for so the
/// receiver can drop a message that arrived after the slot moved on.
pub struct AdapterMessage {
    pub slot_id: SlotId,
    pub generation: u64,
    pub kind: AdapterEventKind,
}

pub enum AdapterEventKind {
    /// The connect attempt launched by [`spawn_connect`] succeeded; this is the actor's
    /// command handle the pool should keep alongside the slot.
    Connected(AdapterHandle),
    /// The connect attempt failed.
    ConnectFailed(ConnectionError),
    /// A request sent via [`AdapterCommand::SendRequest`] got a response.
    ResponseReceived(HttpResponse),
    /// A request sent via [`AdapterCommand::SendRequest`] failed; the actor has stopped.
    RequestFailed(ConnectionError),
    /// The connection failed or was closed by the peer while idle; the actor has stopped.
    Closed(ConnectionError),
}

impl AdapterMessage {
    fn new(slot_id: SlotId, generation: u64, kind: AdapterEventKind) -> Self {
        AdapterMessage { slot_id, generation, kind }
    }
}

/// A handle to a running connection actor.
pub struct AdapterHandle {
    commands: mpsc::UnboundedSender<AdapterCommand>,
    task: JoinHandle<()>,
}

impl AdapterHandle {
    /// Sends `request` to the connection. The outcome arrives later as an
    /// `AdapterEventKind::ResponseReceived`/`RequestFailed` on the shared events channel.
    /// A failure here means the actor has already stopped (e.g. the connection died
    /// moments before); the caller should treat the slot as if the connection had closed.
    pub fn send_request(&self, request: HttpRequest) -> Result<(), HttpRequest> {
        match self.commands.send(AdapterCommand::SendRequest(request)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(AdapterCommand::SendRequest(request))) => Err(request),
            Err(_) => unreachable!("SendRequest round-trips through SendError unchanged"),
        }
    }

    /// Closes the connection. Best-effort: if the actor has already stopped this is a
    /// no-op.
    pub fn shutdown(&self) {
        let _ = self.commands.send(AdapterCommand::Shutdown);
    }

    /// Aborts the actor task outright, without waiting for a graceful `shutdown()` to be
    /// observed. Used when the pool itself is shutting down and cannot wait.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawns a task that attempts to connect via `factory`, then — on success — spawns the
/// long-lived actor task driving that connection. Both outcomes are reported as
/// [`AdapterMessage`]s on `events`, tagged with `slot_id`/`generation` so the receiver
/// can recognize and drop a message belonging to a slot that has since moved on.
pub fn spawn_connect<F>(
    factory: std::sync::Arc<F>,
    slot_id: SlotId,
    generation: u64,
    events: mpsc::UnboundedSender<AdapterMessage>,
) -> JoinHandle<()>
where
    F: ConnectionFactory,
{
    tokio::spawn(async move {
        match factory.connect().await {
            Ok(conn) => {
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(run_connection_actor(conn, slot_id, generation, cmd_rx, events.clone()));
                let handle = AdapterHandle { commands: cmd_tx, task };
                let _ = events.send(AdapterMessage::new(slot_id, generation, AdapterEventKind::Connected(handle)));
            }
            Err(err) => {
                let _ = events.send(AdapterMessage::new(slot_id, generation, AdapterEventKind::ConnectFailed(err)));
            }
        }
    })
}

enum Next {
    Command(Option<AdapterCommand>),
    Closed(ConnectionError),
}

async fn run_connection_actor<C: HttpConnection>(
    mut conn: C,
    slot_id: SlotId,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<AdapterCommand>,
    events: mpsc::UnboundedSender<AdapterMessage>,
) {
    loop {
        // `wait_closed` is only ever raced while idle: once a request is in flight we
        // hold the one `&mut conn` borrow `send_request` needs, so the two are never
        // polled concurrently.
        let next = tokio::select! {
            cmd = commands.recv() => Next::Command(cmd),
            closed = conn.wait_closed() => Next::Closed(closed),
        };

        match next {
            Next::Command(Some(AdapterCommand::SendRequest(request))) => {
                match conn.send_request(request).await {
                    Ok(response) => {
                        let _ = events.send(AdapterMessage::new(
                            slot_id,
                            generation,
                            AdapterEventKind::ResponseReceived(response),
                        ));
                    }
                    Err(err) => {
                        let _ = events.send(AdapterMessage::new(slot_id, generation, AdapterEventKind::RequestFailed(err)));
                        return;
                    }
                }
            }
            Next::Command(Some(AdapterCommand::Shutdown)) | Next::Command(None) => {
                Box::new(conn).shutdown().await;
                return;
            }
            Next::Closed(err) => {
                let _ = events.send(AdapterMessage::new(slot_id, generation, AdapterEventKind::Closed(err)));
                return;
            }
        }
    }
}
