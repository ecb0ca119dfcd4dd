//! # NPC Engine
//!
//! The façade over the registry, the correlation tables and the timers.
//!
//! ## Execution model
//!
//! Every [`Npc`] handle feeds one unbounded queue drained by a single tokio task
//! that exclusively owns all engine state. Public operations only enqueue, so
//! none of them blocks, and a handler or callback that re-enters the engine just
//! enqueues more work behind the current step instead of deadlocking.
//!
//! Handlers and application callbacks run on that task, in dispatch order. They
//! must return promptly; long work belongs in a spawned task (return its
//! [`AbortHandle`](tokio::task::AbortHandle) as the cancel thunk).
//!
//! ## Lifetime
//!
//! Timers and handler capabilities hold the queue weakly. When the last strong
//! handle is dropped the task drains: outstanding deliveries complete with
//! `"disconnected"` and outstanding inbound calls are cancelled.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::Instrument;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::envelope::Envelope;
use crate::envelope::Kind;
use crate::error::Reason;
use crate::handler::Cancel;
use crate::handler::Handler;
use crate::handler::InboundCall;
use crate::handler::Notify;
use crate::handler::Registry;
use crate::handler::Reply;
use crate::pending::IdGen;
use crate::pending::Inbound;
use crate::pending::OnNotify;
use crate::pending::OnReply;
use crate::pending::Outbound;
use crate::pending::PendingDelivery;
use crate::pending::Ticket;
use crate::timer::Timer;
use crate::Payload;

/// The one capability the engine needs from its host: put an envelope on the wire.
///
/// Sends are fire-and-forget and must preserve order per direction.
pub trait Sender: Send + Sync + 'static {
    fn send(&self, envelope: Envelope);
}

impl<F> Sender for F
where
    F: Fn(Envelope) + Send + Sync + 'static,
{
    fn send(&self, envelope: Envelope) {
        self(envelope)
    }
}

/// Identifies one installed transport, as returned by [`Npc::connect`].
///
/// Never reused within an engine, so a stale id cannot tear down a newer transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Per-call options for [`Npc::deliver`].
#[derive(Default)]
pub struct DeliverOptions {
    timeout: Option<Duration>,
    on_notify: Option<OnNotify>,
    on_reply: Option<OnReply>,
}

impl DeliverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gives up with `"timedout"` after `timeout`. A zero duration means no timer.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_notify(mut self, f: impl FnMut(Option<Payload>) + Send + 'static) -> Self {
        self.on_notify = Some(Box::new(f));
        self
    }

    /// The terminal callback, invoked exactly once with `(param, error)`.
    pub fn on_reply(mut self, f: impl FnOnce(Option<Payload>, Option<Payload>) + Send + 'static) -> Self {
        self.on_reply = Some(Box::new(f));
        self
    }
}

/// Work items for the engine task.
pub(crate) enum Command {
    Register { method: String, handler: Option<Arc<dyn Handler>> },
    Emit { method: String, param: Option<Payload> },
    Deliver { ticket: Ticket, method: String, param: Option<Payload>, options: DeliverOptions },
    Receive { from: Option<ConnectionId>, envelope: Envelope },
    Cancel(Ticket),
    Expire(Ticket),
    Progress { call: Arc<InboundCall>, param: Option<Payload> },
    Replied { call: Arc<InboundCall>, param: Option<Payload>, error: Option<Payload> },
    Connect { connection: ConnectionId, sender: Arc<dyn Sender> },
    Disconnect(Option<ConnectionId>),
    Settle(oneshot::Sender<()>),
}

/// Handle returned by [`Npc::deliver`]. Cancelling after completion is a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    engine: mpsc::WeakUnboundedSender<Command>,
    ticket: Ticket,
}

impl CancelHandle {
    /// Completes the call with `"cancelled"` and asks the peer to stop, unless
    /// the call already completed.
    pub fn cancel(&self) {
        if let Some(engine) = self.engine.upgrade() {
            let _ = engine.send(Command::Cancel(self.ticket));
        }
    }
}

/// Builder for [`Npc`].
#[derive(Debug, Default)]
pub struct NpcBuilder {
    name: Option<String>,
}

impl NpcBuilder {
    /// Name attached to every log event of this engine.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawns the engine task.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Npc {
        let name: Arc<str> = Arc::from(self.name.unwrap_or_else(|| "npc".to_string()));
        let (tx, rx) = mpsc::unbounded_channel();
        let state = State::new(tx.downgrade());
        let span = tracing::debug_span!("npc", name = %name);
        tokio::spawn(run(rx, state).instrument(span));

        Npc {
            name,
            tx,
            tickets: Arc::new(AtomicU64::new(1)),
            connections: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Near procedure call engine.
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Npc {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
    tickets: Arc<AtomicU64>,
    connections: Arc<AtomicU64>,
}

impl Npc {
    pub fn builder() -> NpcBuilder {
        NpcBuilder::default()
    }

    /// An unnamed engine. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downgrade(&self) -> WeakNpc {
        WeakNpc {
            name: self.name.clone(),
            tx: self.tx.downgrade(),
            tickets: self.tickets.clone(),
            connections: self.connections.clone(),
        }
    }

    fn enqueue(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!(npc = %self.name, "engine task is gone, dropping operation");
        }
    }

    /// Registers `handler` for `method`, replacing any previous one.
    pub fn on<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Payload>, Notify, Reply) -> Option<Cancel> + Send + Sync + 'static,
    {
        self.on_handler(method, handler);
    }

    pub fn on_handler(&self, method: impl Into<String>, handler: impl Handler) {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        self.enqueue(Command::Register { method: method.into(), handler: Some(handler) });
    }

    /// Unregisters `method`. Later calls to it are answered with `"unimplemented"`.
    pub fn off(&self, method: impl Into<String>) {
        self.enqueue(Command::Register { method: method.into(), handler: None });
    }

    /// Fire-and-forget call. Silently dropped when not connected.
    pub fn emit(&self, method: impl Into<String>, param: Option<Payload>) {
        self.enqueue(Command::Emit { method: method.into(), param });
    }

    /// Calls `method` on the peer and reports the outcome through `options`.
    ///
    /// Never blocks. If no transport is connected the reply callback receives
    /// `"disconnected"` from the engine task and the returned handle does nothing.
    pub fn deliver(&self, method: impl Into<String>, param: Option<Payload>, options: DeliverOptions) -> CancelHandle {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let command = Command::Deliver { ticket, method: method.into(), param, options };

        if let Err(mpsc::error::SendError(command)) = self.tx.send(command) {
            warn!(npc = %self.name, "engine task is gone, failing delivery");
            if let Command::Deliver { options: DeliverOptions { on_reply: Some(on_reply), .. }, .. } = command {
                on_reply(None, Some(Reason::Disconnected.into_payload()));
            }
        }

        CancelHandle { engine: self.tx.downgrade(), ticket }
    }

    /// Awaits the outcome of a delivery, ignoring progress notifications.
    ///
    /// `Ok` carries the reply param, `Err` the reply error. Dropping the future
    /// before it resolves cancels the call.
    pub async fn request(
        &self,
        method: impl Into<String>,
        param: Option<Payload>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Option<Payload>, Payload> {
        let (tx, rx) = oneshot::channel();
        let mut options = DeliverOptions::new().on_reply(move |param, error| {
            let _ = tx.send(match error {
                Some(error) => Err(error),
                None => Ok(param),
            });
        });
        if let Some(timeout) = timeout {
            options = options.timeout(timeout);
        }

        let mut guard = CancelOnDrop(Some(self.deliver(method, param, options)));
        let outcome = rx.await.unwrap_or_else(|_| Err(Reason::Disconnected.into_payload()));
        guard.0 = None;
        outcome
    }

    /// Entry point for every envelope arriving from the peer, in arrival order.
    pub fn receive(&self, envelope: Envelope) {
        self.enqueue(Command::Receive { from: None, envelope });
    }

    /// Like [`receive`](Self::receive), for a transport that was installed with
    /// [`connect`](Self::connect). Dropped once that transport has been replaced
    /// or disconnected.
    pub fn receive_from(&self, connection: ConnectionId, envelope: Envelope) {
        self.enqueue(Command::Receive { from: Some(connection), envelope });
    }

    /// Installs the transport, disconnecting any previous one first.
    pub fn connect(&self, sender: impl Sender) -> ConnectionId {
        let connection = ConnectionId(self.connections.fetch_add(1, Ordering::Relaxed));
        self.enqueue(Command::Connect { connection, sender: Arc::new(sender) });
        connection
    }

    /// Fails every outstanding delivery with `"disconnected"`, cancels every
    /// inbound call and removes the transport.
    pub fn disconnect(&self) {
        self.enqueue(Command::Disconnect(None));
    }

    /// Like [`disconnect`](Self::disconnect), but only if `connection` is still
    /// the installed transport. A no-op once another transport replaced it.
    pub fn disconnect_if(&self, connection: ConnectionId) {
        self.enqueue(Command::Disconnect(Some(connection)));
    }

    /// Resolves once every operation enqueued before it has been applied.
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Command::Settle(tx));
        let _ = rx.await;
    }
}

impl std::fmt::Debug for Npc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Npc").field("name", &self.name).finish()
    }
}

/// Non-owning [`Npc`] handle. Does not keep the engine alive.
#[derive(Clone)]
pub struct WeakNpc {
    name: Arc<str>,
    tx: mpsc::WeakUnboundedSender<Command>,
    tickets: Arc<AtomicU64>,
    connections: Arc<AtomicU64>,
}

impl WeakNpc {
    pub fn upgrade(&self) -> Option<Npc> {
        Some(Npc {
            name: self.name.clone(),
            tx: self.tx.upgrade()?,
            tickets: self.tickets.clone(),
            connections: self.connections.clone(),
        })
    }
}

struct CancelOnDrop(Option<CancelHandle>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.cancel();
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, mut state: State) {
    debug!("engine started");
    while let Some(command) = rx.recv().await {
        state.apply(command);
    }
    debug!("last handle dropped, shutting down");
    state.disconnect();
}

/// The installed transport.
struct Connection {
    id: ConnectionId,
    sender: Arc<dyn Sender>,
}

/// Everything the engine task owns.
struct State {
    this: mpsc::WeakUnboundedSender<Command>,
    connection: Option<Connection>,
    registry: Registry,
    outbound: Outbound,
    inbound: Inbound,
    ids: IdGen,
}

impl State {
    fn new(this: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self {
            this,
            connection: None,
            registry: Registry::default(),
            outbound: Outbound::default(),
            inbound: Inbound::default(),
            ids: IdGen::default(),
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register { method, handler: Some(handler) } => {
                trace!(%method, "handler registered");
                self.registry.register(method, handler);
            }
            Command::Register { method, handler: None } => {
                if self.registry.remove(&method) {
                    trace!(%method, "handler removed");
                }
            }
            Command::Emit { method, param } => {
                if self.connection.is_none() {
                    debug!(%method, "not connected, dropping emit");
                    return;
                }
                self.send(Envelope::emit(method, param));
            }
            Command::Deliver { ticket, method, param, options } => self.deliver(ticket, method, param, options),
            Command::Receive { from: Some(connection), envelope } if !self.is_connected_to(connection) => {
                trace!(%envelope, ?connection, "dropping envelope from a closed transport");
            }
            Command::Receive { envelope, .. } => self.receive(envelope),
            Command::Cancel(ticket) => self.abandon(ticket, Reason::Cancelled),
            Command::Expire(ticket) => self.abandon(ticket, Reason::Timedout),
            Command::Progress { call, param } => {
                if self.is_current(&call) {
                    self.send(Envelope::notify(call.id(), param));
                } else {
                    debug!(id = call.id(), "dropping notify from a call of a closed transport");
                }
            }
            Command::Replied { call, param, error } => {
                self.inbound.remove(&call);
                if self.is_current(&call) {
                    self.send(Envelope::ack(call.id(), param, error));
                } else {
                    debug!(id = call.id(), "dropping reply to a call of a closed transport");
                }
            }
            Command::Connect { connection, sender } => {
                if self.connection.is_some() {
                    debug!("replacing existing transport");
                    self.disconnect();
                }
                debug!(?connection, "connected");
                self.connection = Some(Connection { id: connection, sender });
            }
            Command::Disconnect(None) => self.disconnect(),
            Command::Disconnect(Some(connection)) => {
                if self.is_connected_to(connection) {
                    self.disconnect();
                } else {
                    trace!(?connection, "transport already replaced, ignoring disconnect");
                }
            }
            Command::Settle(done) => {
                let _ = done.send(());
            }
        }
    }

    fn send(&self, envelope: Envelope) {
        match &self.connection {
            Some(connection) => {
                trace!(%envelope, "send");
                connection.sender.send(envelope);
            }
            None => debug!(%envelope, "not connected, dropping envelope"),
        }
    }

    fn deliver(&mut self, ticket: Ticket, method: String, param: Option<Payload>, options: DeliverOptions) {
        let DeliverOptions { timeout, on_notify, on_reply } = options;

        if self.connection.is_none() {
            debug!(%method, "not connected, failing delivery");
            if let Some(on_reply) = on_reply {
                on_reply(None, Some(Reason::Disconnected.into_payload()));
            }
            return;
        }

        let outbound = &self.outbound;
        let id = self.ids.next(|id| outbound.contains(id));
        let timer = timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| Timer::arm(timeout, ticket, self.this.clone()));

        self.outbound.register(PendingDelivery { id, ticket, on_reply, on_notify, timer });
        self.send(Envelope::deliver(id, method, param));
    }

    /// Local give-up path shared by explicit cancel and timeout.
    fn abandon(&mut self, ticket: Ticket, reason: Reason) {
        if let Some(id) = self.outbound.complete_ticket(ticket, reason) {
            debug!(id, %reason, "delivery abandoned locally");
            if self.connection.is_some() {
                self.send(Envelope::cancel(id));
            }
        }
    }

    fn receive(&mut self, envelope: Envelope) {
        trace!(%envelope, "receive");
        let (kind, id, method, param, error) = envelope.into_parts();

        match kind {
            Kind::Emit => {
                let Some(method) = method else { return };
                match self.registry.lookup(&method) {
                    Some(handler) => {
                        // Emit ignores whatever the handler returns, cancel thunk included.
                        let _ = handler.call(param, Notify::discard(), Reply::discard());
                    }
                    None => debug!(%method, "no handler for emit, dropping"),
                }
            }
            Kind::Deliver => {
                let Some(method) = method else { return };
                let Some(handler) = self.registry.lookup(&method) else {
                    debug!(id, %method, "no handler for deliver");
                    self.send(Envelope::ack(id, None, Some(Reason::Unimplemented.into_payload())));
                    return;
                };
                let connection = self.connection.as_ref().map(|current| current.id);
                let call = InboundCall::new(id, connection, self.this.clone());
                if let Some(thunk) = handler.call(param, Notify::new(call.clone()), Reply::new(call.clone())) {
                    self.inbound.register_cancel(call, thunk);
                }
            }
            Kind::Ack => {
                if !self.outbound.complete_once(id, param, error) {
                    trace!(id, "ack for a call that is no longer pending");
                }
            }
            Kind::Notify => {
                if !self.outbound.notify(id, param) {
                    trace!(id, "notify for a call that is no longer pending");
                }
            }
            Kind::Cancel => {
                if self.inbound.cancel_once(id) {
                    debug!(id, "inbound call cancelled by peer");
                }
            }
        }
    }

    fn is_connected_to(&self, connection: ConnectionId) -> bool {
        self.connection.as_ref().is_some_and(|current| current.id == connection)
    }

    /// Whether `call` arrived over the transport that is installed now.
    fn is_current(&self, call: &InboundCall) -> bool {
        call.connection().is_some_and(|connection| self.is_connected_to(connection))
    }

    fn disconnect(&mut self) {
        self.connection = None;
        let failed = self.outbound.complete_all(Reason::Disconnected);
        let cancelled = self.inbound.cancel_all();
        debug!(failed, cancelled, "disconnected");
        debug_assert_eq!(self.outbound.len() + self.inbound.len(), 0);
    }
}

impl Default for Npc {
    fn default() -> Self {
        Self::new()
    }
}
