//! # Handler Registry
//!
//! Named handlers and the capabilities a handler receives when it is invoked.
//!
//! A handler is called with the request param, a [`Notify`] capability and a
//! [`Reply`] capability, and may return a [`Cancel`] thunk that the engine runs
//! if the peer cancels the call before the reply is sent.
//!
//! For an inbound Emit the capabilities are inert: nothing the handler notifies
//! or replies leaves the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::AbortHandle;

use crate::engine::Command;
use crate::engine::ConnectionId;
use crate::envelope::CallId;
use crate::pending::Once;
use crate::Payload;

/// A method implementation.
///
/// Closures with the matching signature implement this trait, so most code
/// registers handlers through [`Npc::on`](crate::Npc::on).
pub trait Handler: Send + Sync + 'static {
    fn call(&self, param: Option<Payload>, notify: Notify, reply: Reply) -> Option<Cancel>;
}

impl<F> Handler for F
where
    F: Fn(Option<Payload>, Notify, Reply) -> Option<Cancel> + Send + Sync + 'static,
{
    fn call(&self, param: Option<Payload>, notify: Notify, reply: Reply) -> Option<Cancel> {
        self(param, notify, reply)
    }
}

/// Aborts an in-flight inbound call. Runs at most once.
pub struct Cancel(Box<dyn FnOnce() + Send + 'static>);

impl Cancel {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub(crate) fn run(self) {
        (self.0)()
    }
}

impl From<AbortHandle> for Cancel {
    fn from(handle: AbortHandle) -> Self {
        Self::new(move || handle.abort())
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cancel")
    }
}

/// Shared state of one inbound Deliver, held by its capabilities and its cancel entry.
///
/// Stamped with the transport it arrived on; its notify and reply traffic is
/// only sent while that transport is still installed.
pub(crate) struct InboundCall {
    id: CallId,
    connection: Option<ConnectionId>,
    once: Once,
    engine: WeakUnboundedSender<Command>,
}

impl InboundCall {
    pub(crate) fn new(
        id: CallId,
        connection: Option<ConnectionId>,
        engine: WeakUnboundedSender<Command>,
    ) -> Arc<Self> {
        Arc::new(Self { id, connection, once: Once::default(), engine })
    }

    pub(crate) fn id(&self) -> CallId {
        self.id
    }

    pub(crate) fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub(crate) fn once(&self) -> &Once {
        &self.once
    }

    /// Hands a command to the engine; a dropped engine swallows it.
    fn post(&self, command: Command) {
        if let Some(engine) = self.engine.upgrade() {
            let _ = engine.send(command);
        }
    }
}

/// Progress capability of an inbound call.
///
/// Notifications sent after the call has replied or been cancelled are dropped.
#[derive(Clone)]
pub struct Notify {
    call: Option<Arc<InboundCall>>,
}

impl Notify {
    pub(crate) fn new(call: Arc<InboundCall>) -> Self {
        Self { call: Some(call) }
    }

    pub(crate) fn discard() -> Self {
        Self { call: None }
    }

    pub fn notify(&self, param: Option<Payload>) {
        let Some(call) = &self.call else { return };
        if call.once.is_completed() {
            return;
        }
        call.post(Command::Progress { call: call.clone(), param });
    }
}

/// Terminal capability of an inbound call.
///
/// Clones share one guard: the first `reply` across all clones sends the ack,
/// every later one is a no-op and returns false.
#[derive(Clone)]
pub struct Reply {
    call: Option<Arc<InboundCall>>,
}

impl Reply {
    pub(crate) fn new(call: Arc<InboundCall>) -> Self {
        Self { call: Some(call) }
    }

    pub(crate) fn discard() -> Self {
        Self { call: None }
    }

    pub fn reply(&self, param: Option<Payload>, error: Option<Payload>) -> bool {
        let Some(call) = &self.call else { return false };
        if !call.once.complete() {
            return false;
        }
        call.post(Command::Replied { call: call.clone(), param, error });
        true
    }

    pub fn ok(&self, param: Payload) -> bool {
        self.reply(Some(param), None)
    }

    pub fn err(&self, error: Payload) -> bool {
        self.reply(None, Some(error))
    }

    /// Whether the call has already replied or been cancelled.
    pub fn is_completed(&self) -> bool {
        self.call.as_ref().is_none_or(|call| call.once.is_completed())
    }
}

/// Method name to handler. Last registration wins.
#[derive(Default)]
pub(crate) struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub(crate) fn register(&mut self, method: String, handler: Arc<dyn Handler>) {
        self.handlers.insert(method, handler);
    }

    pub(crate) fn remove(&mut self, method: &str) -> bool {
        self.handlers.remove(method).is_some()
    }

    pub(crate) fn lookup(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method).cloned()
    }
}
