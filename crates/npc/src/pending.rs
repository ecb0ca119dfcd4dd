//! # Correlation Tables
//!
//! Bookkeeping for calls that are in flight in either direction.
//!
//! - [`Outbound`]: deliveries this engine sent and is waiting on. Keyed by call id,
//!   with a ticket index so a cancel handle or timer addresses one exact call even
//!   after the id counter wraps around.
//! - [`Inbound`]: deliveries the peer sent whose handler returned a cancel thunk.
//!
//! ## At-most-once
//! Outbound completion is "remove from the map, then fire". Whoever removes the
//! entry owns the terminal outcome; every later path finds nothing and is a no-op.
//! Inbound calls share a [`Once`] between the reply capability and the cancel entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::trace;

use crate::envelope::CallId;
use crate::error::Reason;
use crate::handler::Cancel;
use crate::handler::InboundCall;
use crate::timer::Timer;
use crate::Payload;

/// Engine-local handle for one outbound call. Never reused, never sent.
pub(crate) type Ticket = u64;

/// Terminal callback of a delivery: `(param, error)`.
pub type OnReply = Box<dyn FnOnce(Option<Payload>, Option<Payload>) + Send + 'static>;

/// Progress callback of a delivery.
pub type OnNotify = Box<dyn FnMut(Option<Payload>) + Send + 'static>;

/// A one-shot latch. `complete` returns true exactly once.
#[derive(Debug, Default)]
pub(crate) struct Once(AtomicBool);

impl Once {
    pub(crate) fn complete(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Call id generator.
///
/// Starts at 0 so the first id is 1, wraps from `i32::MAX` to `i32::MIN`, never
/// yields 0, and skips ids that are still outstanding.
#[derive(Debug, Default)]
pub(crate) struct IdGen {
    last: CallId,
}

impl IdGen {
    #[cfg(test)]
    pub(crate) fn starting_after(last: CallId) -> Self {
        Self { last }
    }

    pub(crate) fn next(&mut self, outstanding: impl Fn(CallId) -> bool) -> CallId {
        loop {
            self.last = if self.last == CallId::MAX {
                debug!("call id counter wrapped around");
                CallId::MIN
            } else {
                self.last + 1
            };
            if self.last != 0 && !outstanding(self.last) {
                return self.last;
            }
        }
    }
}

/// One outstanding outbound `deliver`.
pub(crate) struct PendingDelivery {
    pub(crate) id: CallId,
    pub(crate) ticket: Ticket,
    pub(crate) on_reply: Option<OnReply>,
    pub(crate) on_notify: Option<OnNotify>,
    pub(crate) timer: Option<Timer>,
}

impl PendingDelivery {
    /// Stops the timer, then hands the outcome to the application.
    fn finish(mut self, param: Option<Payload>, error: Option<Payload>) {
        drop(self.timer.take());
        if let Some(on_reply) = self.on_reply.take() {
            on_reply(param, error);
        }
    }
}

#[derive(Default)]
pub(crate) struct Outbound {
    entries: HashMap<CallId, PendingDelivery>,
    tickets: HashMap<Ticket, CallId>,
}

impl Outbound {
    pub(crate) fn register(&mut self, delivery: PendingDelivery) {
        self.tickets.insert(delivery.ticket, delivery.id);
        self.entries.insert(delivery.id, delivery);
    }

    pub(crate) fn contains(&self, id: CallId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn take(&mut self, id: CallId) -> Option<PendingDelivery> {
        let delivery = self.entries.remove(&id)?;
        self.tickets.remove(&delivery.ticket);
        Some(delivery)
    }

    /// Completes the call with the given outcome if it is still pending.
    ///
    /// Returns whether this invocation was the one that completed it.
    pub(crate) fn complete_once(&mut self, id: CallId, param: Option<Payload>, error: Option<Payload>) -> bool {
        match self.take(id) {
            Some(delivery) => {
                delivery.finish(param, error);
                true
            }
            None => false,
        }
    }

    /// Completes the call behind `ticket` with a locally decided reason.
    ///
    /// Returns the call id when this invocation won, so the caller can tell the peer.
    pub(crate) fn complete_ticket(&mut self, ticket: Ticket, reason: Reason) -> Option<CallId> {
        let id = *self.tickets.get(&ticket)?;
        let delivery = self.take(id)?;
        delivery.finish(None, Some(reason.into_payload()));
        Some(id)
    }

    /// Forwards a progress notification. Returns false when the call is no longer pending.
    pub(crate) fn notify(&mut self, id: CallId, param: Option<Payload>) -> bool {
        let Some(delivery) = self.entries.get_mut(&id) else {
            return false;
        };
        if let Some(on_notify) = delivery.on_notify.as_mut() {
            on_notify(param);
        }
        true
    }

    /// Completes every pending call with `reason`, leaving the table empty.
    pub(crate) fn complete_all(&mut self, reason: Reason) -> usize {
        self.tickets.clear();
        let drained: Vec<PendingDelivery> = self.entries.drain().map(|(_, d)| d).collect();
        let count = drained.len();
        for delivery in drained {
            trace!(id = delivery.id, %reason, "completing pending delivery");
            delivery.finish(None, Some(reason.into_payload()));
        }
        count
    }
}

struct InboundEntry {
    call: Arc<InboundCall>,
    thunk: Cancel,
}

#[derive(Default)]
pub(crate) struct Inbound {
    entries: HashMap<CallId, InboundEntry>,
}

impl Inbound {
    /// Records the thunk returned by a handler.
    ///
    /// A call that already replied never needs cancelling, so its thunk is dropped.
    pub(crate) fn register_cancel(&mut self, call: Arc<InboundCall>, thunk: Cancel) {
        if call.once().is_completed() {
            return;
        }
        let id = call.id();
        if self.entries.insert(id, InboundEntry { call, thunk }).is_some() {
            debug!(id, "peer reused an in-flight call id, dropping the older cancel thunk");
        }
    }

    /// Runs the cancel thunk for `id`, at most once.
    pub(crate) fn cancel_once(&mut self, id: CallId) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        if !entry.call.once().complete() {
            return false;
        }
        entry.thunk.run();
        true
    }

    /// Forgets the thunk of a call that replied normally.
    pub(crate) fn remove(&mut self, call: &Arc<InboundCall>) {
        let id = call.id();
        if self.entries.get(&id).is_some_and(|entry| Arc::ptr_eq(&entry.call, call)) {
            self.entries.remove(&id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Cancels every call that has not replied yet, leaving the table empty.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let drained: Vec<InboundEntry> = self.entries.drain().map(|(_, e)| e).collect();
        let mut cancelled = 0;
        for entry in drained {
            if entry.call.once().complete() {
                entry.thunk.run();
                cancelled += 1;
            }
        }
        cancelled
    }
}
