//! # Timeout Manager
//!
//! One-shot timer per outbound delivery that was given a timeout.
//!
//! A timer is a tokio task that sleeps, then asks the engine to expire its ticket.
//! Dropping the [`Timer`] aborts the task, and the pending entry owns the timer,
//! so any completion path that removes the entry disarms it in the same step.
//! An expiry that was already queued when the entry completed finds no ticket
//! and is ignored.

use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::AbortHandle;

use crate::engine::Command;
use crate::pending::Ticket;

pub(crate) struct Timer {
    handle: AbortHandle,
}

impl Timer {
    pub(crate) fn arm(after: Duration, ticket: Ticket, engine: WeakUnboundedSender<Command>) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(engine) = engine.upgrade() {
                let _ = engine.send(Command::Expire(ticket));
            }
        });
        Self { handle: task.abort_handle() }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
