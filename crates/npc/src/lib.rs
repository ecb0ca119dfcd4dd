//! # NPC: Near Procedure Call
//!
//! A symmetric call protocol for two peers joined by any duplex channel: a
//! socket, a WebView bridge, a process pipe. Each peer runs an [`Npc`] engine,
//! registers named handlers with [`Npc::on`] and calls the other side with:
//!
//! - [`Npc::emit`]: fire-and-forget.
//! - [`Npc::deliver`]: one terminal reply, preceded by any number of progress
//!   notifications, optionally bounded by a timeout and cancellable from either side.
//!
//! ## Philosophy
//!
//! - **Transport-Agnostic**: The engine asks its host for one thing, a [`Sender`]
//!   that puts an [`Envelope`] on the wire, and expects [`Npc::receive`] to be
//!   called for every envelope coming back. Bytes and encodings live elsewhere.
//! - **At-Most-Once**: Ack, timeout, cancel and disconnect all race to complete a
//!   call; exactly one of them reaches the reply callback.
//! - **Errors Are Replies**: Engine failures ([`Reason`]) arrive in the `error`
//!   slot of the reply callback. No public operation returns an error.

pub mod engine;
pub mod envelope;
pub mod error;
pub mod handler;
mod pending;
mod timer;

pub use engine::CancelHandle;
pub use engine::ConnectionId;
pub use engine::DeliverOptions;
pub use engine::Npc;
pub use engine::NpcBuilder;
pub use engine::Sender;
pub use engine::WeakNpc;
pub use envelope::CallId;
pub use envelope::Envelope;
pub use envelope::Kind;
pub use error::InvalidEnvelope;
pub use error::Reason;
pub use handler::Cancel;
pub use handler::Handler;
pub use handler::Notify;
pub use handler::Reply;
pub use pending::OnNotify;
pub use pending::OnReply;

/// Opaque application payload carried in `param` and `error`.
pub type Payload = serde_json::Value;

#[cfg(test)]
mod tests;
