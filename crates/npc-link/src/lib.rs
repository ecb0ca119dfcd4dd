//! # NPC Link
//!
//! Puts an [`npc::Npc`] engine on a byte transport.
//!
//! ## Philosophy
//!
//! - **Layered**: [`Transport`] moves frames, [`Codec`] turns frames into
//!   envelopes, [`Link`] pumps between the two and the engine. Each layer can be
//!   replaced without touching the others.
//! - **Lossy Input, Strict Output**: A peer that sends garbage loses that frame,
//!   not the connection. Outgoing frames always satisfy the envelope invariants.

pub mod codec;
pub mod link;
pub mod mock_transport;
pub mod transport;

pub use codec::Codec;
pub use codec::CodecError;
pub use link::Link;
pub use link::LinkConfig;
pub use mock_transport::DuplexChannelTransport;
pub use transport::Error as TransportError;
pub use transport::Transport;
