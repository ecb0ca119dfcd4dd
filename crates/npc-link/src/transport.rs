//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between two peers.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about envelopes or JSON.
//!   It moves opaque buffers, one frame per call.
//! - **Duplex**: Either side may send at any time. There is no request/response
//!   pairing at this layer; correlation is the engine's job.
//! - **Fatal Errors Only**: Any error ends the link. Frame size limits are the
//!   codec's concern and never surface here.

use std::fmt;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional, ordered, frame-preserving byte channel.
///
/// This trait is object-safe (`Arc<dyn Transport>`); the link calls `send` and
/// `recv` from two different tasks concurrently.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Waits for the next frame. `Ok(None)` means the peer closed the channel.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}
