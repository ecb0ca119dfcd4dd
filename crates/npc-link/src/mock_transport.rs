//! In-process frame transport.
//!
//! Two engines in the same process, or a test standing in for the remote peer,
//! can be joined without a socket: each end's outgoing frames are the other
//! end's incoming frames.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;

/// One end of an in-memory frame channel.
///
/// Frames are delivered whole and in order. Dropping an end closes the channel:
/// the other end's `recv()` yields `Ok(None)`, which a [`Link`](crate::Link)
/// treats as the peer hanging up.
pub struct DuplexChannelTransport {
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    inbox: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl DuplexChannelTransport {
    /// Builds an end from the channel halves it writes to and reads from.
    pub fn new(outbox: mpsc::UnboundedSender<Vec<u8>>, inbox: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { outbox, inbox: Arc::new(Mutex::new(inbox)) }
    }

    /// Two crossed ends: what one sends, the other receives.
    pub fn pair() -> (Self, Self) {
        let (a_out, b_in) = mpsc::unbounded_channel();
        let (b_out, a_in) = mpsc::unbounded_channel();
        (Self::new(a_out, a_in), Self::new(b_out, b_in))
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, frame: &[u8]) -> transport::Result<()> {
        self.outbox
            .send(frame.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("peer end dropped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        Ok(self.inbox.lock().await.recv().await)
    }
}
