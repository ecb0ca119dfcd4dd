//! # Link Pump
//!
//! Binds an [`Npc`] engine to a [`Transport`].
//!
//! A link owns two tasks:
//!
//! - **Writer**: drains frames produced by the engine's sender and writes them to
//!   the transport in order.
//! - **Reader**: decodes every incoming frame and hands it to
//!   [`Npc::receive_from`]. Frames that do not decode are logged and skipped.
//!
//! When the peer closes the transport, or it fails, the engine is disconnected,
//! which completes every outstanding delivery with `"disconnected"`. A link only
//! ever tears down its own connection: once the engine has been connected to
//! another transport, an old link closing or being dropped leaves it alone.
//!
//! The reader only holds the engine weakly, so a link never keeps an engine alive.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use npc::ConnectionId;
use npc::Envelope;
use npc::Npc;
use npc::WeakNpc;

use crate::codec::Codec;
use crate::transport::Transport;

/// Frames larger than this are refused by default.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Largest frame accepted in either direction, in bytes.
    pub max_frame_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }
}

/// The engine's view of the link: encodes envelopes onto the writer queue.
struct FrameSender {
    codec: Codec,
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

impl npc::Sender for FrameSender {
    fn send(&self, envelope: Envelope) {
        match self.codec.encode(&envelope) {
            Ok(frame) => {
                if self.frames.send(frame).is_err() {
                    trace!(%envelope, "writer is gone, dropping frame");
                }
            }
            Err(e) => warn!(%envelope, error = %e, "dropping envelope that cannot be framed"),
        }
    }
}

/// A running connection between one engine and one transport.
///
/// Dropping the link stops both pumps and disconnects the engine, unless the
/// engine has moved on to another transport in the meantime.
#[must_use = "dropping a link disconnects the engine"]
pub struct Link {
    owner: Owner,
    writer: AbortHandle,
    reader: AbortHandle,
}

impl Link {
    /// Connects `npc` to `transport` with the default [`LinkConfig`].
    pub fn attach(npc: &Npc, transport: impl Transport) -> Self {
        Self::with_config(npc, transport, LinkConfig::default())
    }

    pub fn with_config(npc: &Npc, transport: impl Transport, config: LinkConfig) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let codec = Codec::new(config.max_frame_len);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        // Connect before reading so inbound calls can always be answered.
        let connection = npc.connect(FrameSender { codec, frames: frames_tx });
        let owner = Owner { npc: npc.downgrade(), connection };

        let writer = tokio::spawn(write_loop(transport.clone(), frames_rx, owner.clone()));
        let reader = tokio::spawn(read_loop(transport, codec, owner.clone()));
        debug!(npc = %npc.name(), ?connection, max_frame_len = config.max_frame_len, "link attached");

        Self {
            owner,
            writer: writer.abort_handle(),
            reader: reader.abort_handle(),
        }
    }

    /// Whether both pumps are still running.
    pub fn is_active(&self) -> bool {
        !self.writer.is_finished() && !self.reader.is_finished()
    }

    /// The engine connection this link installed.
    pub fn connection(&self) -> ConnectionId {
        self.owner.connection
    }

    /// Stops the pumps and disconnects the engine if it still uses this link.
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
        debug!(connection = ?self.owner.connection, "link detached");
        self.owner.close();
    }
}

/// What a pump task needs to hand frames to the engine and to close its own connection.
#[derive(Clone)]
struct Owner {
    npc: WeakNpc,
    connection: ConnectionId,
}

impl Owner {
    fn close(&self) {
        if let Some(npc) = self.npc.upgrade() {
            npc.disconnect_if(self.connection);
        }
    }
}

async fn write_loop(transport: Arc<dyn Transport>, mut frames: mpsc::UnboundedReceiver<Vec<u8>>, owner: Owner) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = transport.send(&frame).await {
            warn!(error = %e, "transport send failed");
            owner.close();
            return;
        }
    }
    trace!("writer finished");
}

async fn read_loop(transport: Arc<dyn Transport>, codec: Codec, owner: Owner) {
    loop {
        let frame = match transport.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("transport closed by peer");
                break;
            }
            Err(e) => {
                warn!(error = %e, "transport receive failed");
                break;
            }
        };

        let envelope = match codec.decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "skipping undecodable frame");
                continue;
            }
        };

        let Some(npc) = owner.npc.upgrade() else {
            trace!("engine dropped, reader finished");
            return;
        };
        npc.receive_from(owner.connection, envelope);
    }

    owner.close();
}
