//! Outbound peer connection

use futures::SinkExt;
use std::fmt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Lines buffered per peer before new ones are dropped
pub const OUTBOUND_CAPACITY: usize = 256;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Registered, no connection attempt yet
    New,
    /// Dialing
    Connecting,
    /// Ready to send
    Connected,
    /// Gone; pruned on the next maintenance pass
    Closed,
}

/// A peer we send to
///
/// Messages queued while the connection is being established are flushed
/// once it is up; at most [`OUTBOUND_CAPACITY`] wait at a time. Replies
/// from the remote arrive on its own outbound connection to our listener.
pub struct Peer {
    id: String,
    generation: u64,
    state: watch::Sender<PeerState>,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

impl Peer {
    /// Register `id` and start dialing it in the background
    pub fn connect(id: String, generation: u64, cancel: CancellationToken) -> Self {
        Self::with_capacity(id, generation, cancel, OUTBOUND_CAPACITY)
    }

    /// Like [`Peer::connect`] with a custom outbound queue length
    pub fn with_capacity(
        id: String,
        generation: u64,
        cancel: CancellationToken,
        capacity: usize,
    ) -> Self {
        let (state, _) = watch::channel(PeerState::New);
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let peer = Self {
            id,
            generation,
            state,
            outbound,
            cancel,
        };
        tokio::spawn(run_connection(
            peer.id.clone(),
            peer.state.clone(),
            rx,
            peer.cancel.clone(),
        ));
        peer
    }

    /// Identity (`host:port`)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registry generation this peer was created in
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current state
    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    /// True once the connection is gone
    pub fn is_closed(&self) -> bool {
        self.state() == PeerState::Closed
    }

    /// Queue one line; false if the connection is closed or its queue is full
    pub fn send(&self, line: String) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(peer = %self.id, "Outbound queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the connection
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn run_connection(
    id: String,
    state: watch::Sender<PeerState>,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    state.send_replace(PeerState::Connecting);

    let stream = tokio::select! {
        _ = cancel.cancelled() => None,
        result = TcpStream::connect(&id) => match result {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::debug!(peer = %id, error = %e, "Peer connection failed");
                None
            }
        },
    };

    if let Some(stream) = stream {
        state.send_replace(PeerState::Connected);
        tracing::info!(peer = %id, "Peer connected");

        let mut sink = FramedWrite::new(stream, LinesCodec::new());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = rx.recv() => {
                    let Some(line) = line else { break };
                    if let Err(e) = sink.send(line).await {
                        tracing::debug!(peer = %id, error = %e, "Peer write failed");
                        break;
                    }
                }
            }
        }
    }

    state.send_replace(PeerState::Closed);
    tracing::debug!(peer = %id, "Peer closed");
}
