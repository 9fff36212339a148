//! Per-peer outbound queues.
//!
//! Each peer gets a sender task draining an unbounded frame queue, so a slow
//! or renegotiating link never blocks the session actor. A task that gives
//! up reports a [`PeerFailure`] and exits; the next frame for that peer
//! starts a fresh task. Frames over [`MAX_FRAME_SIZE`] leave as a chunked
//! transfer.

use crate::transport::{split_frame, ChannelNegotiator, TransportError, MAX_FRAME_SIZE};
use session_types::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Pause before retrying a transient send failure.
const RETRY_DELAY: Duration = Duration::from_millis(25);

/// A peer that could not be reached.
#[derive(Debug)]
pub(crate) struct PeerFailure {
    pub peer: UserId,
    pub error: TransportError,
}

struct Queue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

pub(crate) struct PeerSenders {
    negotiator: Arc<ChannelNegotiator>,
    queues: HashMap<UserId, Queue>,
    failures: mpsc::UnboundedSender<PeerFailure>,
    retries: u32,
    chunk_size: usize,
}

impl PeerSenders {
    pub fn new(
        negotiator: Arc<ChannelNegotiator>,
        failures: mpsc::UnboundedSender<PeerFailure>,
        retries: u32,
        chunk_size: usize,
    ) -> Self {
        Self {
            negotiator,
            queues: HashMap::new(),
            failures,
            retries,
            chunk_size,
        }
    }

    /// Queue `frame` for `peer`.
    pub fn send(&mut self, peer: &UserId, frame: Vec<u8>) {
        let frame = match self.queues.get(peer) {
            Some(queue) if !queue.task.is_finished() => match queue.tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            _ => frame,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(frame);
        let task = tokio::spawn(drain_queue(
            Arc::clone(&self.negotiator),
            peer.clone(),
            rx,
            self.failures.clone(),
            self.retries,
            self.chunk_size,
        ));
        self.queues.insert(peer.clone(), Queue { tx, task });
    }

    /// Drop everything queued for `peer`.
    pub fn cancel(&mut self, peer: &UserId) {
        if let Some(queue) = self.queues.remove(peer) {
            queue.task.abort();
        }
    }

    /// Drop everything queued for every peer.
    pub fn cancel_all(&mut self) {
        for (_, queue) in self.queues.drain() {
            queue.task.abort();
        }
    }

    /// Stop accepting frames for `peer`; what is already queued still goes
    /// out.
    pub fn finish(&mut self, peer: &UserId) {
        self.queues.remove(peer);
    }
}

impl Drop for PeerSenders {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn drain_queue(
    negotiator: Arc<ChannelNegotiator>,
    peer: UserId,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    failures: mpsc::UnboundedSender<PeerFailure>,
    retries: u32,
    chunk_size: usize,
) {
    while let Some(frame) = rx.recv().await {
        let frames = if frame.len() > MAX_FRAME_SIZE {
            match split_frame(&frame, chunk_size) {
                Ok(chunks) => {
                    debug!(peer = %peer, size = frame.len(), chunks = chunks.len(), "Chunking oversized frame");
                    chunks
                }
                Err(e) => {
                    error!(peer = %peer, error = %e, "Dropping frame that cannot be chunked");
                    continue;
                }
            }
        } else {
            vec![frame]
        };

        for frame in &frames {
            match send_with_retries(&negotiator, &peer, frame, retries).await {
                Ok(()) => {}
                // Not the link's fault; the peer stays.
                Err(e @ (TransportError::FrameTooLarge(_) | TransportError::Wire(_))) => {
                    error!(peer = %peer, error = %e, "Dropping unsendable frame");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Giving up on peer");
                    let _ = failures.send(PeerFailure { peer, error: e });
                    return;
                }
            }
        }
    }
}

async fn send_with_retries(
    negotiator: &ChannelNegotiator,
    peer: &UserId,
    frame: &[u8],
    retries: u32,
) -> Result<(), TransportError> {
    let mut attempt = 0;
    loop {
        match negotiator.send(peer, frame).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                debug!(peer = %peer, attempt, error = %e, "Retrying send");
                tokio::time::sleep(RETRY_DELAY * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
