//! Chunked bulk transfers.
//!
//! Large payloads (the late-joiner snapshot) are split into
//! [`TransferChunk`] frames and sent from a spawned task, so a monitor can
//! poll progress and cancel between chunks. Any other frame over
//! [`MAX_FRAME_SIZE`] goes through [`split_frame`] on its outbound queue.

use super::{ChannelNegotiator, TransportError, MAX_FRAME_SIZE};
use session_core::TransferState;
use session_types::{
    PeerMessage, TransferCancelled, TransferChunk, TransferId, UserId, WireError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Room left in a frame for the chunk envelope.
const CHUNK_OVERHEAD: usize = 1024;

/// Largest chunk payload that still fits a frame. Chunk bytes are encoded
/// one element each, so a byte may take two.
const MAX_CHUNK: usize = (MAX_FRAME_SIZE - CHUNK_OVERHEAD) / 2;

/// Split an encoded frame into [`TransferChunk`] frames of at most
/// `chunk_size` payload bytes each.
///
/// The receiver reassembles them with [`IncomingTransfers`] and decodes the
/// result as the original frame.
pub fn split_frame(frame: &[u8], chunk_size: usize) -> Result<Vec<Vec<u8>>, WireError> {
    let id = TransferId::new();
    let chunk_size = chunk_size.clamp(1, MAX_CHUNK);
    let total_size = frame.len() as u64;
    frame
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, data)| {
            PeerMessage::TransferChunk(TransferChunk {
                transfer_id: id,
                total_size,
                offset: (i * chunk_size) as u64,
                data: data.to_vec(),
            })
            .to_bytes()
        })
        .collect()
}

/// A transfer whose progress can be polled.
pub trait FileTransfer: Send + Sync {
    /// Declared payload size.
    fn file_size(&self) -> u64;

    /// Bytes handed to the channel so far.
    fn amount_written(&self) -> u64;

    /// Channel-reported state.
    fn state(&self) -> TransferState;

    /// Whether the transfer stopped moving.
    fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Ask the transfer to stop after the current chunk.
    fn cancel(&self);
}

#[derive(Debug)]
struct Progress {
    written: AtomicU64,
    cancel: AtomicBool,
    state: Mutex<TransferState>,
}

impl Progress {
    fn set_state(&self, state: TransferState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> TransferState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A payload being sent to one peer.
#[derive(Debug)]
pub struct OutgoingTransfer {
    id: TransferId,
    peer: UserId,
    size: u64,
    progress: Arc<Progress>,
}

impl OutgoingTransfer {
    /// Start sending `payload` to `peer` in chunks of `chunk_size` bytes.
    ///
    /// An empty payload is sent as a single empty chunk.
    pub fn start(
        negotiator: Arc<ChannelNegotiator>,
        peer: UserId,
        payload: Vec<u8>,
        chunk_size: usize,
    ) -> Self {
        let id = TransferId::new();
        let size = payload.len() as u64;
        let progress = Arc::new(Progress {
            written: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            state: Mutex::new(TransferState::InProgress),
        });
        let chunk_size = chunk_size.clamp(1, MAX_CHUNK);

        tokio::spawn(run_transfer(
            negotiator,
            id,
            peer.clone(),
            payload,
            chunk_size,
            Arc::clone(&progress),
        ));

        Self {
            id,
            peer,
            size,
            progress,
        }
    }

    /// Transfer handle.
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Receiving peer.
    pub fn peer(&self) -> &UserId {
        &self.peer
    }
}

impl FileTransfer for OutgoingTransfer {
    fn file_size(&self) -> u64 {
        self.size
    }

    fn amount_written(&self) -> u64 {
        self.progress.written.load(Ordering::SeqCst)
    }

    fn state(&self) -> TransferState {
        self.progress.state()
    }

    fn cancel(&self) {
        self.progress.cancel.store(true, Ordering::SeqCst);
    }
}

async fn run_transfer(
    negotiator: Arc<ChannelNegotiator>,
    id: TransferId,
    peer: UserId,
    payload: Vec<u8>,
    chunk_size: usize,
    progress: Arc<Progress>,
) {
    let total_size = payload.len() as u64;
    let mut offset = 0usize;
    loop {
        if progress.cancel.load(Ordering::SeqCst) {
            debug!(transfer = %id, peer = %peer, offset, "Transfer cancelled");
            let notice = PeerMessage::TransferCancelled(TransferCancelled { transfer_id: id });
            if let Ok(frame) = notice.to_bytes() {
                let _ = negotiator.send(&peer, &frame).await;
            }
            progress.set_state(TransferState::Cancelled);
            return;
        }

        let end = (offset + chunk_size).min(payload.len());
        let chunk = PeerMessage::TransferChunk(TransferChunk {
            transfer_id: id,
            total_size,
            offset: offset as u64,
            data: payload[offset..end].to_vec(),
        });
        let sent = match chunk.to_bytes() {
            Ok(frame) => negotiator.send(&peer, &frame).await,
            Err(e) => Err(TransportError::from(e)),
        };
        if let Err(e) = sent {
            warn!(transfer = %id, peer = %peer, error = %e, "Transfer failed");
            let state = match e {
                TransportError::FallbackExhausted { .. } => TransferState::Refused,
                _ => TransferState::Error,
            };
            progress.set_state(state);
            return;
        }

        progress.written.store(end as u64, Ordering::SeqCst);
        offset = end;
        if offset >= payload.len() {
            progress.set_state(TransferState::Complete);
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[derive(Debug)]
struct Partial {
    total_size: u64,
    data: Vec<u8>,
}

/// Reassembles incoming transfers.
#[derive(Debug, Default)]
pub struct IncomingTransfers {
    partial: HashMap<(UserId, TransferId), Partial>,
}

impl IncomingTransfers {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk; returns the whole payload once the last chunk arrived.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Protocol`] when a chunk does not continue
    /// where the previous one ended. The partial payload is discarded.
    pub fn on_chunk(
        &mut self,
        from: &UserId,
        chunk: TransferChunk,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let key = (from.clone(), chunk.transfer_id);
        let partial = self.partial.entry(key.clone()).or_insert_with(|| Partial {
            total_size: chunk.total_size,
            data: Vec::new(),
        });

        if chunk.offset != partial.data.len() as u64 || chunk.total_size != partial.total_size {
            self.partial.remove(&key);
            return Err(TransportError::Protocol(format!(
                "transfer {} chunk at {} out of order",
                chunk.transfer_id, chunk.offset
            )));
        }

        partial.data.extend_from_slice(&chunk.data);
        if partial.data.len() as u64 > partial.total_size {
            self.partial.remove(&key);
            return Err(TransportError::Protocol(format!(
                "transfer {} exceeds declared size",
                chunk.transfer_id
            )));
        }
        if partial.data.len() as u64 == partial.total_size {
            return Ok(self.partial.remove(&key).map(|p| p.data));
        }
        Ok(None)
    }

    /// Forget a transfer the sender abandoned. Returns whether it was known.
    pub fn cancel(&mut self, from: &UserId, id: TransferId) -> bool {
        self.partial.remove(&(from.clone(), id)).is_some()
    }

    /// Number of transfers in flight.
    pub fn len(&self) -> usize {
        self.partial.len()
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, MockConnector};
    use session_core::ChannelKind;
    use std::time::Duration;

    fn peer() -> UserId {
        UserId::parse("bob@example.org/duet").unwrap()
    }

    fn negotiator(connector: &MockConnector) -> Arc<ChannelNegotiator> {
        let list: Vec<Arc<dyn Connector>> = vec![Arc::new(connector.clone())];
        Arc::new(ChannelNegotiator::new(
            list,
            &[ChannelKind::Direct],
            Duration::from_millis(100),
        ))
    }

    async fn wait_done(transfer: &OutgoingTransfer) {
        for _ in 0..200 {
            if transfer.is_done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transfer never finished");
    }

    fn chunks(frames: Vec<Vec<u8>>) -> Vec<TransferChunk> {
        frames
            .into_iter()
            .filter_map(|f| match PeerMessage::from_bytes(&f).unwrap() {
                PeerMessage::TransferChunk(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    // ===== Outgoing =====

    #[tokio::test]
    async fn sends_payload_in_chunks() {
        let connector = MockConnector::new(ChannelKind::Direct);
        let payload: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let transfer = OutgoingTransfer::start(negotiator(&connector), peer(), payload.clone(), 300);
        wait_done(&transfer).await;

        assert_eq!(transfer.state(), TransferState::Complete);
        assert_eq!(transfer.amount_written(), 1000);
        assert_eq!(transfer.file_size(), 1000);

        let sent = chunks(connector.last_channel().unwrap().sent_frames());
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].offset, 900);

        let mut incoming = IncomingTransfers::new();
        let mut result = None;
        for chunk in sent {
            result = incoming.on_chunk(&peer(), chunk).unwrap();
        }
        assert_eq!(result, Some(payload));
        assert!(incoming.is_empty());
    }

    #[tokio::test]
    async fn empty_payload_is_one_empty_chunk() {
        let connector = MockConnector::new(ChannelKind::Direct);
        let transfer = OutgoingTransfer::start(negotiator(&connector), peer(), Vec::new(), 64);
        wait_done(&transfer).await;

        assert_eq!(transfer.state(), TransferState::Complete);
        let sent = chunks(connector.last_channel().unwrap().sent_frames());
        assert_eq!(sent.len(), 1);
        assert!(sent[0].data.is_empty());
    }

    #[tokio::test]
    async fn unreachable_peer_is_refused() {
        let connector = MockConnector::new(ChannelKind::Direct);
        connector.set_refuse_all(true);
        let transfer = OutgoingTransfer::start(negotiator(&connector), peer(), vec![1; 10], 4);
        wait_done(&transfer).await;
        assert_eq!(transfer.state(), TransferState::Refused);
        assert_eq!(transfer.amount_written(), 0);
    }

    #[tokio::test]
    async fn cancel_before_start_sends_cancel_notice() {
        let connector = MockConnector::new(ChannelKind::Direct);
        // Establish the channel first so the notice has somewhere to go
        let neg = negotiator(&connector);
        neg.send(&peer(), b"warmup").await.unwrap();

        let transfer = OutgoingTransfer::start(Arc::clone(&neg), peer(), vec![0; 10], 1);
        transfer.cancel();
        wait_done(&transfer).await;

        assert_eq!(transfer.state(), TransferState::Cancelled);
        let frames = connector.last_channel().unwrap().sent_frames();
        let last = PeerMessage::from_bytes(frames.last().unwrap()).unwrap();
        assert!(matches!(last, PeerMessage::TransferCancelled(_)));
    }

    // ===== Split frames =====

    #[test]
    fn oversized_frame_splits_into_fitting_chunks() {
        // High bytes take two bytes each once encoded.
        let frame = vec![0xffu8; MAX_FRAME_SIZE * 2 + 17];
        let frames = split_frame(&frame, usize::MAX).unwrap();
        assert_eq!(frames.len(), (frame.len() + MAX_CHUNK - 1) / MAX_CHUNK);
        assert!(frames.iter().all(|f| f.len() <= MAX_FRAME_SIZE));

        let mut incoming = IncomingTransfers::new();
        let mut result = None;
        for chunk in chunks(frames) {
            assert!(result.is_none());
            result = incoming.on_chunk(&peer(), chunk).unwrap();
        }
        assert_eq!(result, Some(frame));
    }

    #[test]
    fn split_frame_keeps_message_intact() {
        let message = PeerMessage::TransferCancelled(TransferCancelled {
            transfer_id: TransferId::new(),
        });
        let frame = message.to_bytes().unwrap();
        let frames = split_frame(&frame, 3).unwrap();
        assert!(frames.len() > 1);

        let mut incoming = IncomingTransfers::new();
        let whole = chunks(frames)
            .into_iter()
            .find_map(|c| incoming.on_chunk(&peer(), c).unwrap())
            .unwrap();
        assert_eq!(PeerMessage::from_bytes(&whole).unwrap(), message);
    }

    // ===== Incoming =====

    #[test]
    fn out_of_order_chunk_discards_partial() {
        let mut incoming = IncomingTransfers::new();
        let id = TransferId::new();
        let first = TransferChunk {
            transfer_id: id,
            total_size: 4,
            offset: 0,
            data: vec![1, 2],
        };
        let skipped = TransferChunk {
            transfer_id: id,
            total_size: 4,
            offset: 3,
            data: vec![4],
        };
        assert_eq!(incoming.on_chunk(&peer(), first).unwrap(), None);
        assert!(incoming.on_chunk(&peer(), skipped).is_err());
        assert!(incoming.is_empty());
    }

    #[test]
    fn cancel_forgets_partial() {
        let mut incoming = IncomingTransfers::new();
        let id = TransferId::new();
        let chunk = TransferChunk {
            transfer_id: id,
            total_size: 10,
            offset: 0,
            data: vec![0; 5],
        };
        incoming.on_chunk(&peer(), chunk).unwrap();
        assert_eq!(incoming.len(), 1);
        assert!(incoming.cancel(&peer(), id));
        assert!(!incoming.cancel(&peer(), id));
    }

    #[test]
    fn empty_transfer_completes_immediately() {
        let mut incoming = IncomingTransfers::new();
        let chunk = TransferChunk {
            transfer_id: TransferId::new(),
            total_size: 0,
            offset: 0,
            data: vec![],
        };
        assert_eq!(incoming.on_chunk(&peer(), chunk).unwrap(), Some(vec![]));
    }
}
