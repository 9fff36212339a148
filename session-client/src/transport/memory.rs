//! In-process network for tests and simulation.
//!
//! Every participant joins the hub and gets an inbox. Connectors of any
//! [`ChannelKind`] deliver straight into the peer's inbox. Failures are
//! injected per kind (the kind is refused everywhere) or per user (the user
//! is offline and nothing reaches it).

use super::{Channel, Connector, Inbound, TransportError, MAX_FRAME_SIZE};
use async_trait::async_trait;
use session_core::ChannelKind;
use session_types::UserId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Hub {
    inboxes: HashMap<UserId, mpsc::UnboundedSender<Inbound>>,
    refused: HashSet<ChannelKind>,
    offline: HashSet<UserId>,
}

/// In-process hub connecting any number of participants.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `user` and return its inbox. Rejoining replaces the old inbox.
    pub fn join(&self, user: UserId) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.lock();
        hub.offline.remove(&user);
        hub.inboxes.insert(user, tx);
        rx
    }

    /// Detach `user` for good.
    pub fn leave(&self, user: &UserId) {
        self.lock().inboxes.remove(user);
    }

    /// A connector of `kind` sending as `local`.
    pub fn connector(&self, local: UserId, kind: ChannelKind) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            local,
            kind,
        }
    }

    /// One connector per kind, in the given order.
    pub fn connectors(&self, local: &UserId, kinds: &[ChannelKind]) -> Vec<Arc<dyn Connector>> {
        kinds
            .iter()
            .map(|&kind| Arc::new(self.connector(local.clone(), kind)) as Arc<dyn Connector>)
            .collect()
    }

    /// Make every open and send of `kind` fail.
    pub fn refuse_kind(&self, kind: ChannelKind) {
        self.lock().refused.insert(kind);
    }

    /// Undo [`MemoryNetwork::refuse_kind`].
    pub fn allow_kind(&self, kind: ChannelKind) {
        self.lock().refused.remove(&kind);
    }

    /// Take `user` offline: nothing reaches it and it reaches nobody.
    pub fn disconnect(&self, user: &UserId) {
        self.lock().offline.insert(user.clone());
    }

    /// Bring `user` back online.
    pub fn reconnect(&self, user: &UserId) {
        self.lock().offline.remove(user);
    }

    fn check_route(
        &self,
        from: &UserId,
        to: &UserId,
        kind: ChannelKind,
    ) -> Result<mpsc::UnboundedSender<Inbound>, TransportError> {
        let hub = self.lock();
        if hub.refused.contains(&kind) {
            return Err(TransportError::ConnectionRefused(format!("{kind} refused")));
        }
        if hub.offline.contains(from) || hub.offline.contains(to) {
            return Err(TransportError::ConnectionRefused(format!("{to} unreachable")));
        }
        hub.inboxes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionRefused(format!("{to} not on network")))
    }
}

/// Opens [`MemoryNetwork`] channels of one kind.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    local: UserId,
    kind: ChannelKind,
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn open(&self, peer: &UserId) -> Result<Box<dyn Channel>, TransportError> {
        self.network.check_route(&self.local, peer, self.kind)?;
        Ok(Box::new(MemoryChannel {
            network: self.network.clone(),
            local: self.local.clone(),
            peer: peer.clone(),
            kind: self.kind,
            open: AtomicBool::new(true),
        }))
    }
}

#[derive(Debug)]
struct MemoryChannel {
    network: MemoryNetwork,
    local: UserId,
    peer: UserId,
    kind: ChannelKind,
    open: AtomicBool,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        let inbox = self
            .network
            .check_route(&self.local, &self.peer, self.kind)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        inbox
            .send(Inbound {
                from: self.local.clone(),
                frame: frame.to_vec(),
            })
            .map_err(|_| TransportError::SendFailed(format!("{} inbox closed", self.peer)))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
