//! Mock channel for testing.
//!
//! Captures sent frames for verification and allows injecting failures.

use super::{Channel, Connector, TransportError};
use async_trait::async_trait;
use session_core::ChannelKind;
use session_types::UserId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mock channel for testing.
///
/// Clones share state, so a test can keep one handle while the code under
/// test owns another.
#[derive(Debug, Clone)]
pub struct MockChannel {
    kind: ChannelKind,
    inner: Arc<Mutex<MockChannelInner>>,
}

#[derive(Debug, Default)]
struct MockChannelInner {
    closed: bool,
    sent_frames: Vec<Vec<u8>>,
    fail_next_send: Option<String>,
    fail_all_sends: Option<String>,
}

impl MockChannel {
    /// Create an open mock channel of the given kind.
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            inner: Arc::new(Mutex::new(MockChannelInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get all frames that were sent.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.lock().sent_frames.clone()
    }

    /// Get the last frame that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.lock().sent_frames.last().cloned()
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Cause every send() to fail until [`MockChannel::heal`].
    pub fn break_channel(&self, error: &str) {
        self.lock().fail_all_sends = Some(error.to_string());
    }

    /// Undo [`MockChannel::break_channel`].
    pub fn heal(&self) {
        self.lock().fail_all_sends = None;
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }
        if let Some(error) = &inner.fail_all_sends {
            return Err(TransportError::SendFailed(error.clone()));
        }

        inner.sent_frames.push(frame.to_vec());
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.lock().closed
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

/// Connector handing out [`MockChannel`]s.
#[derive(Debug, Clone)]
pub struct MockConnector {
    kind: ChannelKind,
    inner: Arc<Mutex<MockConnectorInner>>,
}

#[derive(Debug, Default)]
struct MockConnectorInner {
    opened: Vec<(UserId, MockChannel)>,
    fail_next_open: Option<String>,
    refuse_all: bool,
}

impl MockConnector {
    /// Create a connector of the given kind.
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            inner: Arc::new(Mutex::new(MockConnectorInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockConnectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cause the next open() to fail with the given error.
    pub fn fail_next_open(&self, error: &str) {
        self.lock().fail_next_open = Some(error.to_string());
    }

    /// Refuse (or stop refusing) every open().
    pub fn set_refuse_all(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    /// Number of channels opened so far.
    pub fn open_count(&self) -> usize {
        self.lock().opened.len()
    }

    /// The most recently opened channel.
    pub fn last_channel(&self) -> Option<MockChannel> {
        self.lock().opened.last().map(|(_, ch)| ch.clone())
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn open(&self, peer: &UserId) -> Result<Box<dyn Channel>, TransportError> {
        let mut inner = self.lock();

        if let Some(error) = inner.fail_next_open.take() {
            return Err(TransportError::ConnectionRefused(error));
        }
        if inner.refuse_all {
            return Err(TransportError::ConnectionRefused(format!(
                "{} refused",
                self.kind
            )));
        }

        let channel = MockChannel::new(self.kind);
        inner.opened.push((peer.clone(), channel.clone()));
        Ok(Box::new(channel))
    }
}
