//! On-demand channel negotiation with fallback.
//!
//! The negotiator owns one [`LinkState`] machine per peer and interprets
//! its actions: opening candidates (with a per-attempt timeout), dropping
//! channels, arming backoff deadlines and forwarding notices.

use super::{Channel, Connector, TransportError, MAX_FRAME_SIZE};
use dashmap::DashMap;
use session_core::{ChannelKind, LinkAction, LinkEvent, LinkNotice, LinkState, TransferMode, TransferStats};
use session_types::UserId;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Default)]
struct PeerLink {
    state: LinkState,
    channel: Option<Box<dyn Channel>>,
    backoff_until: Option<Instant>,
}

/// Sends frames to peers over the most preferred channel that works.
pub struct ChannelNegotiator {
    connectors: HashMap<ChannelKind, Arc<dyn Connector>>,
    candidates: Vec<ChannelKind>,
    links: DashMap<UserId, Arc<Mutex<PeerLink>>>,
    modes: DashMap<UserId, TransferMode>,
    connect_timeout: Duration,
    notices: Option<mpsc::UnboundedSender<(UserId, LinkNotice)>>,
}

impl std::fmt::Debug for ChannelNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelNegotiator")
            .field("candidates", &self.candidates)
            .field("peers", &self.links.len())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ChannelNegotiator {
    /// Create a negotiator.
    ///
    /// `preference` orders the kinds to try; kinds without a connector are
    /// skipped.
    pub fn new(
        connectors: Vec<Arc<dyn Connector>>,
        preference: &[ChannelKind],
        connect_timeout: Duration,
    ) -> Self {
        let connectors: HashMap<_, _> = connectors.into_iter().map(|c| (c.kind(), c)).collect();
        let mut candidates: Vec<ChannelKind> = Vec::new();
        for kind in preference {
            if connectors.contains_key(kind) && !candidates.contains(kind) {
                candidates.push(*kind);
            }
        }
        Self {
            connectors,
            candidates,
            links: DashMap::new(),
            modes: DashMap::new(),
            connect_timeout,
            notices: None,
        }
    }

    /// Forward link notices to `tx`.
    pub fn with_notices(mut self, tx: mpsc::UnboundedSender<(UserId, LinkNotice)>) -> Self {
        self.notices = Some(tx);
        self
    }

    /// Candidate kinds in the order they are tried.
    pub fn candidates(&self) -> &[ChannelKind] {
        &self.candidates
    }

    fn link(&self, peer: &UserId) -> Arc<Mutex<PeerLink>> {
        self.links.entry(peer.clone()).or_default().value().clone()
    }

    /// Send one frame to `peer`, negotiating a channel if needed.
    ///
    /// # Errors
    ///
    /// - [`TransportError::FallbackExhausted`] when every candidate failed
    ///   and the backoff delay has not elapsed yet
    /// - [`TransportError::FrameTooLarge`] when `frame` exceeds
    ///   [`MAX_FRAME_SIZE`]; the link is left alone
    /// - the channel's own error when sending on an established channel
    ///   failed; the link is reset and the next send renegotiates
    pub async fn send(&self, peer: &UserId, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        let link = self.link(peer);
        let mut link = link.lock().await;

        self.ensure_established(peer, &mut link).await?;

        let result = match &link.channel {
            Some(channel) => channel.send(frame).await,
            None => Err(TransportError::ConnectionClosed),
        };
        if let Err(e) = &result {
            warn!(peer = %peer, error = %e, "Send failed, resetting link");
            self.drive(
                peer,
                &mut link,
                LinkEvent::SendFailed {
                    error: e.to_string(),
                },
            )
            .await;
        }
        result
    }

    async fn ensure_established(
        &self,
        peer: &UserId,
        link: &mut PeerLink,
    ) -> Result<(), TransportError> {
        match link.state {
            LinkState::Established { kind } => {
                if link.channel.as_ref().is_some_and(|c| c.is_open()) {
                    return Ok(());
                }
                debug!(peer = %peer, %kind, "Established channel went away");
                self.drive(
                    peer,
                    link,
                    LinkEvent::SendFailed {
                        error: "channel closed".into(),
                    },
                )
                .await;
                self.drive(peer, link, LinkEvent::ConnectRequested).await;
            }
            LinkState::Backoff { attempt } => match link.backoff_until {
                Some(until) if Instant::now() < until => {
                    return Err(TransportError::FallbackExhausted {
                        peer: peer.clone(),
                        attempt,
                    });
                }
                _ => self.drive(peer, link, LinkEvent::BackoffElapsed).await,
            },
            LinkState::Idle | LinkState::Negotiating { .. } => {
                self.drive(peer, link, LinkEvent::ConnectRequested).await;
            }
        }

        match link.state {
            LinkState::Established { .. } => Ok(()),
            LinkState::Backoff { attempt } => Err(TransportError::FallbackExhausted {
                peer: peer.clone(),
                attempt,
            }),
            LinkState::Idle | LinkState::Negotiating { .. } => Err(TransportError::ConnectionClosed),
        }
    }

    /// Feed `event` and every event caused by executing the resulting
    /// actions through the link machine.
    async fn drive(&self, peer: &UserId, link: &mut PeerLink, event: LinkEvent) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let (next, actions) = link.state.on_event(event, &self.candidates);
            link.state = next;
            for action in actions {
                match action {
                    LinkAction::TryCandidate { kind } => match self.try_open(peer, kind).await {
                        Ok(channel) => {
                            link.channel = Some(channel);
                            events.push_back(LinkEvent::CandidateSucceeded);
                        }
                        Err(e) => {
                            debug!(peer = %peer, %kind, error = %e, "Candidate failed");
                            events.push_back(LinkEvent::CandidateFailed {
                                error: e.to_string(),
                            });
                        }
                    },
                    LinkAction::DropChannel => {
                        if let Some(channel) = link.channel.take() {
                            channel.close().await;
                        }
                    }
                    LinkAction::StartBackoffTimer { delay } => {
                        link.backoff_until = Some(Instant::now() + delay);
                    }
                    LinkAction::Notify(notice) => self.notify(peer, notice),
                }
            }
        }
    }

    async fn try_open(
        &self,
        peer: &UserId,
        kind: ChannelKind,
    ) -> Result<Box<dyn Channel>, TransportError> {
        let connector = self
            .connectors
            .get(&kind)
            .ok_or_else(|| TransportError::ConnectionRefused(format!("no {kind} connector")))?;
        tokio::time::timeout(self.connect_timeout, connector.open(peer))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    fn notify(&self, peer: &UserId, notice: LinkNotice) {
        match &notice {
            LinkNotice::Established { kind } => {
                info!(peer = %peer, %kind, "Channel established");
                self.modes.insert(peer.clone(), TransferMode::new(*kind));
            }
            LinkNotice::FellBack { from, to, error } => {
                warn!(peer = %peer, %from, %to, %error, "Falling back to next channel kind");
            }
            LinkNotice::Exhausted { attempt } => {
                warn!(peer = %peer, attempt, "All channel kinds failed, backing off");
                self.modes.remove(peer);
            }
            LinkNotice::Reset { kind, error } => {
                warn!(peer = %peer, %kind, %error, "Channel reset");
                self.modes.remove(peer);
            }
        }
        if let Some(tx) = &self.notices {
            let _ = tx.send((peer.clone(), notice));
        }
    }

    /// The channel in use towards `peer` and its last transfer statistics.
    pub fn current_mode(&self, peer: &UserId) -> Option<TransferMode> {
        self.modes.get(peer).map(|mode| *mode.value())
    }

    /// Remember the statistics of a transfer to `peer`.
    pub fn record_transfer(&self, peer: &UserId, stats: TransferStats) {
        if let Some(mut mode) = self.modes.get_mut(peer) {
            mode.last_transfer = Some(stats);
        }
    }

    /// Current link state towards `peer`.
    pub async fn link_state(&self, peer: &UserId) -> LinkState {
        match self.links.get(peer).map(|entry| entry.value().clone()) {
            Some(link) => link.lock().await.state,
            None => LinkState::Idle,
        }
    }

    /// Drop the link to `peer`.
    pub async fn close(&self, peer: &UserId) {
        let link = self.links.remove(peer).map(|(_, link)| link);
        self.modes.remove(peer);
        if let Some(link) = link {
            let mut link = link.lock().await;
            self.drive(peer, &mut link, LinkEvent::CloseRequested).await;
        }
    }

    /// Drop every link.
    pub async fn close_all(&self) {
        let peers: Vec<UserId> = self.links.iter().map(|entry| entry.key().clone()).collect();
        for peer in peers {
            self.close(&peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockConnector;
    use async_trait::async_trait;

    fn peer() -> UserId {
        UserId::parse("bob@example.org/duet").unwrap()
    }

    fn negotiator(connectors: &[&MockConnector]) -> ChannelNegotiator {
        let list: Vec<Arc<dyn Connector>> = connectors
            .iter()
            .map(|c| Arc::new((*c).clone()) as Arc<dyn Connector>)
            .collect();
        ChannelNegotiator::new(
            list,
            &[ChannelKind::Direct, ChannelKind::HolePunched, ChannelKind::Relayed],
            Duration::from_millis(200),
        )
    }

    struct StallConnector;

    #[async_trait]
    impl Connector for StallConnector {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Direct
        }

        async fn open(&self, _peer: &UserId) -> Result<Box<dyn Channel>, TransportError> {
            std::future::pending().await
        }
    }

    // ===== Negotiation =====

    #[tokio::test]
    async fn uses_most_preferred_kind() {
        let direct = MockConnector::new(ChannelKind::Direct);
        let relayed = MockConnector::new(ChannelKind::Relayed);
        let neg = negotiator(&[&relayed, &direct]);

        neg.send(&peer(), b"hi").await.unwrap();
        assert_eq!(direct.open_count(), 1);
        assert_eq!(relayed.open_count(), 0);
        assert_eq!(
            neg.current_mode(&peer()).map(|m| m.channel),
            Some(ChannelKind::Direct)
        );
    }

    #[tokio::test]
    async fn oversized_frame_keeps_the_link() {
        let direct = MockConnector::new(ChannelKind::Direct);
        let neg = negotiator(&[&direct]);
        neg.send(&peer(), b"hi").await.unwrap();

        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            neg.send(&peer(), &big).await,
            Err(TransportError::FrameTooLarge(_))
        ));
        assert_eq!(
            neg.current_mode(&peer()).map(|m| m.channel),
            Some(ChannelKind::Direct)
        );
        neg.send(&peer(), b"again").await.unwrap();
        assert_eq!(direct.open_count(), 1);
    }

    #[tokio::test]
    async fn candidates_follow_preference_and_availability() {
        let relayed = MockConnector::new(ChannelKind::Relayed);
        let direct = MockConnector::new(ChannelKind::Direct);
        let neg = negotiator(&[&relayed, &direct]);
        assert_eq!(neg.candidates(), &[ChannelKind::Direct, ChannelKind::Relayed]);
    }

    #[tokio::test]
    async fn falls_back_when_preferred_kind_fails() {
        let direct = MockConnector::new(ChannelKind::Direct);
        let relayed = MockConnector::new(ChannelKind::Relayed);
        direct.set_refuse_all(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let neg = negotiator(&[&direct, &relayed]).with_notices(tx);

        neg.send(&peer(), b"hi").await.unwrap();

        let sent = relayed.last_channel().unwrap().sent_frames();
        assert_eq!(sent, vec![b"hi".to_vec()]);
        assert!(matches!(
            rx.recv().await,
            Some((_, LinkNotice::FellBack {
                from: ChannelKind::Direct,
                to: ChannelKind::Relayed,
                ..
            }))
        ));
        assert!(matches!(
            rx.recv().await,
            Some((_, LinkNotice::Established {
                kind: ChannelKind::Relayed
            }))
        ));
    }

    #[tokio::test]
    async fn established_channel_is_reused() {
        let direct = MockConnector::new(ChannelKind::Direct);
        let neg = negotiator(&[&direct]);
        neg.send(&peer(), b"1").await.unwrap();
        neg.send(&peer(), b"2").await.unwrap();
        assert_eq!(direct.open_count(), 1);
        assert_eq!(direct.last_channel().unwrap().sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn stalled_candidate_times_out_and_falls_back() {
        let relayed = MockConnector::new(ChannelKind::Relayed);
        let list: Vec<Arc<dyn Connector>> = vec![Arc::new(StallConnector), Arc::new(relayed.clone())];
        let neg = ChannelNegotiator::new(
            list,
            &[ChannelKind::Direct, ChannelKind::Relayed],
            Duration::from_millis(50),
        );
        neg.send(&peer(), b"hi").await.unwrap();
        assert_eq!(relayed.open_count(), 1);
    }

    // ===== Exhaustion and backoff =====

    #[tokio::test]
    async fn exhaustion_surfaces_fallback_exhausted() {
        let direct = MockConnector::new(ChannelKind::Direct);
        let relayed = MockConnector::new(ChannelKind::Relayed);
        direct.set_refuse_all(true);
        relayed.set_refuse_all(true);
        let neg = negotiator(&[&direct, &relayed]);

        let err = neg.send(&peer(), b"hi").await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::FallbackExhausted { attempt: 1, .. }
        ));
        assert!(!err.is_transient());
        assert!(neg.link_state(&peer()).await.is_backing_off());
        assert!(neg.current_mode(&peer()).is_none());
    }

    #[tokio::test]
    async fn no_reconnect_attempts_during_backoff() {
        let direct = MockConnector::new(ChannelKind::Direct);
        direct.set_refuse_all(true);
        let neg = negotiator(&[&direct]);

        assert!(neg.send(&peer(), b"1").await.is_err());
        direct.set_refuse_all(false);
        assert!(matches!(
            neg.send(&peer(), b"2").await,
            Err(TransportError::FallbackExhausted { .. })
        ));
        assert_eq!(direct.open_count(), 0);
    }

    // ===== Send failures =====

    #[tokio::test]
    async fn send_failure_is_transient_and_renegotiates() {
        let direct = MockConnector::new(ChannelKind::Direct);
        let neg = negotiator(&[&direct]);
        neg.send(&peer(), b"1").await.unwrap();

        direct.last_channel().unwrap().fail_next_send("reset");
        let err = neg.send(&peer(), b"2").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(neg.link_state(&peer()).await, LinkState::Idle);

        neg.send(&peer(), b"3").await.unwrap();
        assert_eq!(direct.open_count(), 2);
        assert_eq!(
            direct.last_channel().unwrap().sent_frames(),
            vec![b"3".to_vec()]
        );
    }

    #[tokio::test]
    async fn record_transfer_updates_mode() {
        let direct = MockConnector::new(ChannelKind::Direct);
        let neg = negotiator(&[&direct]);
        neg.send(&peer(), b"1").await.unwrap();

        let stats = TransferStats::compute(100, 100, Duration::from_secs(1));
        neg.record_transfer(&peer(), stats);
        assert_eq!(
            neg.current_mode(&peer()).unwrap().last_transfer,
            Some(stats)
        );
    }

    #[tokio::test]
    async fn close_drops_channel_and_mode() {
        let direct = MockConnector::new(ChannelKind::Direct);
        let neg = negotiator(&[&direct]);
        neg.send(&peer(), b"1").await.unwrap();
        let channel = direct.last_channel().unwrap();

        neg.close_all().await;
        assert!(!channel.is_open());
        assert!(neg.current_mode(&peer()).is_none());
        assert_eq!(neg.link_state(&peer()).await, LinkState::Idle);
    }
}
