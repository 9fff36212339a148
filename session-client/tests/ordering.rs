//! Gap repair against a scripted host.
//!
//! The host side is driven by hand so batches can be dropped and
//! reordered on purpose.

mod common;

use common::{user, Peer, WAIT};
use session_client::{Channel, Connector, MemoryNetwork, SessionEvent};
use session_core::ChannelKind;
use session_types::{
    Activity, ActivityBatch, ActivityKind, ActivityRegistry, Envelope, Invitation, InvitationId,
    ParticipantInfo, PeerMessage, ReferencePointId, ReferencePointSnapshot, ResourcePath, Role,
    SessionId, SessionPath, StopReason, TimedActivity, Timestamp, UserId, Welcome,
};
use tokio::sync::mpsc;

struct ScriptedHost {
    id: UserId,
    session_id: SessionId,
    reference_point: ReferencePointId,
    registry: ActivityRegistry,
    channel: Box<dyn Channel>,
    inbox: mpsc::UnboundedReceiver<session_client::Inbound>,
}

impl ScriptedHost {
    async fn send(&self, message: PeerMessage) {
        self.channel.send(&message.to_bytes().unwrap()).await.unwrap();
    }

    async fn next_message(&mut self) -> PeerMessage {
        let inbound = tokio::time::timeout(WAIT, self.inbox.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("inbox closed");
        PeerMessage::from_bytes(&inbound.frame).unwrap()
    }

    fn created(&self, name: &str, timestamp: u64) -> TimedActivity {
        TimedActivity::new(
            Activity::new(
                self.id.clone(),
                ActivityKind::FileCreated {
                    path: ResourcePath::new(self.reference_point, SessionPath::parse(name).unwrap()),
                    content: name.as_bytes().to_vec(),
                },
            ),
            Timestamp::new(timestamp),
        )
    }

    async fn send_batch(&self, activities: Vec<TimedActivity>) {
        let envelope = Envelope::new(self.session_id, activities)
            .encode(&self.registry)
            .unwrap();
        self.send(PeerMessage::Activities(ActivityBatch { envelope }))
            .await;
    }
}

/// Bring `guest` into a session run by a scripted host.
async fn scripted_session(net: &MemoryNetwork, guest: &mut Peer) -> ScriptedHost {
    let id = user("host");
    let inbox = net.join(id.clone());
    let channel = net
        .connector(id.clone(), ChannelKind::Direct)
        .open(&guest.id)
        .await
        .unwrap();
    let mut host = ScriptedHost {
        id: id.clone(),
        session_id: SessionId::new(),
        reference_point: ReferencePointId::new(),
        registry: ActivityRegistry::standard(),
        channel,
        inbox,
    };

    let invitation_id = InvitationId::new();
    host.send(PeerMessage::Invitation(Invitation {
        invitation_id,
        session_id: host.session_id,
        host: id.clone(),
        inviter: id.clone(),
        invitee: guest.id.clone(),
        description: "scripted".into(),
        reference_points: vec![],
        participants: vec![],
    }))
    .await;
    guest
        .expect_event(|e| matches!(e, SessionEvent::InvitationReceived(_)))
        .await;

    let handle = guest.handle.clone();
    let workspace = guest.workspace();
    let accepting =
        tokio::spawn(async move { handle.accept_invitation_into(invitation_id, workspace).await });

    assert!(matches!(
        host.next_message().await,
        PeerMessage::InvitationAccepted(_)
    ));
    host.send(PeerMessage::Welcome(Welcome {
        session_id: host.session_id,
        host: id.clone(),
        participants: vec![
            ParticipantInfo {
                user: id,
                role: Role::Host,
            },
            ParticipantInfo {
                user: guest.id.clone(),
                role: Role::Observer,
            },
        ],
        reference_points: vec![ReferencePointSnapshot {
            id: host.reference_point,
            name: "proj".into(),
            folders: vec![],
            files: vec![],
        }],
        next_timestamp: Timestamp::first(),
    }))
    .await;
    accepting.await.unwrap().unwrap();
    host
}

#[tokio::test]
async fn gap_is_repaired_by_retransmission() {
    let net = MemoryNetwork::new();
    let mut bob = Peer::spawn(&net, "bob");
    let mut host = scripted_session(&net, &mut bob).await;

    // Timestamp 1 is "lost".
    host.send_batch(vec![host.created("two", 2), host.created("three", 3)])
        .await;

    let PeerMessage::RetransmitRequest(request) = host.next_message().await else {
        panic!("expected a retransmit request");
    };
    assert_eq!(request.session_id, host.session_id);
    assert_eq!(request.from, Timestamp::new(1));
    assert_eq!(request.to, Timestamp::new(1));
    assert!(!bob.fs_has("/bob/ws/proj/two"));

    host.send_batch(vec![host.created("one", 1)]).await;

    bob.wait_for_file("/bob/ws/proj/one", b"one").await;
    bob.wait_for_file("/bob/ws/proj/two", b"two").await;
    bob.wait_for_file("/bob/ws/proj/three", b"three").await;
    bob.wait_for_status("caught up", |s| s.next_expected == Some(Timestamp::new(4)))
        .await;
}

#[tokio::test]
async fn applied_in_timestamp_order() {
    let net = MemoryNetwork::new();
    let mut bob = Peer::spawn(&net, "bob");
    let host = scripted_session(&net, &mut bob).await;

    host.send_batch(vec![host.created("second", 2)]).await;
    host.send_batch(vec![host.created("first", 1)]).await;

    let mut applied = Vec::new();
    while applied.len() < 2 {
        if let SessionEvent::ActivityApplied { timestamp, .. } = bob
            .expect_event(|e| matches!(e, SessionEvent::ActivityApplied { .. }))
            .await
        {
            applied.push(timestamp);
        }
    }
    assert_eq!(applied, vec![Timestamp::new(1), Timestamp::new(2)]);
}

#[tokio::test]
async fn redelivered_batch_is_ignored() {
    let net = MemoryNetwork::new();
    let mut bob = Peer::spawn(&net, "bob");
    let host = scripted_session(&net, &mut bob).await;

    host.send_batch(vec![host.created("one", 1)]).await;
    host.send_batch(vec![host.created("one", 1), host.created("two", 2)])
        .await;

    bob.wait_for_file("/bob/ws/proj/two", b"two").await;
    bob.wait_for_status("two applied", |s| s.next_expected == Some(Timestamp::new(3)))
        .await;
}

#[tokio::test]
async fn unrepaired_gap_stops_the_session() {
    let net = MemoryNetwork::new();
    let mut bob = Peer::spawn(&net, "bob");
    let mut host = scripted_session(&net, &mut bob).await;

    host.send_batch(vec![host.created("two", 2)]).await;
    assert!(matches!(
        host.next_message().await,
        PeerMessage::RetransmitRequest(_)
    ));

    // No answer: the second timeout ends the session.
    assert_eq!(
        bob.expect_event(|e| matches!(e, SessionEvent::SessionStopped { .. }))
            .await,
        SessionEvent::SessionStopped {
            reason: StopReason::LocalError
        }
    );
    let PeerMessage::SessionEnded(ended) = host.next_message().await else {
        panic!("expected a session-end notice");
    };
    assert_eq!(ended.reason, StopReason::LocalError);
    assert!(!bob.fs_has("/bob/ws/proj/two"));
}

#[tokio::test]
async fn frames_from_non_host_are_ignored() {
    let net = MemoryNetwork::new();
    let mut bob = Peer::spawn(&net, "bob");
    let host = scripted_session(&net, &mut bob).await;

    let mallory = user("mallory");
    let _mallory_inbox = net.join(mallory.clone());
    let channel = net
        .connector(mallory.clone(), ChannelKind::Direct)
        .open(&bob.id)
        .await
        .unwrap();
    let forged = Envelope::new(host.session_id, vec![host.created("forged", 1)])
        .encode(&host.registry)
        .unwrap();
    channel
        .send(
            &PeerMessage::Activities(ActivityBatch { envelope: forged })
                .to_bytes()
                .unwrap(),
        )
        .await
        .unwrap();

    host.send_batch(vec![host.created("real", 1)]).await;
    bob.wait_for_file("/bob/ws/proj/real", b"real").await;
    assert!(!bob.fs_has("/bob/ws/proj/forged"));
}
