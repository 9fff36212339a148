//! Shared helpers for session integration tests.

#![allow(dead_code)]

use session_client::{
    spawn, ClientConfig, HostFileSystem, MemoryFileSystem, MemoryNetwork, SessionEvent,
    SessionHandle, SessionOptions, SessionStatus, Subscription,
};
use session_core::ChannelKind;
use session_types::{InvitationId, UserId};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How long any single wait may take before the test fails.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn user(name: &str) -> UserId {
    UserId::parse(format!("{name}@example.org/duet")).unwrap()
}

/// Short timers so tests run fast.
pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.session.batch_window_ms = 5;
    config.session.gap_timeout_ms = 100;
    config.transport.connect_timeout_ms = 200;
    config.transport.monitor_interval_ms = 10;
    config.transport.send_retries = 1;
    config
}

/// One participant: actor handle, its own file system and an event stream.
pub struct Peer {
    pub id: UserId,
    pub handle: SessionHandle,
    pub fs: MemoryFileSystem,
    pub events: Subscription,
}

impl Peer {
    pub fn spawn(net: &MemoryNetwork, name: &str) -> Self {
        Self::spawn_with(net, name, &[ChannelKind::Direct, ChannelKind::Relayed], fast_config())
    }

    pub fn spawn_with(
        net: &MemoryNetwork,
        name: &str,
        kinds: &[ChannelKind],
        config: ClientConfig,
    ) -> Self {
        let id = user(name);
        let inbox = net.join(id.clone());
        let fs = MemoryFileSystem::new();
        let options = SessionOptions::new(
            id.clone(),
            net.connectors(&id, kinds),
            inbox,
            Arc::new(fs.clone()),
        )
        .with_config(config);
        let handle = spawn(options);
        let events = handle.subscribe();
        Self {
            id,
            handle,
            fs,
            events,
        }
    }

    /// Wait for the first event matching `pred`, skipping others.
    pub async fn expect_event(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Poll the actor until its status satisfies `pred`.
    pub async fn wait_for_status(&self, what: &str, pred: impl Fn(&SessionStatus) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let status = self.handle.status().await.unwrap();
            if pred(&status) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}: {status:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll the file system until `path` holds `expected`.
    pub async fn wait_for_file(&self, path: &str, expected: &[u8]) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let current = self.fs.read(Path::new(path)).ok();
            if current.as_deref() == Some(expected) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {path}: have {:?}",
                    current.map(|c| String::from_utf8_lossy(&c).into_owned())
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn fs_has(&self, path: &str) -> bool {
        self.fs.exists(Path::new(path))
    }

    /// Workspace folder this peer materializes joined sessions in.
    pub fn workspace(&self) -> String {
        format!("/{}/ws", self.id.bare().split('@').next().unwrap_or("peer"))
    }
}

/// Seed `root` with `a.txt` and start a session sharing it.
pub async fn host_session(host: &Peer, root: &str) {
    host.fs.create_folder(Path::new(root)).unwrap();
    host.fs
        .write(&Path::new(root).join("a.txt"), b"hello")
        .unwrap();
    host.handle
        .start_session(vec![session_client::LocalReferencePoint::new("proj", root)])
        .await
        .unwrap();
}

/// Invite `guest` through `inviter` and have it accept.
pub async fn join(inviter: &Peer, guest: &mut Peer) -> InvitationId {
    inviter
        .handle
        .invite(vec![guest.id.clone()], "pairing")
        .await
        .unwrap();
    let event = guest
        .expect_event(|e| matches!(e, SessionEvent::InvitationReceived(_)))
        .await;
    let SessionEvent::InvitationReceived(invitation) = event else {
        unreachable!()
    };
    guest
        .handle
        .accept_invitation_into(invitation.invitation_id, guest.workspace())
        .await
        .unwrap();
    invitation.invitation_id
}
