//! Sessions over real TCP sockets on the loopback interface.

mod common;

use common::{fast_config, host_session, join, user, Peer};
use dashmap::DashMap;
use session_client::transport::{AddressBook, TcpAcceptor, TcpConnector, MAX_FRAME_SIZE};
use session_client::{spawn, Connector, MemoryFileSystem, SessionEvent, SessionOptions};
use session_core::ChannelKind;
use session_types::{ActivityKind, ReferencePointId, ResourcePath, Role, SessionPath};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn tcp_peer(name: &str, book: &AddressBook) -> (Peer, TcpAcceptor) {
    let id = user(name);
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), inbox_tx)
        .await
        .unwrap();
    book.insert(id.clone(), acceptor.local_addr());

    let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(
        id.clone(),
        Arc::clone(book),
        Duration::from_secs(1),
    ));
    let fs = MemoryFileSystem::new();
    let mut config = fast_config();
    config.transport.channels = vec![ChannelKind::Direct];
    let options = SessionOptions::new(id.clone(), vec![connector], inbox, Arc::new(fs.clone()))
        .with_config(config);
    let handle = spawn(options);
    let events = handle.subscribe();
    let peer = Peer {
        id,
        handle,
        fs,
        events,
    };
    (peer, acceptor)
}

fn large_file(rp: ReferencePointId, name: &str, len: usize) -> (ActivityKind, Vec<u8>) {
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let kind = ActivityKind::FileCreated {
        path: ResourcePath::new(rp, SessionPath::parse(name).unwrap()),
        content: content.clone(),
    };
    (kind, content)
}

#[tokio::test]
async fn file_larger_than_a_frame_reaches_every_replica() {
    let book: AddressBook = Arc::new(DashMap::new());
    let (alice, _alice_acceptor) = tcp_peer("alice", &book).await;
    let (mut bob, _bob_acceptor) = tcp_peer("bob", &book).await;
    host_session(&alice, "/alice/proj").await;
    join(&alice, &mut bob).await;
    bob.wait_for_file("/bob/ws/proj/a.txt", b"hello").await;

    let rp = alice.handle.reference_points().await.unwrap()[0].0;

    // Host to guest.
    let (kind, content) = large_file(rp, "big.bin", 2 * MAX_FRAME_SIZE);
    alice.handle.record(kind).await.unwrap();
    bob.wait_for_file("/bob/ws/proj/big.bin", &content).await;

    // Guest to host, through a submission.
    alice
        .handle
        .change_role(bob.id.clone(), Role::Driver)
        .await
        .unwrap();
    let bob_id = bob.id.clone();
    bob.wait_for_status("driver role", |s| s.role_of(&bob_id) == Some(Role::Driver))
        .await;
    let (kind, content) = large_file(rp, "upload.bin", MAX_FRAME_SIZE + 4096);
    bob.handle.record(kind).await.unwrap();
    alice.wait_for_file("/alice/proj/upload.bin", &content).await;

    assert_eq!(alice.handle.participants().await.unwrap().len(), 2);
    assert!(bob.handle.status().await.unwrap().lifecycle.is_running());
    while let Some(event) = bob.events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::SessionStopped { .. }),
            "session stopped: {event:?}"
        );
    }
}
