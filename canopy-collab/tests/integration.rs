//! Integration tests for end-to-end WebSocket replication.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use canopy_collab::{
    ClientMessage, MutationOutbox, OutboxConfig, ReplicaStore, RevisionConfig, RevisionStore, ServerConfig,
    ServerMessage, StoreConfig, SyncConfig, SyncEvent, SyncInput, SyncServer, Synchronizer,
};
use canopy_core::{Collaborators, ModelPolicy, NodeAttributes, NodeId, NodeRole, PageAttributes, SpaceAttributes, UserId};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return it with its URL.
async fn start_test_server(dir: &TempDir) -> (Arc<SyncServer>, String) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::for_testing(dir.path())
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

struct Device {
    _dir: TempDir,
    revisions: Arc<RevisionStore>,
}

fn device() -> Device {
    let dir = tempdir().unwrap();
    let store = Arc::new(ReplicaStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let outbox = Arc::new(MutationOutbox::new(store.clone(), OutboxConfig::default()));
    let revisions = RevisionStore::new(store, Arc::new(ModelPolicy), RevisionConfig::default()).with_outbox(outbox);
    Device {
        _dir: dir,
        revisions: Arc::new(revisions),
    }
}

fn start_sync(
    device: &Device,
    user: UserId,
    url: &str,
    shutdown: watch::Receiver<bool>,
) -> (mpsc::Receiver<SyncEvent>, tokio::task::JoinHandle<()>) {
    let sync = Synchronizer::new(user, Uuid::new_v4(), device.revisions.clone(), SyncConfig::for_testing()).unwrap();
    let (events_tx, events_rx) = mpsc::channel(256);
    let handle = tokio::spawn(sync.run(url.to_string(), events_tx, shutdown));
    (events_rx, handle)
}

/// Wait until an event matches `predicate`.
async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, predicate: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("synchronizer stopped"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

fn space(admin: UserId) -> NodeAttributes {
    let mut collaborators = Collaborators::new();
    collaborators.insert(admin, NodeRole::Admin);
    NodeAttributes::Space(SpaceAttributes {
        name: "Team".into(),
        description: None,
        collaborators,
    })
}

fn page(parent_id: NodeId, name: &str) -> NodeAttributes {
    NodeAttributes::Page(PageAttributes {
        parent_id,
        name: name.into(),
        content: None,
        collaborators: Collaborators::new(),
    })
}

#[tokio::test]
async fn test_offline_create_reaches_second_device() {
    let server_dir = tempdir().unwrap();
    let (server, url) = start_test_server(&server_dir).await;
    let user = Uuid::new_v4();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Six changes made before the laptop ever connects.
    let laptop = device();
    let (root, _) = laptop.revisions.create_node(user, space(user)).unwrap();
    for i in 1..=5 {
        laptop.revisions.create_node(user, page(root.id, &format!("Page {i}"))).unwrap();
    }

    let (mut laptop_events, laptop_handle) = start_sync(&laptop, user, &url, shutdown_rx.clone());
    wait_for(&mut laptop_events, |e| matches!(e, SyncEvent::Pushed(p) if p.accepted == 6)).await;
    assert_eq!(server.log().current_version().unwrap(), 6);

    let phone = device();
    let (mut phone_events, phone_handle) = start_sync(&phone, user, &url, shutdown_rx.clone());
    let input = SyncInput::Transactions { root_id: root.id };
    wait_for(&mut phone_events, |e| {
        matches!(e, SyncEvent::PageApplied { input: i, cursor: 6, .. } if *i == input)
    })
    .await;
    assert_eq!(phone.revisions.children_of(root.id).unwrap().len(), 5);

    // The seventh change is delivered live through the phone's subscription.
    let (late, _) = laptop.revisions.create_node(user, page(root.id, "Late")).unwrap();
    wait_for(&mut laptop_events, |e| matches!(e, SyncEvent::Pushed(p) if p.accepted == 1)).await;
    assert_eq!(server.log().current_version().unwrap(), 7);
    assert_eq!(laptop.revisions.get_node(late.id).unwrap().unwrap().server_revision, 7);

    wait_for(&mut phone_events, |e| {
        matches!(e, SyncEvent::PageApplied { input: i, cursor: 7, .. } if *i == input)
    })
    .await;
    let received = phone.revisions.get_node(late.id).unwrap().unwrap();
    assert_eq!(received.server_revision, 7);
    assert_eq!(received.name(), Some("Late".into()));
    assert_eq!(received.local_revision, 0);

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), laptop_handle).await.unwrap().unwrap();
    timeout(Duration::from_secs(2), phone_handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_raw_protocol_session() {
    let server_dir = tempdir().unwrap();
    let (_server, url) = start_test_server(&server_dir).await;
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut sender, mut receiver) = ws.split();

    async fn send(sender: &mut (impl Sink<Message> + Unpin), message: ClientMessage) {
        let _ = sender.send(Message::Binary(message.encode().unwrap().into())).await;
    }

    async fn next(receiver: &mut (impl Stream<Item = Result<Message, WsError>> + Unpin)) -> ServerMessage {
        loop {
            let frame = timeout(Duration::from_secs(2), receiver.next()).await.unwrap().unwrap().unwrap();
            if let Message::Binary(data) = frame {
                let bytes: Vec<u8> = data.into();
                return ServerMessage::decode(&bytes).unwrap();
            }
        }
    }

    // Anything before Init is refused.
    send(&mut sender, ClientMessage::Ping).await;
    assert!(matches!(next(&mut receiver).await, ServerMessage::Error { .. }));

    let device_id = Uuid::new_v4();
    send(
        &mut sender,
        ClientMessage::Init {
            user_id: Uuid::new_v4(),
            device_id,
        },
    )
    .await;
    assert_eq!(next(&mut receiver).await, ServerMessage::Initialized { device_id });

    send(&mut sender, ClientMessage::Ping).await;
    assert_eq!(next(&mut receiver).await, ServerMessage::Pong);

    // A root the user holds no grant on.
    send(
        &mut sender,
        ClientMessage::Pull {
            request_id: 1,
            input: SyncInput::Transactions { root_id: Uuid::new_v4() },
            cursor: 0,
            limit: 10,
        },
    )
    .await;
    assert!(matches!(next(&mut receiver).await, ServerMessage::Error { .. }));

    send(
        &mut sender,
        ClientMessage::Pull {
            request_id: 2,
            input: SyncInput::Collaborations,
            cursor: 0,
            limit: 0,
        },
    )
    .await;
    match next(&mut receiver).await {
        ServerMessage::Page { request_id, page } => {
            assert_eq!(request_id, Some(2));
            assert!(page.is_empty());
        }
        other => panic!("expected a page, got {other:?}"),
    }
}

#[tokio::test]
async fn test_synchronizer_retries_until_server_is_up() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let user = Uuid::new_v4();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let laptop = device();
    laptop.revisions.create_node(user, space(user)).unwrap();
    let (mut events, handle) = start_sync(&laptop, user, &url, shutdown_rx);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(laptop.revisions.outbox().unwrap().len().unwrap(), 1);

    let server_dir = tempdir().unwrap();
    let config = ServerConfig {
        bind_addr: url.trim_start_matches("ws://").to_string(),
        ..ServerConfig::for_testing(server_dir.path())
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });

    wait_for(&mut events, |e| matches!(e, SyncEvent::Pushed(p) if p.accepted == 1)).await;
    assert!(laptop.revisions.outbox().unwrap().is_empty().unwrap());
    assert_eq!(server.log().current_version().unwrap(), 1);

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
}
