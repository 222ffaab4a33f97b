//! WebSocket replication server.
//!
//! Architecture:
//! ```text
//! Device A ──┐                 ┌── Session (subscriptions, root_ids)
//!            ├── connection ───┤
//! Device B ──┘    task         └── EventBus receiver
//!                    │
//!                    ▼
//!             TransactionLog ──► ReplicaStore (RocksDB)
//!                    │
//!                    └── publish ──► EventBus ──► every connection task
//! ```
//!
//! Each connection task owns its [`Session`]. The first message must be
//! `Init`; the user id it carries is trusted (authentication happens in
//! front of this server).

use canopy_core::{AccessPolicy, ModelPolicy};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broker::{EventBus, Session};
use crate::transaction_log::{LogEvent, TransactionLog};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::revision::RevisionConfig;
use crate::storage::{ReplicaStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Directory of the server's store
    pub storage_path: PathBuf,
    /// Events buffered per connection before it lags
    pub event_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Page size used when a pull asks for 0
    pub default_page_size: usize,
    /// Upper bound on any page
    pub max_page_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: PathBuf::from("canopy_server_data"),
            event_capacity: 256,
            heartbeat_interval_secs: 30,
            default_page_size: 50,
            max_page_size: 1000,
        }
    }
}

impl ServerConfig {
    pub fn for_testing(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: storage_path.into(),
            event_capacity: 64,
            heartbeat_interval_secs: 5,
            default_page_size: 50,
            max_page_size: 1000,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub accepted_mutations: u64,
    pub rejected_mutations: u64,
    pub pages_sent: u64,
}

/// The replication server.
pub struct SyncServer {
    config: ServerConfig,
    log: Arc<TransactionLog>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open the store and build a server using the default model policy.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        Self::with_policy(config, Arc::new(ModelPolicy))
    }

    pub fn with_policy(config: ServerConfig, policy: Arc<dyn AccessPolicy>) -> Result<Self, StoreError> {
        let store = ReplicaStore::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?;
        let events = Arc::new(EventBus::new(config.event_capacity));
        let log = TransactionLog::new(Arc::new(store), policy, events, RevisionConfig::default());
        log::info!(
            "Opened server store at {} (version {})",
            config.storage_path.display(),
            log.current_version()?
        );

        Ok(Self {
            config,
            log: Arc::new(log),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let log = self.log.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, log, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        log: Arc<TransactionLog>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let mut events: Option<broadcast::Receiver<Arc<LogEvent>>> = None;
        let mut heartbeat = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        heartbeat.tick().await;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                let message = match ClientMessage::decode(&bytes) {
                                    Ok(message) => message,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let replies =
                                    Self::handle_message(&log, &stats, &config, &mut session, &mut events, message).await;
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    event = async {
                        match events.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        let Some(current) = session.as_mut() else {
                            continue;
                        };
                        let pages = match event {
                            Ok(event) => current.on_event(&log, &event),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Device {} lagged by {n} events", current.device_id);
                                log.events().record_lag(n);
                                current.refresh(&log)
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        match pages {
                            Ok(pages) => {
                                for page in pages {
                                    stats.write().await.pages_sent += 1;
                                    let reply = ServerMessage::Page { request_id: None, page };
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Err(e) => log::warn!("Dropping event for {}: {e}", current.device_id),
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Teardown drops the session and every subscription it held.
        if let Some(session) = session.take() {
            log.events().unregister(&session.device_id).await;
            log::info!("Device {} of {} disconnected", session.device_id, session.user_id);
        }
        stats.write().await.active_connections -= 1;
        result
    }

    async fn handle_message(
        log: &Arc<TransactionLog>,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
        session: &mut Option<Session>,
        events: &mut Option<broadcast::Receiver<Arc<LogEvent>>>,
        message: ClientMessage,
    ) -> Vec<ServerMessage> {
        if let ClientMessage::Init { user_id, device_id } = message {
            if session.is_some() {
                return vec![error("session already initialized")];
            }
            let receiver = log.events().register(device_id, user_id).await;
            return match Session::open(log, user_id, device_id, config.max_page_size) {
                Ok(opened) => {
                    log::info!(
                        "Device {device_id} of {user_id} initialized ({} roots)",
                        opened.root_ids().len()
                    );
                    *session = Some(opened);
                    *events = Some(receiver);
                    vec![ServerMessage::Initialized { device_id }]
                }
                Err(e) => {
                    log.events().unregister(&device_id).await;
                    vec![error(&e.to_string())]
                }
            };
        }

        let Some(session) = session.as_mut() else {
            return vec![error("Init must be the first message")];
        };

        match message {
            ClientMessage::Init { .. } => vec![error("session already initialized")],
            ClientMessage::Pull {
                request_id,
                input,
                cursor,
                limit,
            } => {
                let limit = match limit {
                    0 => config.default_page_size,
                    n => n as usize,
                };
                match session.pull(log, input, cursor, limit) {
                    Ok(page) => {
                        stats.write().await.pages_sent += 1;
                        vec![ServerMessage::Page {
                            request_id: Some(request_id),
                            page,
                        }]
                    }
                    Err(e) => vec![error(&e.to_string())],
                }
            }
            ClientMessage::Subscribe {
                subscription_id,
                input,
                cursor,
            } => match session.subscribe(log, subscription_id, input, cursor) {
                Ok(Some(page)) => {
                    stats.write().await.pages_sent += 1;
                    vec![ServerMessage::Page { request_id: None, page }]
                }
                Ok(None) => Vec::new(),
                Err(e) => vec![error(&e.to_string())],
            },
            ClientMessage::Unsubscribe { subscription_id } => {
                session.unsubscribe(&subscription_id);
                Vec::new()
            }
            // Pulls are bounded reads and stay inline; accepting a batch
            // commits RocksDB writes, so it moves off the reactor.
            ClientMessage::PushMutations { batch_id, mutations } => {
                let accepting = log.clone();
                let user_id = session.user_id;
                let results = match tokio::task::spawn_blocking(move || accepting.accept(user_id, &mutations)).await {
                    Ok(results) => results,
                    Err(e) => {
                        log::error!("Batch {batch_id} from {user_id} did not complete: {e}");
                        return vec![error(&e.to_string())];
                    }
                };
                let accepted = results.iter().filter(|r| r.status.is_success()).count() as u64;
                {
                    let mut s = stats.write().await;
                    s.accepted_mutations += accepted;
                    s.rejected_mutations += results.len() as u64 - accepted;
                }
                vec![ServerMessage::MutationResults { batch_id, results }]
            }
            ClientMessage::Ping => vec![ServerMessage::Pong],
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }
}

fn error(message: &str) -> ServerMessage {
    ServerMessage::Error {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.default_page_size, 50);
    }

    #[test]
    fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(ServerConfig::for_testing(dir.path().join("db"))).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
        assert_eq!(server.log().current_version().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_messages_before_init_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(ServerConfig::for_testing(dir.path())).unwrap();
        let mut session = None;
        let mut events = None;

        let replies = SyncServer::handle_message(
            server.log(),
            &server.stats,
            &server.config,
            &mut session,
            &mut events,
            ClientMessage::Ping,
        )
        .await;
        assert!(matches!(replies[0], ServerMessage::Error { .. }));

        let device_id = uuid::Uuid::new_v4();
        let replies = SyncServer::handle_message(
            server.log(),
            &server.stats,
            &server.config,
            &mut session,
            &mut events,
            ClientMessage::Init {
                user_id: uuid::Uuid::new_v4(),
                device_id,
            },
        )
        .await;
        assert_eq!(replies, vec![ServerMessage::Initialized { device_id }]);
        assert!(session.is_some());
        assert_eq!(server.log().events().session_count().await, 1);
    }

    #[tokio::test]
    async fn test_push_is_accepted_and_counted() {
        use crate::outbox::{MutationPayload, MutationType, OutboxMutation};
        use crate::protocol::MutationStatus;

        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(ServerConfig::for_testing(dir.path())).unwrap();
        let mut session = None;
        let mut events = None;
        SyncServer::handle_message(
            server.log(),
            &server.stats,
            &server.config,
            &mut session,
            &mut events,
            ClientMessage::Init {
                user_id: uuid::Uuid::new_v4(),
                device_id: uuid::Uuid::new_v4(),
            },
        )
        .await;

        let node_id = uuid::Uuid::new_v4();
        let mutation = OutboxMutation {
            id: 7,
            mutation_type: MutationType::DeleteNode,
            target_id: node_id,
            payload: MutationPayload::DeleteNode { node_id, root_id: node_id },
            created_at: 0,
            retry_count: 0,
        };
        let replies = SyncServer::handle_message(
            server.log(),
            &server.stats,
            &server.config,
            &mut session,
            &mut events,
            ClientMessage::PushMutations {
                batch_id: 3,
                mutations: vec![mutation],
            },
        )
        .await;

        match &replies[..] {
            [ServerMessage::MutationResults { batch_id, results }] => {
                assert_eq!(*batch_id, 3);
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].id, 7);
                assert_eq!(results[0].status, MutationStatus::Success);
            }
            other => panic!("expected mutation results, got {other:?}"),
        }
        assert_eq!(server.stats().await.accepted_mutations, 1);
        assert_eq!(server.stats().await.rejected_mutations, 0);
    }
}
