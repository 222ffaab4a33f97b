//! WebSocket client for the replication server.
//!
//! Provides:
//! - Connection lifecycle (connect, `Init` handshake, disconnect)
//! - A writer task fed by an mpsc channel
//! - A reader task decoding [`ServerMessage`]s into [`ClientEvent`]s
//!
//! Unsent local changes live in the durable outbox, so nothing is queued
//! here while disconnected; sends simply fail with `ConnectionClosed`.

use canopy_core::UserId;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Socket open and `Init` sent
    Connected,
    /// Socket closed or failed
    Disconnected,
    Message(ServerMessage),
}

pub struct SyncClient {
    user_id: UserId,
    device_id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
    server_url: String,
}

impl SyncClient {
    pub fn new(user_id: UserId, device_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id,
            device_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect, spawn the reader and writer tasks and send `Init`.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward the outgoing channel to the socket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        self.send(&ClientMessage::Init {
            user_id: self.user_id,
            device_id: self.device_id,
        })
        .await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode incoming frames
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerMessage::decode(&bytes) {
                            Ok(message) => {
                                if event_tx.send(ClientEvent::Message(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        log::info!("Connected to {} as device {}", self.server_url, self.device_id);
        Ok(())
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = message.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the socket once queued frames are written.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let (user, device) = (Uuid::new_v4(), Uuid::new_v4());
        let client = SyncClient::new(user, device, "ws://localhost:9090");

        assert_eq!(client.user_id(), user);
        assert_eq!(client.device_id(), device);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");
        let result = client.send(&ClientMessage::Ping).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), format!("ws://127.0.0.1:{port}"));
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
