//! Binary replication protocol.
//!
//! Every websocket frame is one bincode-encoded [`ClientMessage`] or
//! [`ServerMessage`]:
//!
//! ```text
//!  client                                   server
//!    │ Init {user, device}                    │
//!    │ ─────────────────────────────────────► │
//!    │                 Initialized {device}   │
//!    │ ◄───────────────────────────────────── │
//!    │ Pull / Subscribe {input, cursor}       │
//!    │ ─────────────────────────────────────► │
//!    │        Page {input, from_cursor, ...}  │  (now, or on the next event)
//!    │ ◄───────────────────────────────────── │
//!    │ PushMutations {batch, mutations}       │
//!    │ ─────────────────────────────────────► │
//!    │        MutationResults {batch, ...}    │
//!    │ ◄───────────────────────────────────── │
//! ```

use canopy_core::{NodeId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaboration::Collaboration;
use crate::outbox::OutboxMutation;

/// A replicated collection a client can pull or subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncInput {
    /// Transactions of one root's subtree
    Transactions { root_id: NodeId },
    /// Role grants of the connected user
    Collaborations,
}

impl SyncInput {
    /// Stable key used for cursors and subscriptions.
    pub fn key(&self) -> String {
        match self {
            SyncInput::Transactions { root_id } => format!("transactions:{root_id}"),
            SyncInput::Collaborations => "collaborations".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOperation {
    Create,
    Update,
    Delete,
}

/// A server-accepted change, ordered by `version` within its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTransaction {
    pub id: Uuid,
    pub operation: TransactionOperation,
    pub node_id: NodeId,
    pub root_id: NodeId,
    /// CRDT update for creates and updates
    pub data: Option<Vec<u8>>,
    /// Client time of the originating mutation
    pub created_at: u64,
    pub created_by: UserId,
    /// Server time of the append
    pub server_created_at: u64,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncItems {
    Transactions(Vec<ServerTransaction>),
    Collaborations(Vec<Collaboration>),
}

/// One page of a collection, starting after `from_cursor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPage {
    pub input: SyncInput,
    pub from_cursor: u64,
    pub items: SyncItems,
}

impl SyncPage {
    pub fn empty(input: SyncInput, from_cursor: u64) -> Self {
        let items = match input {
            SyncInput::Transactions { .. } => SyncItems::Transactions(Vec::new()),
            SyncInput::Collaborations => SyncItems::Collaborations(Vec::new()),
        };
        Self {
            input,
            from_cursor,
            items,
        }
    }

    pub fn len(&self) -> usize {
        match &self.items {
            SyncItems::Transactions(items) => items.len(),
            SyncItems::Collaborations(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursor after applying the whole page.
    pub fn next_cursor(&self) -> u64 {
        let last = match &self.items {
            SyncItems::Transactions(items) => items.last().map(|t| t.version),
            SyncItems::Collaborations(items) => items.last().map(|c| c.version),
        };
        last.unwrap_or(self.from_cursor).max(self.from_cursor)
    }
}

/// Outcome of one pushed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationStatus {
    Success,
    NotFound,
    Unauthorized,
    InvalidAttributes,
    Failed,
}

impl MutationStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, MutationStatus::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    pub id: u64,
    pub status: MutationStatus,
    /// Version assigned to the resulting transaction
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Init {
        user_id: UserId,
        device_id: Uuid,
    },
    Pull {
        request_id: u64,
        input: SyncInput,
        cursor: u64,
        limit: u32,
    },
    Subscribe {
        subscription_id: String,
        input: SyncInput,
        cursor: u64,
    },
    Unsubscribe {
        subscription_id: String,
    },
    PushMutations {
        batch_id: u64,
        mutations: Vec<OutboxMutation>,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Initialized {
        device_id: Uuid,
    },
    Page {
        /// Set for pull responses
        request_id: Option<u64>,
        page: SyncPage,
    },
    MutationResults {
        batch_id: u64,
        results: Vec<MutationResult>,
    },
    Error {
        message: String,
    },
    Pong,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A message arrived that is not valid in the current session state
    UnexpectedMessage(&'static str),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedMessage(m) => write!(f, "Unexpected message: {m}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
