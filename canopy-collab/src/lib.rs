//! # canopy-collab - replication layer for Canopy
//!
//! Local replicas, the server transaction log and the websocket protocol
//! between them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────────┐
//! │ Synchronizer     │ ◄────────────────► │ SyncServer       │
//! │ (per device)     │   bincode frames   │ (central)        │
//! └────────┬─────────┘                    └────────┬─────────┘
//!          │                                       │
//!          ▼                                       ▼
//! ┌──────────────────┐                    ┌──────────────────┐
//! │ RevisionStore    │                    │ TransactionLog   │
//! │ + MutationOutbox │                    │ + EventBus       │
//! └────────┬─────────┘                    └────────┬─────────┘
//!          │                                       │
//!          ▼                                       ▼
//!     ReplicaStore (RocksDB: nodes, fragments, closure, collaborations, ...)
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: RocksDB column families, unit of work, fragment log
//! - [`closure`]: ancestor/descendant closure table
//! - [`collaboration`]: role grants and role resolution
//! - [`revision`]: CAS-gated local writes and remote merges
//! - [`outbox`]: durable queue of unacknowledged local mutations
//! - [`protocol`]: wire messages
//! - [`transaction_log`]: server transaction log with version assignment
//! - [`broker`]: event fan-out and per-connection sessions
//! - [`server`]: websocket server
//! - [`client`]: websocket client
//! - [`synchronizer`]: client replication loop

pub mod broker;
pub mod client;
pub mod closure;
pub mod collaboration;
pub mod outbox;
pub mod protocol;
pub mod revision;
pub mod server;
pub mod storage;
pub mod synchronizer;
pub mod transaction_log;

// Re-exports for convenience
pub use broker::{BusStats, EventBus, Session, SessionError};
pub use client::{ClientEvent, ConnectionState, SyncClient};
pub use closure::{ClosureError, ClosureIndex, ClosurePath};
pub use collaboration::{Collaboration, Collaborations};
pub use outbox::{
    CompactionStats, FragmentData, MutationOutbox, MutationPayload, MutationType, OutboxConfig, OutboxMutation,
};
pub use protocol::{
    ClientMessage, MutationResult, MutationStatus, ProtocolError, ServerMessage, ServerTransaction, SyncInput,
    SyncItems, SyncPage, TransactionOperation,
};
pub use revision::{RemoteOutcome, RevisionConfig, RevisionError, RevisionStore, UpdateOutcome};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{ReplicaStore, StoreConfig, StoreError};
pub use synchronizer::{
    CatchUpStats, CursorStore, DirectSource, PageOutcome, PushBatch, PushOutcome, RootChanges, SyncConfig, SyncError,
    SyncEvent, SyncSource, Synchronizer,
};
pub use transaction_log::{LogEvent, TransactionLog};
