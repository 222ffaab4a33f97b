//! Persistent storage layer shared by client replicas and the server.
//!
//! ```text
//! ┌──────────────┐   unit of work   ┌──────────────────────────────────┐
//! │ RevisionStore│ ───────────────► │ ReplicaStore (RocksDB)           │
//! │ TransactionLog│  (one batch)    │  nodes / fragments / closure ... │
//! └──────────────┘                  └──────────────────────────────────┘
//! ```

pub mod delta;
pub mod rocks;

pub use delta::{CompressedDelta, FragmentLog, FragmentStats, UpdateFragment};
pub use rocks::{keys, NodeMarker, ReplicaStore, StoreConfig, StoreError, UnitOfWork};
