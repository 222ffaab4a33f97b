//! # canopy-core: domain model for the Canopy sync engine
//!
//! Pure, I/O-free building blocks shared by clients and the server:
//!
//! - [`node`]: the replicated `Node` row and its type tag
//! - [`attributes`]: closed sum type of attribute schemas plus the
//!   per-type model registry (validation, names, text, capabilities)
//! - [`crdt`]: the `CrdtDocument` capability and its Yrs implementation
//! - [`policy`]: roles, `AccessContext` and the `AccessPolicy` hook
//! - [`error`]: `CoreError`

pub mod attributes;
pub mod crdt;
pub mod error;
pub mod node;
pub mod policy;

pub use attributes::{
    model_for, ChannelAttributes, Collaborators, DatabaseAttributes, FolderAttributes,
    MessageAttributes, NodeAttributes, NodeModel, PageAttributes, RecordAttributes,
    SpaceAttributes,
};
pub use crdt::{CrdtDocument, YrsDocument};
pub use error::{CoreError, Result};
pub use node::{now_millis, Node, NodeId, NodeType, UserId};
pub use policy::{AccessContext, AccessPolicy, AllowAll, ModelPolicy, NodeRole};
