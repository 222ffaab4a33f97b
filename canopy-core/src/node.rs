use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::attributes::NodeAttributes;

pub type NodeId = Uuid;
pub type UserId = Uuid;

/// Type tag carried in `attributes.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Space,
    Folder,
    Page,
    Database,
    Record,
    Channel,
    Message,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Space => "space",
            NodeType::Folder => "folder",
            NodeType::Page => "page",
            NodeType::Database => "database",
            NodeType::Record => "record",
            NodeType::Channel => "channel",
            NodeType::Message => "message",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node of the replicated graph as seen by one replica.
///
/// `local_revision` moves forward on every local commit and every merged
/// remote change; `server_revision` is the highest transaction version the
/// server has confirmed for this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub parent_id: Option<NodeId>,
    pub root_id: NodeId,
    pub attributes: NodeAttributes,
    pub created_at: u64,
    pub created_by: UserId,
    pub updated_at: Option<u64>,
    pub updated_by: Option<UserId>,
    pub local_revision: u64,
    pub server_revision: u64,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn name(&self) -> Option<String> {
        crate::attributes::model_for(self.node_type).name(&self.attributes)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
