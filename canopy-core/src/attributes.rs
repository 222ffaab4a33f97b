//! Attribute schemas, one variant per node type.
//!
//! Attributes are materialized from the node's CRDT document as a JSON
//! object whose `type` field selects the variant. Every per-type concern
//! (validation, allowed parents, name/text extraction, capability rules) lives
//! in a [`NodeModel`] looked up once through [`model_for`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::node::{Node, NodeId, NodeType, UserId};
use crate::policy::{AccessContext, NodeRole};

pub const MAX_NAME_LENGTH: usize = 256;

/// Role grants attached to a node, keyed by collaborator.
pub type Collaborators = BTreeMap<UserId, NodeRole>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeAttributes {
    Space(SpaceAttributes),
    Folder(FolderAttributes),
    Page(PageAttributes),
    Database(DatabaseAttributes),
    Record(RecordAttributes),
    Channel(ChannelAttributes),
    Message(MessageAttributes),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceAttributes {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub collaborators: Collaborators,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderAttributes {
    pub parent_id: NodeId,
    pub name: String,
    #[serde(default)]
    pub collaborators: Collaborators,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageAttributes {
    pub parent_id: NodeId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub collaborators: Collaborators,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseAttributes {
    pub parent_id: NodeId,
    pub name: String,
    /// Field id → field kind (`text`, `number`, `boolean`, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub collaborators: Collaborators,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordAttributes {
    pub parent_id: NodeId,
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAttributes {
    pub parent_id: NodeId,
    pub name: String,
    #[serde(default)]
    pub collaborators: Collaborators,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAttributes {
    pub parent_id: NodeId,
    pub content: String,
}

impl NodeAttributes {
    /// Parse a materialized attribute value.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CoreError::InvalidAttributes(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| CoreError::InvalidAttributes(e.to_string()))
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            NodeAttributes::Space(_) => NodeType::Space,
            NodeAttributes::Folder(_) => NodeType::Folder,
            NodeAttributes::Page(_) => NodeType::Page,
            NodeAttributes::Database(_) => NodeType::Database,
            NodeAttributes::Record(_) => NodeType::Record,
            NodeAttributes::Channel(_) => NodeType::Channel,
            NodeAttributes::Message(_) => NodeType::Message,
        }
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        match self {
            NodeAttributes::Space(_) => None,
            NodeAttributes::Folder(a) => Some(a.parent_id),
            NodeAttributes::Page(a) => Some(a.parent_id),
            NodeAttributes::Database(a) => Some(a.parent_id),
            NodeAttributes::Record(a) => Some(a.parent_id),
            NodeAttributes::Channel(a) => Some(a.parent_id),
            NodeAttributes::Message(a) => Some(a.parent_id),
        }
    }

    /// Role grants carried by this node, if the type supports them.
    pub fn collaborators(&self) -> Option<&Collaborators> {
        match self {
            NodeAttributes::Space(a) => Some(&a.collaborators),
            NodeAttributes::Folder(a) => Some(&a.collaborators),
            NodeAttributes::Page(a) => Some(&a.collaborators),
            NodeAttributes::Database(a) => Some(&a.collaborators),
            NodeAttributes::Channel(a) => Some(&a.collaborators),
            NodeAttributes::Record(_) | NodeAttributes::Message(_) => None,
        }
    }

    pub fn collaborators_mut(&mut self) -> Option<&mut Collaborators> {
        match self {
            NodeAttributes::Space(a) => Some(&mut a.collaborators),
            NodeAttributes::Folder(a) => Some(&mut a.collaborators),
            NodeAttributes::Page(a) => Some(&mut a.collaborators),
            NodeAttributes::Database(a) => Some(&mut a.collaborators),
            NodeAttributes::Channel(a) => Some(&mut a.collaborators),
            NodeAttributes::Record(_) | NodeAttributes::Message(_) => None,
        }
    }

    /// Validate against the model registered for this type.
    pub fn validate(&self) -> Result<()> {
        model_for(self.node_type()).validate(self)
    }
}

/// Per-type behaviour of the attribute schema.
pub trait NodeModel: Sync {
    fn node_type(&self) -> NodeType;

    /// Parent types this node may live under. Empty means root-only.
    fn allowed_parents(&self) -> &'static [NodeType];

    fn validate(&self, attributes: &NodeAttributes) -> Result<()>;

    fn name(&self, attributes: &NodeAttributes) -> Option<String>;

    /// Plain text used by external indexers.
    fn text(&self, attributes: &NodeAttributes) -> Option<String>;

    fn can_create(&self, ctx: &AccessContext<'_>, attributes: &NodeAttributes) -> bool;

    fn can_update(&self, ctx: &AccessContext<'_>, node: &Node, attributes: &NodeAttributes) -> bool;

    fn can_delete(&self, ctx: &AccessContext<'_>, node: &Node) -> bool;

    fn validate_parent(&self, parent: Option<NodeType>) -> Result<()> {
        let allowed = self.allowed_parents();
        match parent {
            None if allowed.is_empty() => Ok(()),
            None => Err(CoreError::InvalidAttributes(format!(
                "{} requires a parent",
                self.node_type()
            ))),
            Some(parent) if allowed.contains(&parent) => Ok(()),
            Some(parent) => Err(CoreError::InvalidAttributes(format!(
                "{} cannot be placed under {parent}",
                self.node_type()
            ))),
        }
    }
}

fn check_name(node_type: NodeType, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CoreError::InvalidAttributes(format!("{node_type} name is empty")));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(CoreError::InvalidAttributes(format!(
            "{node_type} name exceeds {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

fn wrong_variant(expected: NodeType, attributes: &NodeAttributes) -> CoreError {
    CoreError::InvalidAttributes(format!(
        "expected {expected} attributes, got {}",
        attributes.node_type()
    ))
}

fn has_role(ctx: &AccessContext<'_>, minimum: NodeRole) -> bool {
    ctx.role.is_some_and(|role| role.at_least(minimum))
}

struct SpaceModel;
struct FolderModel;
struct PageModel;
struct DatabaseModel;
struct RecordModel;
struct ChannelModel;
struct MessageModel;

static SPACE: SpaceModel = SpaceModel;
static FOLDER: FolderModel = FolderModel;
static PAGE: PageModel = PageModel;
static DATABASE: DatabaseModel = DatabaseModel;
static RECORD: RecordModel = RecordModel;
static CHANNEL: ChannelModel = ChannelModel;
static MESSAGE: MessageModel = MessageModel;

/// Registry lookup keyed by the type tag.
pub fn model_for(node_type: NodeType) -> &'static dyn NodeModel {
    match node_type {
        NodeType::Space => &SPACE,
        NodeType::Folder => &FOLDER,
        NodeType::Page => &PAGE,
        NodeType::Database => &DATABASE,
        NodeType::Record => &RECORD,
        NodeType::Channel => &CHANNEL,
        NodeType::Message => &MESSAGE,
    }
}

const CONTAINERS: &[NodeType] = &[NodeType::Space, NodeType::Folder, NodeType::Page];

impl NodeModel for SpaceModel {
    fn node_type(&self) -> NodeType {
        NodeType::Space
    }

    fn allowed_parents(&self) -> &'static [NodeType] {
        &[]
    }

    fn validate(&self, attributes: &NodeAttributes) -> Result<()> {
        let NodeAttributes::Space(space) = attributes else {
            return Err(wrong_variant(NodeType::Space, attributes));
        };
        check_name(NodeType::Space, &space.name)?;
        if !space.collaborators.values().any(|role| *role == NodeRole::Admin) {
            return Err(CoreError::InvalidAttributes("space has no admin".into()));
        }
        Ok(())
    }

    fn name(&self, attributes: &NodeAttributes) -> Option<String> {
        match attributes {
            NodeAttributes::Space(a) => Some(a.name.clone()),
            _ => None,
        }
    }

    fn text(&self, attributes: &NodeAttributes) -> Option<String> {
        match attributes {
            NodeAttributes::Space(a) => a.description.clone(),
            _ => None,
        }
    }

    // A new space is only valid if its creator grants themselves admin.
    fn can_create(&self, ctx: &AccessContext<'_>, attributes: &NodeAttributes) -> bool {
        ctx.ancestors.is_empty()
            && attributes
                .collaborators()
                .and_then(|c| c.get(&ctx.actor))
                .is_some_and(|role| *role == NodeRole::Admin)
    }

    fn can_update(&self, ctx: &AccessContext<'_>, _node: &Node, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Admin)
    }

    fn can_delete(&self, ctx: &AccessContext<'_>, _node: &Node) -> bool {
        has_role(ctx, NodeRole::Admin)
    }
}

/// Shared rules for folders, pages, databases and channels.
fn container_can_delete(ctx: &AccessContext<'_>, node: &Node) -> bool {
    has_role(ctx, NodeRole::Admin) || (has_role(ctx, NodeRole::Editor) && node.created_by == ctx.actor)
}

impl NodeModel for FolderModel {
    fn node_type(&self) -> NodeType {
        NodeType::Folder
    }

    fn allowed_parents(&self) -> &'static [NodeType] {
        CONTAINERS
    }

    fn validate(&self, attributes: &NodeAttributes) -> Result<()> {
        let NodeAttributes::Folder(folder) = attributes else {
            return Err(wrong_variant(NodeType::Folder, attributes));
        };
        check_name(NodeType::Folder, &folder.name)
    }

    fn name(&self, attributes: &NodeAttributes) -> Option<String> {
        match attributes {
            NodeAttributes::Folder(a) => Some(a.name.clone()),
            _ => None,
        }
    }

    fn text(&self, _attributes: &NodeAttributes) -> Option<String> {
        None
    }

    fn can_create(&self, ctx: &AccessContext<'_>, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Editor)
    }

    fn can_update(&self, ctx: &AccessContext<'_>, _node: &Node, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Editor)
    }

    fn can_delete(&self, ctx: &AccessContext<'_>, node: &Node) -> bool {
        container_can_delete(ctx, node)
    }
}

impl NodeModel for PageModel {
    fn node_type(&self) -> NodeType {
        NodeType::Page
    }

    fn allowed_parents(&self) -> &'static [NodeType] {
        CONTAINERS
    }

    fn validate(&self, attributes: &NodeAttributes) -> Result<()> {
        let NodeAttributes::Page(page) = attributes else {
            return Err(wrong_variant(NodeType::Page, attributes));
        };
        check_name(NodeType::Page, &page.name)
    }

    fn name(&self, attributes: &NodeAttributes) -> Option<String> {
        match attributes {
            NodeAttributes::Page(a) => Some(a.name.clone()),
            _ => None,
        }
    }

    fn text(&self, attributes: &NodeAttributes) -> Option<String> {
        match attributes {
            NodeAttributes::Page(a) => a.content.clone(),
            _ => None,
        }
    }

    fn can_create(&self, ctx: &AccessContext<'_>, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Editor)
    }

    fn can_update(&self, ctx: &AccessContext<'_>, _node: &Node, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Editor)
    }

    fn can_delete(&self, ctx: &AccessContext<'_>, node: &Node) -> bool {
        container_can_delete(ctx, node)
    }
}

impl NodeModel for DatabaseModel {
    fn node_type(&self) -> NodeType {
        NodeType::Database
    }

    fn allowed_parents(&self) -> &'static [NodeType] {
        CONTAINERS
    }

    fn validate(&self, attributes: &NodeAttributes) -> Result<()> {
        let NodeAttributes::Database(database) = attributes else {
            return Err(wrong_variant(NodeType::Database, attributes));
        };
        check_name(NodeType::Database, &database.name)?;
        if let Some((id, _)) = database.fields.iter().find(|(_, kind)| kind.trim().is_empty()) {
            return Err(CoreError::InvalidAttributes(format!("field {id} has no kind")));
        }
        Ok(())
    }

    fn name(&self, attributes: &NodeAttributes) -> Option<String> {
        match attributes {
            NodeAttributes::Database(a) => Some(a.name.clone()),
            _ => None,
        }
    }

    fn text(&self, _attributes: &NodeAttributes) -> Option<String> {
        None
    }

    fn can_create(&self, ctx: &AccessContext<'_>, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Editor)
    }

    fn can_update(&self, ctx: &AccessContext<'_>, _node: &Node, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Editor)
    }

    fn can_delete(&self, ctx: &AccessContext<'_>, node: &Node) -> bool {
        container_can_delete(ctx, node)
    }
}

impl NodeModel for RecordModel {
    fn node_type(&self) -> NodeType {
        NodeType::Record
    }

    fn allowed_parents(&self) -> &'static [NodeType] {
        &[NodeType::Database]
    }

    fn validate(&self, attributes: &NodeAttributes) -> Result<()> {
        let NodeAttributes::Record(record) = attributes else {
            return Err(wrong_variant(NodeType::Record, attributes));
        };
        check_name(NodeType::Record, &record.name)
    }

    fn name(&self, attributes: &NodeAttributes) -> Option<String> {
        match attributes {
            NodeAttributes::Record(a) => Some(a.name.clone()),
            _ => None,
        }
    }

    fn text(&self, attributes: &NodeAttributes) -> Option<String> {
        let NodeAttributes::Record(record) = attributes else {
            return None;
        };
        let text: Vec<&str> = record.fields.values().filter_map(Value::as_str).collect();
        (!text.is_empty()).then(|| text.join(" "))
    }

    fn can_create(&self, ctx: &AccessContext<'_>, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Collaborator)
    }

    fn can_update(&self, ctx: &AccessContext<'_>, node: &Node, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Editor)
            || (has_role(ctx, NodeRole::Collaborator) && node.created_by == ctx.actor)
    }

    fn can_delete(&self, ctx: &AccessContext<'_>, node: &Node) -> bool {
        self.can_update(ctx, node, &node.attributes)
    }
}

impl NodeModel for ChannelModel {
    fn node_type(&self) -> NodeType {
        NodeType::Channel
    }

    fn allowed_parents(&self) -> &'static [NodeType] {
        &[NodeType::Space, NodeType::Folder]
    }

    fn validate(&self, attributes: &NodeAttributes) -> Result<()> {
        let NodeAttributes::Channel(channel) = attributes else {
            return Err(wrong_variant(NodeType::Channel, attributes));
        };
        check_name(NodeType::Channel, &channel.name)
    }

    fn name(&self, attributes: &NodeAttributes) -> Option<String> {
        match attributes {
            NodeAttributes::Channel(a) => Some(a.name.clone()),
            _ => None,
        }
    }

    fn text(&self, _attributes: &NodeAttributes) -> Option<String> {
        None
    }

    fn can_create(&self, ctx: &AccessContext<'_>, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Editor)
    }

    fn can_update(&self, ctx: &AccessContext<'_>, _node: &Node, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Editor)
    }

    fn can_delete(&self, ctx: &AccessContext<'_>, node: &Node) -> bool {
        container_can_delete(ctx, node)
    }
}

impl NodeModel for MessageModel {
    fn node_type(&self) -> NodeType {
        NodeType::Message
    }

    fn allowed_parents(&self) -> &'static [NodeType] {
        &[NodeType::Channel, NodeType::Page]
    }

    fn validate(&self, attributes: &NodeAttributes) -> Result<()> {
        let NodeAttributes::Message(message) = attributes else {
            return Err(wrong_variant(NodeType::Message, attributes));
        };
        if message.content.trim().is_empty() {
            return Err(CoreError::InvalidAttributes("message is empty".into()));
        }
        Ok(())
    }

    fn name(&self, _attributes: &NodeAttributes) -> Option<String> {
        None
    }

    fn text(&self, attributes: &NodeAttributes) -> Option<String> {
        match attributes {
            NodeAttributes::Message(a) => Some(a.content.clone()),
            _ => None,
        }
    }

    fn can_create(&self, ctx: &AccessContext<'_>, _attributes: &NodeAttributes) -> bool {
        has_role(ctx, NodeRole::Collaborator)
    }

    // Messages are only editable by their author.
    fn can_update(&self, ctx: &AccessContext<'_>, node: &Node, _attributes: &NodeAttributes) -> bool {
        node.created_by == ctx.actor && has_role(ctx, NodeRole::Viewer)
    }

    fn can_delete(&self, ctx: &AccessContext<'_>, node: &Node) -> bool {
        node.created_by == ctx.actor || has_role(ctx, NodeRole::Admin)
    }
}
