//! Roles and the capability check.
//!
//! The core never encodes business rules beyond "walk the ancestors, resolve
//! the closest role grant, ask the policy". [`ModelPolicy`] is the default
//! policy and defers to the per-type rules in the attribute registry.

use serde::{Deserialize, Serialize};

use crate::attributes::{model_for, NodeAttributes};
use crate::node::{Node, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Admin,
    Editor,
    Collaborator,
    Viewer,
}

impl NodeRole {
    fn rank(&self) -> u8 {
        match self {
            NodeRole::Admin => 4,
            NodeRole::Editor => 3,
            NodeRole::Collaborator => 2,
            NodeRole::Viewer => 1,
        }
    }

    pub fn at_least(&self, minimum: NodeRole) -> bool {
        self.rank() >= minimum.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Admin => "admin",
            NodeRole::Editor => "editor",
            NodeRole::Collaborator => "collaborator",
            NodeRole::Viewer => "viewer",
        }
    }
}

/// Everything a policy needs to decide on one operation.
///
/// `ancestors` is ordered root→target and, for creates, ends at the parent.
/// `role` is the grant resolved from the closest ancestor naming `actor`.
#[derive(Debug, Clone, Copy)]
pub struct AccessContext<'a> {
    pub actor: UserId,
    pub role: Option<NodeRole>,
    pub ancestors: &'a [Node],
}

impl<'a> AccessContext<'a> {
    pub fn new(actor: UserId, role: Option<NodeRole>, ancestors: &'a [Node]) -> Self {
        Self { actor, role, ancestors }
    }
}

/// Caller-supplied authorization hook.
pub trait AccessPolicy: Send + Sync {
    fn can_create(&self, ctx: &AccessContext<'_>, attributes: &NodeAttributes) -> bool;
    fn can_update(&self, ctx: &AccessContext<'_>, node: &Node, attributes: &NodeAttributes) -> bool;
    fn can_delete(&self, ctx: &AccessContext<'_>, node: &Node) -> bool;
}

/// Default policy backed by the node model registry.
///
/// On top of the per-type rules, changing a node's role grants requires
/// admin on that node.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelPolicy;

impl AccessPolicy for ModelPolicy {
    fn can_create(&self, ctx: &AccessContext<'_>, attributes: &NodeAttributes) -> bool {
        model_for(attributes.node_type()).can_create(ctx, attributes)
    }

    fn can_update(&self, ctx: &AccessContext<'_>, node: &Node, attributes: &NodeAttributes) -> bool {
        if node.node_type != attributes.node_type() {
            return false;
        }
        let grants_changed = node.attributes.collaborators() != attributes.collaborators();
        if grants_changed && !ctx.role.is_some_and(|r| r == NodeRole::Admin) {
            return false;
        }
        model_for(node.node_type).can_update(ctx, node, attributes)
    }

    fn can_delete(&self, ctx: &AccessContext<'_>, node: &Node) -> bool {
        model_for(node.node_type).can_delete(ctx, node)
    }
}

/// Permits everything. Used by replicas that only mirror server-accepted data.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_create(&self, _ctx: &AccessContext<'_>, _attributes: &NodeAttributes) -> bool {
        true
    }

    fn can_update(&self, _ctx: &AccessContext<'_>, _node: &Node, _attributes: &NodeAttributes) -> bool {
        true
    }

    fn can_delete(&self, _ctx: &AccessContext<'_>, _node: &Node) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Collaborators, PageAttributes, SpaceAttributes};
    use crate::node::NodeType;
    use uuid::Uuid;

    fn page(owner: UserId) -> Node {
        Node {
            id: Uuid::new_v4(),
            node_type: NodeType::Page,
            parent_id: Some(Uuid::new_v4()),
            root_id: Uuid::new_v4(),
            attributes: NodeAttributes::Page(PageAttributes {
                parent_id: Uuid::new_v4(),
                name: "Notes".into(),
                content: None,
                collaborators: Collaborators::new(),
            }),
            created_at: 0,
            created_by: owner,
            updated_at: None,
            updated_by: None,
            local_revision: 0,
            server_revision: 0,
        }
    }

    #[test]
    fn test_role_ordering() {
        assert!(NodeRole::Admin.at_least(NodeRole::Editor));
        assert!(NodeRole::Editor.at_least(NodeRole::Editor));
        assert!(!NodeRole::Viewer.at_least(NodeRole::Collaborator));
    }

    #[test]
    fn test_space_creation_requires_self_admin() {
        let actor = Uuid::new_v4();
        let mut collaborators = Collaborators::new();
        collaborators.insert(actor, NodeRole::Admin);
        let attributes = NodeAttributes::Space(SpaceAttributes {
            name: "Home".into(),
            description: None,
            collaborators,
        });

        let ctx = AccessContext::new(actor, None, &[]);
        assert!(ModelPolicy.can_create(&ctx, &attributes));

        let stranger = AccessContext::new(Uuid::new_v4(), None, &[]);
        assert!(!ModelPolicy.can_create(&stranger, &attributes));
    }

    #[test]
    fn test_viewer_cannot_edit_page() {
        let actor = Uuid::new_v4();
        let node = page(actor);
        let viewer = AccessContext::new(actor, Some(NodeRole::Viewer), &[]);
        let editor = AccessContext::new(actor, Some(NodeRole::Editor), &[]);

        assert!(!ModelPolicy.can_update(&viewer, &node, &node.attributes));
        assert!(ModelPolicy.can_update(&editor, &node, &node.attributes));
    }

    #[test]
    fn test_changing_grants_requires_admin() {
        let actor = Uuid::new_v4();
        let node = page(actor);
        let mut changed = node.attributes.clone();
        changed
            .collaborators_mut()
            .unwrap()
            .insert(Uuid::new_v4(), NodeRole::Viewer);

        let editor = AccessContext::new(actor, Some(NodeRole::Editor), &[]);
        let admin = AccessContext::new(actor, Some(NodeRole::Admin), &[]);
        assert!(!ModelPolicy.can_update(&editor, &node, &changed));
        assert!(ModelPolicy.can_update(&admin, &node, &changed));
    }

    #[test]
    fn test_type_change_denied() {
        let actor = Uuid::new_v4();
        let node = page(actor);
        let folder = NodeAttributes::Folder(crate::attributes::FolderAttributes {
            parent_id: Uuid::new_v4(),
            name: "x".into(),
            collaborators: Collaborators::new(),
        });
        let admin = AccessContext::new(actor, Some(NodeRole::Admin), &[]);
        assert!(!ModelPolicy.can_update(&admin, &node, &folder));
    }
}
