//! Role grants derived from node attributes.
//!
//! A node's `collaborators` attribute is mirrored into the `collaborations`
//! column family (`node ++ collaborator`) whenever the node is written.
//! Revoked grants are kept with `deleted_at` set so the revocation can be
//! synced. On the server every change is also appended to
//! `collaboration_log` (`collaborator ++ version`), the per-user stream
//! clients sync to discover their roots.

use canopy_core::{now_millis, Collaborators, NodeId, NodeRole, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::storage::rocks::{decode, CF_COLLABORATIONS, CF_COLLABORATION_LOG};
use crate::storage::{keys, ReplicaStore, StoreError, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaboration {
    pub collaborator_id: UserId,
    pub node_id: NodeId,
    pub root_id: NodeId,
    pub role: NodeRole,
    pub created_at: u64,
    pub updated_at: Option<u64>,
    pub deleted_at: Option<u64>,
    /// Server version of the change; 0 until the server has assigned one.
    pub version: u64,
}

impl Collaboration {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

pub struct Collaborations<'a> {
    store: &'a ReplicaStore,
}

impl<'a> Collaborations<'a> {
    pub fn new(store: &'a ReplicaStore) -> Self {
        Self { store }
    }

    pub fn get(&self, node_id: NodeId, user_id: UserId) -> Result<Option<Collaboration>, StoreError> {
        self.store.get(CF_COLLABORATIONS, &keys::pair(node_id, user_id))
    }

    /// All grants recorded on a node, revoked ones included.
    pub fn for_node(&self, node_id: NodeId) -> Result<Vec<Collaboration>, StoreError> {
        self.store
            .scan_prefix(CF_COLLABORATIONS, node_id.as_bytes())?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    /// Role of `user_id` given an ancestor chain ordered root→target.
    /// The grant closest to the target wins.
    pub fn resolve_role(&self, ancestors: &[NodeId], user_id: UserId) -> Result<Option<NodeRole>, StoreError> {
        for node_id in ancestors.iter().rev() {
            if let Some(grant) = self.get(*node_id, user_id)? {
                if grant.is_active() {
                    return Ok(Some(grant.role));
                }
            }
        }
        Ok(None)
    }

    /// Stage the grant changes implied by moving from `before` to `after`.
    ///
    /// With `version > 0` every change is also appended to the per-user log.
    /// Returns the changed grants.
    pub fn sync_from_attributes(
        &self,
        uow: &mut UnitOfWork<'_>,
        node_id: NodeId,
        root_id: NodeId,
        after: Option<&Collaborators>,
        version: u64,
    ) -> Result<Vec<Collaboration>, StoreError> {
        let now = now_millis();
        let mut changed = Vec::new();
        let existing = self.for_node(node_id)?;

        if let Some(after) = after {
            for (user_id, role) in after {
                let current = existing.iter().find(|c| c.collaborator_id == *user_id);
                let next = match current {
                    Some(c) if c.is_active() && c.role == *role && c.root_id == root_id => continue,
                    Some(c) => Collaboration {
                        role: *role,
                        root_id,
                        updated_at: Some(now),
                        deleted_at: None,
                        version,
                        ..c.clone()
                    },
                    None => Collaboration {
                        collaborator_id: *user_id,
                        node_id,
                        root_id,
                        role: *role,
                        created_at: now,
                        updated_at: None,
                        deleted_at: None,
                        version,
                    },
                };
                changed.push(next);
            }
        }

        for current in existing.iter().filter(|c| c.is_active()) {
            let kept = after.is_some_and(|a| a.contains_key(&current.collaborator_id));
            if !kept {
                changed.push(Collaboration {
                    deleted_at: Some(now),
                    version,
                    ..current.clone()
                });
            }
        }

        for collaboration in &changed {
            self.put(uow, collaboration)?;
        }
        Ok(changed)
    }

    /// Stage a grant as received, logging it when it carries a version.
    pub fn put(&self, uow: &mut UnitOfWork<'_>, collaboration: &Collaboration) -> Result<(), StoreError> {
        uow.put(
            CF_COLLABORATIONS,
            &keys::pair(collaboration.node_id, collaboration.collaborator_id),
            collaboration,
        )?;
        if collaboration.version > 0 {
            uow.put(
                CF_COLLABORATION_LOG,
                &keys::sequenced(collaboration.collaborator_id, collaboration.version),
                collaboration,
            )?;
        }
        Ok(())
    }

    /// Stage removal of every grant row of a node.
    pub fn remove_for_node(&self, uow: &mut UnitOfWork<'_>, node_id: NodeId) -> Result<(), StoreError> {
        for (key, _) in self.store.scan_prefix(CF_COLLABORATIONS, node_id.as_bytes())? {
            uow.delete(CF_COLLABORATIONS, &key)?;
        }
        Ok(())
    }

    /// Roots under which `user_id` holds at least one active grant.
    ///
    /// Reads the per-user log, so only versioned grants count.
    pub fn roots_for(&self, user_id: UserId) -> Result<BTreeSet<NodeId>, StoreError> {
        let mut roots = BTreeSet::new();
        for (_, value) in self.store.scan_prefix(CF_COLLABORATION_LOG, user_id.as_bytes())? {
            let logged: Collaboration = decode(&value)?;
            if let Some(current) = self.get(logged.node_id, user_id)? {
                if current.is_active() {
                    roots.insert(current.root_id);
                }
            }
        }
        Ok(roots)
    }

    /// Logged changes for `user_id` with a version above `cursor`.
    pub fn changes_since(
        &self,
        user_id: UserId,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<Collaboration>, StoreError> {
        let start = keys::sequenced(user_id, cursor.saturating_add(1));
        self.store
            .scan_from(CF_COLLABORATION_LOG, &start, user_id.as_bytes(), limit)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }
}
