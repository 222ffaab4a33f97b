//! Transitive closure of the node tree.
//!
//! Each node has a self row at depth 0 and one row per ancestor, so
//! ancestor and descendant lookups are a single prefix scan instead of a
//! recursive walk. `closure` is keyed `ancestor ++ descendant`,
//! `closure_rev` holds the same rows keyed `descendant ++ ancestor`.

use canopy_core::NodeId;
use std::collections::HashSet;
use thiserror::Error;

use crate::storage::rocks::{decode, CF_CLOSURE, CF_CLOSURE_REV};
use crate::storage::{keys, ReplicaStore, StoreError, UnitOfWork};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosurePath {
    pub ancestor_id: NodeId,
    pub descendant_id: NodeId,
    pub depth: u32,
}

#[derive(Error, Debug, Clone)]
pub enum ClosureError {
    #[error("cannot move {node} under its own descendant {parent}")]
    Cycle { node: NodeId, parent: NodeId },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ClosureIndex<'a> {
    store: &'a ReplicaStore,
}

impl<'a> ClosureIndex<'a> {
    pub fn new(store: &'a ReplicaStore) -> Self {
        Self { store }
    }

    /// Rows where `node_id` is the descendant, deepest ancestor first.
    pub fn ancestor_paths(&self, node_id: NodeId) -> Result<Vec<ClosurePath>, StoreError> {
        let mut paths = self.paths(CF_CLOSURE_REV, node_id, |node, other, depth| ClosurePath {
            ancestor_id: other,
            descendant_id: node,
            depth,
        })?;
        paths.sort_by(|a, b| b.depth.cmp(&a.depth));
        Ok(paths)
    }

    /// Rows where `node_id` is the ancestor, shallowest first.
    pub fn descendant_paths(&self, node_id: NodeId) -> Result<Vec<ClosurePath>, StoreError> {
        let mut paths = self.paths(CF_CLOSURE, node_id, |node, other, depth| ClosurePath {
            ancestor_id: node,
            descendant_id: other,
            depth,
        })?;
        paths.sort_by_key(|p| p.depth);
        Ok(paths)
    }

    fn paths<F>(&self, cf: &'static str, node_id: NodeId, build: F) -> Result<Vec<ClosurePath>, StoreError>
    where
        F: Fn(NodeId, NodeId, u32) -> ClosurePath,
    {
        self.store
            .scan_prefix(cf, node_id.as_bytes())?
            .iter()
            .filter_map(|(key, value)| {
                let (_, other) = keys::split_pair(key)?;
                Some(decode::<u32>(value).map(|depth| build(node_id, other, depth)))
            })
            .collect()
    }

    /// Ancestor ids ordered root→self. Empty if the node is not indexed.
    pub fn ancestors_of(&self, node_id: NodeId) -> Result<Vec<NodeId>, StoreError> {
        Ok(self
            .ancestor_paths(node_id)?
            .into_iter()
            .map(|p| p.ancestor_id)
            .collect())
    }

    /// The node and every node below it.
    pub fn descendants_of(&self, node_id: NodeId) -> Result<HashSet<NodeId>, StoreError> {
        Ok(self
            .descendant_paths(node_id)?
            .into_iter()
            .map(|p| p.descendant_id)
            .collect())
    }

    pub fn depth_between(&self, ancestor: NodeId, descendant: NodeId) -> Result<Option<u32>, StoreError> {
        self.store.get(CF_CLOSURE, &keys::pair(ancestor, descendant))
    }

    fn put_path(uow: &mut UnitOfWork<'_>, path: ClosurePath) -> Result<(), StoreError> {
        uow.put(CF_CLOSURE, &keys::pair(path.ancestor_id, path.descendant_id), &path.depth)?;
        uow.put(CF_CLOSURE_REV, &keys::pair(path.descendant_id, path.ancestor_id), &path.depth)
    }

    fn delete_path(uow: &mut UnitOfWork<'_>, ancestor: NodeId, descendant: NodeId) -> Result<(), StoreError> {
        uow.delete(CF_CLOSURE, &keys::pair(ancestor, descendant))?;
        uow.delete(CF_CLOSURE_REV, &keys::pair(descendant, ancestor))
    }

    /// Stage the rows of a new leaf: a self row plus the parent's ancestor
    /// rows, each one level deeper.
    pub fn insert_node(
        &self,
        uow: &mut UnitOfWork<'_>,
        node_id: NodeId,
        parent_id: Option<NodeId>,
    ) -> Result<(), StoreError> {
        Self::put_path(
            uow,
            ClosurePath {
                ancestor_id: node_id,
                descendant_id: node_id,
                depth: 0,
            },
        )?;
        if let Some(parent_id) = parent_id {
            for path in self.ancestor_paths(parent_id)? {
                Self::put_path(
                    uow,
                    ClosurePath {
                        ancestor_id: path.ancestor_id,
                        descendant_id: node_id,
                        depth: path.depth + 1,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Stage a move of `node_id` and its whole subtree under `new_parent`.
    ///
    /// Rows linking the subtree to its old ancestors are dropped and rows to
    /// the new parent's ancestors are added; rows inside the subtree are kept.
    pub fn reparent(
        &self,
        uow: &mut UnitOfWork<'_>,
        node_id: NodeId,
        new_parent: Option<NodeId>,
    ) -> Result<(), ClosureError> {
        let subtree = self.descendant_paths(node_id)?;
        if subtree.is_empty() {
            self.insert_node(uow, node_id, new_parent)?;
            return Ok(());
        }
        if let Some(parent) = new_parent {
            if subtree.iter().any(|p| p.descendant_id == parent) {
                return Err(ClosureError::Cycle { node: node_id, parent });
            }
        }

        let old_ancestors: Vec<ClosurePath> = self
            .ancestor_paths(node_id)?
            .into_iter()
            .filter(|p| p.depth > 0)
            .collect();
        for below in &subtree {
            for above in &old_ancestors {
                Self::delete_path(uow, above.ancestor_id, below.descendant_id)?;
            }
        }

        if let Some(parent) = new_parent {
            let new_ancestors = self.ancestor_paths(parent)?;
            for below in &subtree {
                for above in &new_ancestors {
                    Self::put_path(
                        uow,
                        ClosurePath {
                            ancestor_id: above.ancestor_id,
                            descendant_id: below.descendant_id,
                            depth: above.depth + 1 + below.depth,
                        },
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Stage removal of every row touching the subtree of `node_id`.
    /// Returns the removed subtree, `node_id` included.
    pub fn remove_subtree(&self, uow: &mut UnitOfWork<'_>, node_id: NodeId) -> Result<Vec<NodeId>, StoreError> {
        let subtree: Vec<NodeId> = self
            .descendant_paths(node_id)?
            .into_iter()
            .map(|p| p.descendant_id)
            .collect();
        for descendant in &subtree {
            for path in self.ancestor_paths(*descendant)? {
                Self::delete_path(uow, path.ancestor_id, *descendant)?;
            }
        }
        Ok(subtree)
    }
}
