//! Durable queue of local mutations awaiting server acknowledgement.
//!
//! Mutations are staged in the same unit of work as the local write that
//! produced them, so a committed change always has its mutation queued.
//! Before each push the queue is compacted:
//!
//! - a create followed by a delete of the same node cancels both, together
//!   with every update in between;
//! - consecutive updates of a node collapse into the newest one, which
//!   inherits the older fragments in order.

use canopy_core::{now_millis, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::rocks::{decode, CF_META, CF_OUTBOX};
use crate::storage::{keys, NodeMarker, ReplicaStore, StoreError, UnitOfWork};

const OUTBOX_SEQUENCE: &str = "outbox";

/// Outbox configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Mutations sent per push (default: 20)
    pub batch_size: usize,
    /// Failed attempts before a mutation is dropped (default: 5)
    pub retry_ceiling: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            retry_ceiling: 5,
        }
    }
}

impl OutboxConfig {
    pub fn for_testing() -> Self {
        Self {
            batch_size: 4,
            retry_ceiling: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationType {
    CreateNode,
    UpdateNode,
    DeleteNode,
}

/// One CRDT fragment carried by a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentData {
    pub id: Uuid,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationPayload {
    CreateNode {
        node_id: NodeId,
        root_id: NodeId,
        fragment: FragmentData,
    },
    UpdateNode {
        node_id: NodeId,
        root_id: NodeId,
        /// Oldest first
        fragments: Vec<FragmentData>,
    },
    DeleteNode {
        node_id: NodeId,
        root_id: NodeId,
    },
}

impl MutationPayload {
    pub fn mutation_type(&self) -> MutationType {
        match self {
            MutationPayload::CreateNode { .. } => MutationType::CreateNode,
            MutationPayload::UpdateNode { .. } => MutationType::UpdateNode,
            MutationPayload::DeleteNode { .. } => MutationType::DeleteNode,
        }
    }

    pub fn node_id(&self) -> NodeId {
        match self {
            MutationPayload::CreateNode { node_id, .. }
            | MutationPayload::UpdateNode { node_id, .. }
            | MutationPayload::DeleteNode { node_id, .. } => *node_id,
        }
    }

    pub fn root_id(&self) -> NodeId {
        match self {
            MutationPayload::CreateNode { root_id, .. }
            | MutationPayload::UpdateNode { root_id, .. }
            | MutationPayload::DeleteNode { root_id, .. } => *root_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMutation {
    pub id: u64,
    pub mutation_type: MutationType,
    pub target_id: NodeId,
    pub payload: MutationPayload,
    pub created_at: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub cancelled: usize,
    pub merged: usize,
}

impl CompactionStats {
    pub fn removed(&self) -> usize {
        self.cancelled + self.merged
    }
}

pub struct MutationOutbox {
    store: Arc<ReplicaStore>,
    config: OutboxConfig,
}

impl MutationOutbox {
    pub fn new(store: Arc<ReplicaStore>, config: OutboxConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Queue a mutation in its own unit of work.
    pub fn enqueue(&self, payload: MutationPayload) -> Result<OutboxMutation, StoreError> {
        self.store.write(|uow| self.enqueue_in(uow, payload))
    }

    /// Stage a mutation inside the caller's unit of work.
    pub fn enqueue_in(&self, uow: &mut UnitOfWork<'_>, payload: MutationPayload) -> Result<OutboxMutation, StoreError> {
        let id = uow.next_sequence(OUTBOX_SEQUENCE)?;
        let mutation = OutboxMutation {
            id,
            mutation_type: payload.mutation_type(),
            target_id: payload.node_id(),
            payload,
            created_at: now_millis(),
            retry_count: 0,
        };
        uow.put(CF_OUTBOX, &keys::seq(id), &mutation)?;
        log::trace!("Queued {:?} #{id} for {}", mutation.mutation_type, mutation.target_id);
        Ok(mutation)
    }

    /// Every queued mutation, oldest first.
    pub fn pending(&self) -> Result<Vec<OutboxMutation>, StoreError> {
        self.store
            .scan_prefix(CF_OUTBOX, &[])?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    /// Up to `limit` oldest mutations. They stay queued until acknowledged
    /// or evicted.
    pub fn drain(&self, limit: usize) -> Result<Vec<OutboxMutation>, StoreError> {
        self.store
            .scan_from(CF_OUTBOX, &[], &[], limit)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.store.scan_prefix(CF_OUTBOX, &[])?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Cancel create/delete pairs and collapse repeated updates.
    pub fn compact(&self) -> Result<CompactionStats, StoreError> {
        self.store.write(|uow| {
            let pending = self.pending()?;
            let mut dropped: HashSet<u64> = HashSet::new();
            let mut stats = CompactionStats::default();

            // Newest → oldest.
            let mut later_delete: HashMap<NodeId, u64> = HashMap::new();
            let mut survivor: HashMap<NodeId, usize> = HashMap::new();
            let mut inherited: HashMap<usize, Vec<FragmentData>> = HashMap::new();

            for (index, mutation) in pending.iter().enumerate().rev() {
                let target = mutation.target_id;
                match &mutation.payload {
                    MutationPayload::DeleteNode { .. } => {
                        later_delete.insert(target, mutation.id);
                        survivor.remove(&target);
                    }
                    MutationPayload::UpdateNode { fragments, .. } => match survivor.get(&target) {
                        Some(newer) => {
                            dropped.insert(mutation.id);
                            stats.merged += 1;
                            let carried = inherited.entry(*newer).or_default();
                            let mut older = fragments.clone();
                            older.append(carried);
                            *carried = older;
                        }
                        None => {
                            survivor.insert(target, index);
                        }
                    },
                    MutationPayload::CreateNode { .. } => {
                        if let Some(delete_id) = later_delete.remove(&target) {
                            dropped.insert(mutation.id);
                            dropped.insert(delete_id);
                            stats.cancelled += 2;
                            if let Some(newer) = survivor.remove(&target) {
                                dropped.insert(pending[newer].id);
                                inherited.remove(&newer);
                                stats.cancelled += 1;
                            }
                        }
                        survivor.remove(&target);
                    }
                }
            }

            for mutation in pending.iter().filter(|m| dropped.contains(&m.id)) {
                uow.delete(CF_OUTBOX, &keys::seq(mutation.id))?;
            }
            for (index, mut older) in inherited {
                let mut mutation = pending[index].clone();
                if let MutationPayload::UpdateNode { fragments, .. } = &mut mutation.payload {
                    older.append(fragments);
                    *fragments = older;
                }
                uow.put(CF_OUTBOX, &keys::seq(mutation.id), &mutation)?;
            }

            if stats.removed() > 0 {
                log::debug!(
                    "Outbox compaction: {} cancelled, {} merged",
                    stats.cancelled,
                    stats.merged
                );
            }
            Ok(stats)
        })
    }

    /// Remove mutations the server accepted (or rejected for good).
    pub fn acknowledge(&self, ids: &[u64]) -> Result<usize, StoreError> {
        self.store.write(|uow| {
            let mut removed = 0;
            for id in ids {
                if uow.store().contains(CF_OUTBOX, &keys::seq(*id))? {
                    uow.delete(CF_OUTBOX, &keys::seq(*id))?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Bump the retry count of failed mutations. Those reaching the retry
    /// ceiling are dropped, their node marked out of sync, and returned.
    pub fn fail_and_retry(&self, ids: &[u64]) -> Result<Vec<OutboxMutation>, StoreError> {
        self.store.write(|uow| {
            let mut evicted = Vec::new();
            for id in ids {
                let key = keys::seq(*id);
                let Some(mut mutation) = uow.store().get::<OutboxMutation>(CF_OUTBOX, &key)? else {
                    continue;
                };
                mutation.retry_count += 1;
                if mutation.retry_count >= self.config.retry_ceiling {
                    log::warn!(
                        "Dropping {:?} #{} for {} after {} attempts",
                        mutation.mutation_type,
                        mutation.id,
                        mutation.target_id,
                        mutation.retry_count
                    );
                    uow.delete(CF_OUTBOX, &key)?;
                    let reason = format!("{:?} dropped after {} attempts", mutation.mutation_type, mutation.retry_count);
                    uow.put(CF_META, &NodeMarker::OutOfSync.key(mutation.target_id), &reason)?;
                    evicted.push(mutation);
                } else {
                    uow.put(CF_OUTBOX, &key, &mutation)?;
                }
            }
            Ok(evicted)
        })
    }

    /// Nodes whose local state diverged because a mutation was dropped.
    pub fn out_of_sync(&self) -> Result<Vec<(NodeId, String)>, StoreError> {
        NodeMarker::OutOfSync.list(&self.store)
    }
}
