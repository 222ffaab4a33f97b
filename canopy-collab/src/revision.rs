//! Revisioned node store.
//!
//! Local writes run an optimistic compare-and-swap loop: load and replay the
//! node's fragments, apply the caller's change, produce a fragment, and
//! commit only if `local_revision` is still the one that was loaded. The
//! replay happens outside the store's write lock; only the revision check
//! and the batch run inside it.
//!
//! The same staging helpers back the server's transaction log, which runs
//! them under its own version assignment.

use canopy_core::{
    model_for, now_millis, AccessContext, AccessPolicy, CoreError, CrdtDocument, Node,
    NodeAttributes, NodeId, NodeRole, NodeType, UserId, YrsDocument,
};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::closure::{ClosureError, ClosureIndex};
use crate::collaboration::{Collaboration, Collaborations};
use crate::outbox::{FragmentData, MutationOutbox, MutationPayload};
use crate::protocol::{MutationStatus, ServerTransaction, TransactionOperation};
use crate::storage::rocks::{CF_META, CF_NODES, CF_TRANSACTION_IDS};
use crate::storage::{keys, FragmentLog, NodeMarker, ReplicaStore, StoreError, UnitOfWork, UpdateFragment};

/// Recorded against fragment ids written on this replica until the server
/// echoes them back with a version.
const LOCAL_VERSION: u64 = 0;

#[derive(Debug, Clone)]
pub struct RevisionConfig {
    /// CAS attempts before an update gives up (default: 20)
    pub max_update_attempts: usize,
    /// Fragment count that triggers compaction after a commit (default: 64)
    pub compaction_threshold: usize,
}

impl Default for RevisionConfig {
    fn default() -> Self {
        Self {
            max_update_attempts: 20,
            compaction_threshold: 64,
        }
    }
}

impl RevisionConfig {
    pub fn for_testing() -> Self {
        Self {
            max_update_attempts: 20,
            compaction_threshold: 8,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum RevisionError {
    #[error("node {0} not found")]
    NotFound(NodeId),
    #[error("invalid attributes: {0}")]
    InvalidAttributes(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("node {0} changed concurrently")]
    Conflict(NodeId),
    #[error("update of {node} failed after {attempts} attempts")]
    UpdateFailed { node: NodeId, attempts: usize },
    #[error("node {node} is unreadable: {reason}")]
    Unreadable { node: NodeId, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RevisionError {
    pub fn status(&self) -> MutationStatus {
        match self {
            RevisionError::NotFound(_) => MutationStatus::NotFound,
            RevisionError::InvalidAttributes(_) => MutationStatus::InvalidAttributes,
            RevisionError::Unauthorized(_) => MutationStatus::Unauthorized,
            RevisionError::Conflict(_)
            | RevisionError::UpdateFailed { .. }
            | RevisionError::Unreadable { .. }
            | RevisionError::Store(_) => MutationStatus::Failed,
        }
    }
}

impl From<CoreError> for RevisionError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidAttributes(m) => RevisionError::InvalidAttributes(m),
            CoreError::Unauthorized(m) => RevisionError::Unauthorized(m),
            CoreError::CorruptUpdate(reason) => RevisionError::Unreadable {
                node: Uuid::nil(),
                reason,
            },
            CoreError::Unreadable(node) => RevisionError::Unreadable {
                node,
                reason: "previously marked unreadable".into(),
            },
        }
    }
}

impl From<ClosureError> for RevisionError {
    fn from(e: ClosureError) -> Self {
        match e {
            ClosureError::Cycle { .. } => RevisionError::InvalidAttributes(e.to_string()),
            ClosureError::Store(e) => RevisionError::Store(e),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Updated {
        node: Node,
        fragment: UpdateFragment,
        attempts: usize,
    },
    /// The updater returned the attributes unchanged; nothing was written
    Unchanged(Node),
}

impl UpdateOutcome {
    pub fn node(&self) -> &Node {
        match self {
            UpdateOutcome::Updated { node, .. } | UpdateOutcome::Unchanged(node) => node,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Created(Node),
    Updated(Node),
    /// Already applied; at most `server_revision` moved
    Confirmed(Node),
    Deleted(Vec<NodeId>),
    Skipped,
}

/// Node writes staged for one commit.
pub(crate) struct StagedWrite {
    pub collaborations: Vec<Collaboration>,
}

pub struct RevisionStore {
    store: Arc<ReplicaStore>,
    policy: Arc<dyn AccessPolicy>,
    outbox: Option<Arc<MutationOutbox>>,
    config: RevisionConfig,
}

impl RevisionStore {
    pub fn new(store: Arc<ReplicaStore>, policy: Arc<dyn AccessPolicy>, config: RevisionConfig) -> Self {
        Self {
            store,
            policy,
            outbox: None,
            config,
        }
    }

    /// Queue every local write in `outbox`.
    pub fn with_outbox(mut self, outbox: Arc<MutationOutbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn outbox(&self) -> Option<&Arc<MutationOutbox>> {
        self.outbox.as_ref()
    }

    pub fn closure(&self) -> ClosureIndex<'_> {
        ClosureIndex::new(&self.store)
    }

    pub fn collaborations(&self) -> Collaborations<'_> {
        Collaborations::new(&self.store)
    }

    pub(crate) fn fragments(&self) -> FragmentLog<'_> {
        FragmentLog::new(&self.store)
    }

    pub fn get_node(&self, node_id: NodeId) -> Result<Option<Node>, RevisionError> {
        Ok(self.store.get_json(CF_NODES, &keys::id(node_id))?)
    }

    /// Nodes whose parent is `node_id`.
    pub fn children_of(&self, node_id: NodeId) -> Result<Vec<Node>, RevisionError> {
        let mut children = Vec::new();
        for path in self.closure().descendant_paths(node_id)? {
            if path.depth != 1 {
                continue;
            }
            if let Some(child) = self.get_node(path.descendant_id)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Nodes from the root down to `node_id`.
    pub fn ancestors_of(&self, node_id: NodeId) -> Result<Vec<Node>, RevisionError> {
        let chain = self.closure().ancestors_of(node_id)?;
        self.load_nodes(&chain)
    }

    fn load_nodes(&self, ids: &[NodeId]) -> Result<Vec<Node>, RevisionError> {
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.get_node(*id)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub fn role_of(&self, node_id: NodeId, user_id: UserId) -> Result<Option<NodeRole>, RevisionError> {
        let chain = self.closure().ancestors_of(node_id)?;
        Ok(self.collaborations().resolve_role(&chain, user_id)?)
    }

    /// Ancestor nodes and resolved role for a chain ordered root→target.
    pub(crate) fn access(&self, chain: &[NodeId], actor: UserId) -> Result<(Vec<Node>, Option<NodeRole>), RevisionError> {
        let ancestors = self.load_nodes(chain)?;
        let role = self.collaborations().resolve_role(chain, actor)?;
        Ok((ancestors, role))
    }

    /// Rebuild a node's document from its fragment log.
    pub fn load_document(&self, node_id: NodeId) -> Result<YrsDocument, RevisionError> {
        let fragments = self.fragments().load(node_id)?;
        YrsDocument::replay(fragments.iter().map(|f| f.data.as_slice())).map_err(|e| unreadable(node_id, e))
    }

    /// Look up and type-check the parent a node of `node_type` would live under.
    pub(crate) fn resolve_parent(
        &self,
        node_type: NodeType,
        parent_id: Option<NodeId>,
    ) -> Result<Option<Node>, RevisionError> {
        let parent = match parent_id {
            Some(id) => Some(self.get_node(id)?.ok_or(RevisionError::NotFound(id))?),
            None => None,
        };
        model_for(node_type).validate_parent(parent.as_ref().map(|p| p.node_type))?;
        Ok(parent)
    }

    pub(crate) fn authorize_create(
        &self,
        actor: UserId,
        parent: Option<&Node>,
        attributes: &NodeAttributes,
    ) -> Result<(), RevisionError> {
        let chain = match parent {
            Some(parent) => self.closure().ancestors_of(parent.id)?,
            None => Vec::new(),
        };
        let (ancestors, role) = self.access(&chain, actor)?;
        let ctx = AccessContext::new(actor, role, &ancestors);
        if !self.policy.can_create(&ctx, attributes) {
            return Err(RevisionError::Unauthorized(format!(
                "{actor} cannot create {} here",
                attributes.node_type()
            )));
        }
        Ok(())
    }

    pub(crate) fn authorize_update(
        &self,
        actor: UserId,
        node: &Node,
        attributes: &NodeAttributes,
    ) -> Result<(), RevisionError> {
        let chain = self.closure().ancestors_of(node.id)?;
        let (ancestors, role) = self.access(&chain, actor)?;
        let ctx = AccessContext::new(actor, role, &ancestors);
        if !self.policy.can_update(&ctx, node, attributes) {
            return Err(RevisionError::Unauthorized(format!("{actor} cannot update {}", node.id)));
        }
        Ok(())
    }

    pub(crate) fn authorize_delete(&self, actor: UserId, node: &Node) -> Result<(), RevisionError> {
        let chain = self.closure().ancestors_of(node.id)?;
        let (ancestors, role) = self.access(&chain, actor)?;
        let ctx = AccessContext::new(actor, role, &ancestors);
        if !self.policy.can_delete(&ctx, node) {
            return Err(RevisionError::Unauthorized(format!("{actor} cannot delete {}", node.id)));
        }
        Ok(())
    }

    /// Create a node with a fresh id.
    pub fn create_node(
        &self,
        actor: UserId,
        attributes: NodeAttributes,
    ) -> Result<(Node, UpdateFragment), RevisionError> {
        self.create_node_with_id(actor, Uuid::new_v4(), attributes)
    }

    pub fn create_node_with_id(
        &self,
        actor: UserId,
        node_id: NodeId,
        attributes: NodeAttributes,
    ) -> Result<(Node, UpdateFragment), RevisionError> {
        attributes.validate()?;
        let mut document = YrsDocument::new();
        let data = document.write(&attributes.to_value()?)?;
        let fragment = UpdateFragment {
            id: Uuid::new_v4(),
            node_id,
            data,
            created_at: now_millis(),
            created_by: actor,
        };

        let node = self.store.write(|uow| {
            if uow.store().contains(CF_NODES, &keys::id(node_id))? {
                return Err(RevisionError::InvalidAttributes(format!("node {node_id} already exists")));
            }
            let parent = self.resolve_parent(attributes.node_type(), attributes.parent_id())?;
            self.authorize_create(actor, parent.as_ref(), &attributes)?;

            let root_id = parent.as_ref().map(|p| p.root_id).unwrap_or(node_id);
            let node = Node {
                id: node_id,
                node_type: attributes.node_type(),
                parent_id: attributes.parent_id(),
                root_id,
                attributes: attributes.clone(),
                created_at: fragment.created_at,
                created_by: actor,
                updated_at: None,
                updated_by: None,
                local_revision: 0,
                server_revision: 0,
            };
            self.stage_new(uow, &node, &fragment, 0)?;
            uow.put(CF_TRANSACTION_IDS, &keys::id(fragment.id), &LOCAL_VERSION)?;
            if let Some(outbox) = &self.outbox {
                outbox.enqueue_in(
                    uow,
                    MutationPayload::CreateNode {
                        node_id,
                        root_id,
                        fragment: FragmentData {
                            id: fragment.id,
                            data: fragment.data.clone(),
                        },
                    },
                )?;
            }
            Ok(node)
        })?;

        log::debug!("Created {} {} under {:?}", node.node_type, node.id, node.parent_id);
        Ok((node, fragment))
    }

    /// Change a node's attributes through `updater`, retrying on concurrent
    /// commits. `updater` may run once per attempt.
    pub fn update_node<F>(&self, actor: UserId, node_id: NodeId, updater: F) -> Result<UpdateOutcome, RevisionError>
    where
        F: FnMut(NodeAttributes) -> NodeAttributes,
    {
        let result = self.update_with_retries(actor, node_id, updater);
        self.surface(result)
    }

    fn update_with_retries<F>(&self, actor: UserId, node_id: NodeId, mut updater: F) -> Result<UpdateOutcome, RevisionError>
    where
        F: FnMut(NodeAttributes) -> NodeAttributes,
    {
        let max_attempts = self.config.max_update_attempts;
        for attempt in 1..=max_attempts {
            let node = self.get_node(node_id)?.ok_or(RevisionError::NotFound(node_id))?;
            let mut document = self.load_document(node_id)?;

            let attributes = updater(node.attributes.clone());
            if attributes == node.attributes {
                return Ok(UpdateOutcome::Unchanged(node));
            }
            attributes.validate()?;
            if attributes.node_type() != node.node_type {
                return Err(RevisionError::InvalidAttributes(format!(
                    "{} cannot become {}",
                    node.node_type,
                    attributes.node_type()
                )));
            }

            let fragment = UpdateFragment {
                id: Uuid::new_v4(),
                node_id,
                data: document.write(&attributes.to_value()?)?,
                created_at: now_millis(),
                created_by: actor,
            };

            match self.commit_update(actor, &node, attributes, &fragment) {
                Ok(updated) => {
                    self.compact_if_needed(node_id);
                    return Ok(UpdateOutcome::Updated {
                        node: updated,
                        fragment,
                        attempts: attempt,
                    });
                }
                Err(RevisionError::Conflict(_)) => {
                    log::debug!("Revision conflict on {node_id}, attempt {attempt}/{max_attempts}");
                }
                Err(e) => return Err(e),
            }
        }

        log::warn!("Giving up on {node_id} after {max_attempts} attempts");
        Err(RevisionError::UpdateFailed {
            node: node_id,
            attempts: max_attempts,
        })
    }

    fn commit_update(
        &self,
        actor: UserId,
        loaded: &Node,
        attributes: NodeAttributes,
        fragment: &UpdateFragment,
    ) -> Result<Node, RevisionError> {
        self.store.write(|uow| {
            let current: Node = uow
                .store()
                .get_json(CF_NODES, &keys::id(loaded.id))?
                .ok_or(RevisionError::NotFound(loaded.id))?;
            if current.local_revision != loaded.local_revision {
                return Err(RevisionError::Conflict(loaded.id));
            }
            self.authorize_update(actor, &current, &attributes)?;

            let mut root_id = current.root_id;
            if attributes.parent_id() != current.parent_id {
                let parent = self.resolve_parent(current.node_type, attributes.parent_id())?;
                self.authorize_create(actor, parent.as_ref(), &attributes)?;
                root_id = parent.map(|p| p.root_id).unwrap_or(current.id);
            }

            let node = Node {
                parent_id: attributes.parent_id(),
                root_id,
                attributes,
                updated_at: Some(fragment.created_at),
                updated_by: Some(actor),
                local_revision: current.local_revision + 1,
                ..current.clone()
            };
            self.stage_change(uow, &current, &node, fragment, 0)?;
            uow.put(CF_TRANSACTION_IDS, &keys::id(fragment.id), &LOCAL_VERSION)?;
            if let Some(outbox) = &self.outbox {
                outbox.enqueue_in(
                    uow,
                    MutationPayload::UpdateNode {
                        node_id: node.id,
                        root_id: node.root_id,
                        fragments: vec![FragmentData {
                            id: fragment.id,
                            data: fragment.data.clone(),
                        }],
                    },
                )?;
            }
            Ok(node)
        })
    }

    /// Delete a node and its subtree. Returns the removed ids.
    pub fn delete_node(&self, actor: UserId, node_id: NodeId) -> Result<Vec<NodeId>, RevisionError> {
        let removed = self.store.write(|uow| {
            let node: Node = uow
                .store()
                .get_json(CF_NODES, &keys::id(node_id))?
                .ok_or(RevisionError::NotFound(node_id))?;
            self.authorize_delete(actor, &node)?;

            let staged = self.stage_delete(uow, &node, 0)?;
            if let Some(outbox) = &self.outbox {
                outbox.enqueue_in(
                    uow,
                    MutationPayload::DeleteNode {
                        node_id,
                        root_id: node.root_id,
                    },
                )?;
            }
            Ok::<_, RevisionError>(staged.0)
        })?;

        log::debug!("Deleted {node_id} ({} nodes)", removed.len());
        Ok(removed)
    }

    /// Merge a server transaction. Idempotent per transaction id.
    pub fn apply_remote_transaction(&self, tx: &ServerTransaction) -> Result<RemoteOutcome, RevisionError> {
        let result = match tx.operation {
            TransactionOperation::Delete => self.apply_remote_delete(tx),
            TransactionOperation::Create | TransactionOperation::Update => self.apply_remote_change(tx),
        };
        if let Ok(RemoteOutcome::Created(_) | RemoteOutcome::Updated(_)) = &result {
            self.compact_if_needed(tx.node_id);
        }
        self.surface(result)
    }

    fn apply_remote_change(&self, tx: &ServerTransaction) -> Result<RemoteOutcome, RevisionError> {
        let data = tx
            .data
            .as_deref()
            .ok_or_else(|| RevisionError::InvalidAttributes(format!("transaction {} has no data", tx.id)))?;

        self.store.write(|uow| {
            let existing: Option<Node> = uow.store().get_json(CF_NODES, &keys::id(tx.node_id))?;

            let seen = uow.store().contains(CF_TRANSACTION_IDS, &keys::id(tx.id))?
                || match &existing {
                    Some(node) => self.fragments().contains(node.id, tx.id)?,
                    None => false,
                };
            if seen {
                return match &existing {
                    Some(node) => Ok(RemoteOutcome::Confirmed(self.confirm(uow, node, tx)?)),
                    None => Ok(RemoteOutcome::Skipped),
                };
            }
            if existing.is_none() && tx.operation == TransactionOperation::Update {
                // Deleted here, or never part of a root this replica follows.
                // Entering a followed root always arrives as a full-state create.
                log::debug!("Ignoring update of unknown node {} at v{}", tx.node_id, tx.version);
                uow.put(CF_TRANSACTION_IDS, &keys::id(tx.id), &tx.version)?;
                return Ok(RemoteOutcome::Skipped);
            }

            let mut document = match &existing {
                Some(_) => self.load_document(tx.node_id)?,
                None => YrsDocument::new(),
            };
            document.apply_update(data).map_err(|e| unreadable(tx.node_id, e))?;
            let attributes = NodeAttributes::from_value(document.materialize())?;
            let fragment = UpdateFragment {
                id: tx.id,
                node_id: tx.node_id,
                data: data.to_vec(),
                created_at: tx.created_at,
                created_by: tx.created_by,
            };
            uow.put(CF_TRANSACTION_IDS, &keys::id(tx.id), &tx.version)?;

            match existing {
                None => {
                    let node = Node {
                        id: tx.node_id,
                        node_type: attributes.node_type(),
                        parent_id: attributes.parent_id(),
                        root_id: tx.root_id,
                        attributes,
                        created_at: tx.created_at,
                        created_by: tx.created_by,
                        updated_at: None,
                        updated_by: None,
                        local_revision: 0,
                        server_revision: tx.version,
                    };
                    self.stage_new(uow, &node, &fragment, 0)?;
                    Ok(RemoteOutcome::Created(node))
                }
                Some(before) => {
                    // A create carries the node's creation stamp, not an edit.
                    let (updated_at, updated_by) = match tx.operation {
                        TransactionOperation::Create => (before.updated_at, before.updated_by),
                        _ => (Some(tx.created_at), Some(tx.created_by)),
                    };
                    // The merged parent decides the root, so a late transaction
                    // from a former root cannot pull the node back.
                    let root_id = match attributes.parent_id() {
                        Some(parent_id) => uow
                            .store()
                            .get_json::<Node>(CF_NODES, &keys::id(parent_id))?
                            .map_or(tx.root_id, |parent| parent.root_id),
                        None => before.root_id,
                    };
                    let node = Node {
                        node_type: attributes.node_type(),
                        parent_id: attributes.parent_id(),
                        root_id,
                        attributes,
                        updated_at,
                        updated_by,
                        local_revision: before.local_revision + 1,
                        server_revision: before.server_revision.max(tx.version),
                        ..before.clone()
                    };
                    self.stage_change(uow, &before, &node, &fragment, 0)?;
                    Ok(RemoteOutcome::Updated(node))
                }
            }
        })
    }

    fn apply_remote_delete(&self, tx: &ServerTransaction) -> Result<RemoteOutcome, RevisionError> {
        self.store.write(|uow| {
            let existing: Option<Node> = uow.store().get_json(CF_NODES, &keys::id(tx.node_id))?;
            uow.put(CF_TRANSACTION_IDS, &keys::id(tx.id), &tx.version)?;
            match existing {
                // The node left this root; its new root carries it on.
                Some(node) if node.root_id != tx.root_id => {
                    log::debug!("Ignoring delete of {} from former root {}", node.id, tx.root_id);
                    Ok(RemoteOutcome::Skipped)
                }
                Some(node) => {
                    let (removed, _) = self.stage_delete(uow, &node, 0)?;
                    Ok(RemoteOutcome::Deleted(removed))
                }
                None => Ok(RemoteOutcome::Skipped),
            }
        })
    }

    fn confirm(&self, uow: &mut UnitOfWork<'_>, node: &Node, tx: &ServerTransaction) -> Result<Node, RevisionError> {
        if node.server_revision >= tx.version {
            return Ok(node.clone());
        }
        let node = Node {
            server_revision: tx.version,
            ..node.clone()
        };
        uow.put_json(CF_NODES, &keys::id(node.id), &node)?;
        Ok(node)
    }

    /// Record a server-assigned version for a node this replica wrote.
    pub fn mark_synced(&self, node_id: NodeId, version: u64) -> Result<Option<Node>, RevisionError> {
        self.store.write(|uow| {
            let Some(node) = uow.store().get_json::<Node>(CF_NODES, &keys::id(node_id))? else {
                return Ok(None);
            };
            if node.server_revision >= version {
                return Ok(Some(node));
            }
            let node = Node {
                server_revision: version,
                ..node
            };
            uow.put_json(CF_NODES, &keys::id(node_id), &node)?;
            Ok(Some(node))
        })
    }

    /// Fold a node's fragment log into one snapshot fragment.
    pub fn compact_node(&self, node_id: NodeId) -> Result<usize, RevisionError> {
        self.store.write(|uow| {
            let document = self.load_document(node_id)?;
            let folded = self.fragments().compact(uow, node_id, &document.encode_state())?;
            if folded > 0 {
                log::debug!("Compacted {folded} fragments of {node_id}");
            }
            Ok(folded)
        })
    }

    fn compact_if_needed(&self, node_id: NodeId) {
        let count = match self.fragments().count(node_id) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Fragment count for {node_id} failed: {e}");
                return;
            }
        };
        if count > self.config.compaction_threshold {
            if let Err(e) = self.compact_node(node_id) {
                log::warn!("Compaction of {node_id} failed: {e}");
            }
        }
    }

    /// Nodes whose fragments could not be replayed.
    pub fn unreadable_nodes(&self) -> Result<Vec<(NodeId, String)>, RevisionError> {
        Ok(NodeMarker::Unreadable.list(&self.store)?)
    }

    fn surface<T>(&self, result: Result<T, RevisionError>) -> Result<T, RevisionError> {
        if let Err(RevisionError::Unreadable { node, reason }) = &result {
            log::error!("Node {node} is unreadable: {reason}");
            let marked = self.store.write(|uow| {
                uow.put(CF_META, &NodeMarker::Unreadable.key(*node), reason)
            });
            if let Err(e) = marked {
                log::warn!("Could not mark {node} unreadable: {e}");
            }
        }
        result
    }

    /// Stage the rows of a node that did not exist before.
    pub(crate) fn stage_new(
        &self,
        uow: &mut UnitOfWork<'_>,
        node: &Node,
        fragment: &UpdateFragment,
        version: u64,
    ) -> Result<StagedWrite, RevisionError> {
        uow.put_json(CF_NODES, &keys::id(node.id), node)?;
        self.fragments().append(uow, fragment)?;
        self.closure().insert_node(uow, node.id, node.parent_id)?;
        let collaborations = self.collaborations().sync_from_attributes(
            uow,
            node.id,
            node.root_id,
            node.attributes.collaborators(),
            version,
        )?;
        Ok(StagedWrite { collaborations })
    }

    /// Stage a change of an existing node, moving its subtree when the
    /// parent changed.
    pub(crate) fn stage_change(
        &self,
        uow: &mut UnitOfWork<'_>,
        before: &Node,
        after: &Node,
        fragment: &UpdateFragment,
        version: u64,
    ) -> Result<StagedWrite, RevisionError> {
        uow.put_json(CF_NODES, &keys::id(after.id), after)?;
        self.fragments().append(uow, fragment)?;

        let mut collaborations = Vec::new();
        if after.parent_id != before.parent_id {
            let subtree = self.closure().descendants_of(after.id)?;
            self.closure().reparent(uow, after.id, after.parent_id)?;

            if after.root_id != before.root_id {
                for descendant in subtree.into_iter().filter(|id| *id != after.id) {
                    let Some(mut moved) = self.get_node(descendant)? else {
                        continue;
                    };
                    moved.root_id = after.root_id;
                    uow.put_json(CF_NODES, &keys::id(descendant), &moved)?;
                    collaborations.extend(self.collaborations().sync_from_attributes(
                        uow,
                        descendant,
                        after.root_id,
                        moved.attributes.collaborators(),
                        version,
                    )?);
                }
            }
        }

        collaborations.extend(self.collaborations().sync_from_attributes(
            uow,
            after.id,
            after.root_id,
            after.attributes.collaborators(),
            version,
        )?);
        Ok(StagedWrite { collaborations })
    }

    /// Stage removal of a node's subtree with all dependent rows.
    /// Returns the removed ids and the revoked grants.
    pub(crate) fn stage_delete(
        &self,
        uow: &mut UnitOfWork<'_>,
        node: &Node,
        version: u64,
    ) -> Result<(Vec<NodeId>, Vec<Collaboration>), RevisionError> {
        let removed = self.closure().remove_subtree(uow, node.id)?;
        let removed = if removed.is_empty() { vec![node.id] } else { removed };

        let mut revoked = Vec::new();
        for id in &removed {
            uow.delete(CF_NODES, &keys::id(*id))?;
            self.fragments().remove_all(uow, *id)?;
            if version > 0 {
                revoked.extend(self.collaborations().sync_from_attributes(uow, *id, node.root_id, None, version)?);
            } else {
                self.collaborations().remove_for_node(uow, *id)?;
            }
        }
        Ok((removed, revoked))
    }
}

fn unreadable(node: NodeId, e: CoreError) -> RevisionError {
    RevisionError::Unreadable {
        node,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxConfig;
    use crate::storage::StoreConfig;
    use canopy_core::{Collaborators, FolderAttributes, ModelPolicy, PageAttributes, SpaceAttributes};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        revisions: RevisionStore,
        outbox: Arc<MutationOutbox>,
        user: UserId,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(ReplicaStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let outbox = Arc::new(MutationOutbox::new(store.clone(), OutboxConfig::default()));
        let revisions = RevisionStore::new(store, Arc::new(ModelPolicy), RevisionConfig::for_testing())
            .with_outbox(outbox.clone());
        Fixture {
            _dir: dir,
            revisions,
            outbox,
            user: Uuid::new_v4(),
        }
    }

    fn space(admin: UserId) -> NodeAttributes {
        let mut collaborators = Collaborators::new();
        collaborators.insert(admin, NodeRole::Admin);
        NodeAttributes::Space(SpaceAttributes {
            name: "Team".into(),
            description: None,
            collaborators,
        })
    }

    fn page(parent_id: NodeId, name: &str) -> NodeAttributes {
        NodeAttributes::Page(PageAttributes {
            parent_id,
            name: name.into(),
            content: None,
            collaborators: Collaborators::new(),
        })
    }

    #[test]
    fn test_create_queues_mutation() {
        let f = fixture();
        let (root, fragment) = f.revisions.create_node(f.user, space(f.user)).unwrap();
        let (child, _) = f.revisions.create_node(f.user, page(root.id, "Notes")).unwrap();

        assert_eq!(root.root_id, root.id);
        assert_eq!(child.root_id, root.id);
        assert_eq!(child.local_revision, 0);
        assert!(!fragment.data.is_empty());
        assert_eq!(f.outbox.len().unwrap(), 2);
        assert_eq!(f.revisions.children_of(root.id).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_attributes_not_queued() {
        let f = fixture();
        let (root, _) = f.revisions.create_node(f.user, space(f.user)).unwrap();
        let result = f.revisions.create_node(f.user, page(root.id, "  "));

        assert!(matches!(result, Err(RevisionError::InvalidAttributes(_))));
        assert_eq!(f.outbox.len().unwrap(), 1);
    }

    #[test]
    fn test_stranger_unauthorized() {
        let f = fixture();
        let (root, _) = f.revisions.create_node(f.user, space(f.user)).unwrap();
        let stranger = Uuid::new_v4();

        let result = f.revisions.create_node(stranger, page(root.id, "Intrusion"));
        assert!(matches!(result, Err(RevisionError::Unauthorized(_))));
        assert_eq!(result.unwrap_err().status(), MutationStatus::Unauthorized);
    }

    #[test]
    fn test_update_bumps_local_revision() {
        let f = fixture();
        let (root, _) = f.revisions.create_node(f.user, space(f.user)).unwrap();
        let (child, _) = f.revisions.create_node(f.user, page(root.id, "Draft")).unwrap();

        let outcome = f
            .revisions
            .update_node(f.user, child.id, |mut attributes| {
                if let NodeAttributes::Page(page) = &mut attributes {
                    page.name = "Final".into();
                }
                attributes
            })
            .unwrap();

        let UpdateOutcome::Updated { node, attempts, .. } = outcome else {
            panic!("expected update");
        };
        assert_eq!(attempts, 1);
        assert_eq!(node.local_revision, 1);
        assert_eq!(node.name().as_deref(), Some("Final"));
        assert_eq!(f.revisions.get_node(child.id).unwrap().unwrap(), node);
    }

    #[test]
    fn test_unchanged_update_writes_nothing() {
        let f = fixture();
        let (root, _) = f.revisions.create_node(f.user, space(f.user)).unwrap();
        let before = f.outbox.len().unwrap();

        let outcome = f.revisions.update_node(f.user, root.id, |a| a).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Unchanged(_)));
        assert_eq!(f.outbox.len().unwrap(), before);
    }

    #[test]
    fn test_update_missing_node() {
        let f = fixture();
        let result = f.revisions.update_node(f.user, Uuid::new_v4(), |a| a);
        assert!(matches!(result, Err(RevisionError::NotFound(_))));
    }

    #[test]
    fn test_delete_removes_subtree() {
        let f = fixture();
        let (root, _) = f.revisions.create_node(f.user, space(f.user)).unwrap();
        let folder = NodeAttributes::Folder(FolderAttributes {
            parent_id: root.id,
            name: "Docs".into(),
            collaborators: Collaborators::new(),
        });
        let (folder, _) = f.revisions.create_node(f.user, folder).unwrap();
        let (leaf, _) = f.revisions.create_node(f.user, page(folder.id, "Leaf")).unwrap();

        let removed = f.revisions.delete_node(f.user, folder.id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(f.revisions.get_node(leaf.id).unwrap().is_none());
        assert!(f.revisions.fragments().load(leaf.id).unwrap().is_empty());
        assert_eq!(f.revisions.children_of(root.id).unwrap().len(), 0);
    }

    #[test]
    fn test_compaction_preserves_state() {
        let f = fixture();
        let (root, _) = f.revisions.create_node(f.user, space(f.user)).unwrap();
        for i in 0..12 {
            f.revisions
                .update_node(f.user, root.id, |mut attributes| {
                    if let NodeAttributes::Space(space) = &mut attributes {
                        space.description = Some(format!("rev {i}"));
                    }
                    attributes
                })
                .unwrap();
        }

        assert!(f.revisions.fragments().count(root.id).unwrap() <= 8);
        let document = f.revisions.load_document(root.id).unwrap();
        let attributes = NodeAttributes::from_value(document.materialize()).unwrap();
        assert_eq!(attributes, f.revisions.get_node(root.id).unwrap().unwrap().attributes);
    }

    #[test]
    fn test_mark_synced_is_monotonic() {
        let f = fixture();
        let (root, _) = f.revisions.create_node(f.user, space(f.user)).unwrap();

        f.revisions.mark_synced(root.id, 7).unwrap();
        f.revisions.mark_synced(root.id, 3).unwrap();
        assert_eq!(f.revisions.get_node(root.id).unwrap().unwrap().server_revision, 7);
    }
}
