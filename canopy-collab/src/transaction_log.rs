//! Server-side transaction log.
//!
//! Accepts pushed mutations, re-checks them against the server's own
//! closure index and role grants, assigns each accepted change the next
//! workspace version and appends it under `transactions` (`root ++ version`).
//! Version assignment and every row it implies share one unit of work, so a
//! version is never visible without its node state. Committed changes are
//! published on the [`EventBus`] for live sessions.

use canopy_core::{now_millis, AccessPolicy, CrdtDocument, Node, NodeAttributes, NodeId, UserId, YrsDocument};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::broker::EventBus;
use crate::collaboration::Collaboration;
use crate::outbox::{FragmentData, MutationPayload, OutboxMutation};
use crate::protocol::{
    MutationResult, MutationStatus, ServerTransaction, SyncInput, SyncItems, SyncPage, TransactionOperation,
};
use crate::revision::{RevisionConfig, RevisionError, RevisionStore};
use crate::storage::rocks::{decode, CF_NODES, CF_TRANSACTIONS, CF_TRANSACTION_IDS};
use crate::storage::{keys, ReplicaStore, StoreError, UnitOfWork, UpdateFragment};

const VERSION_SEQUENCE: &str = "version";

/// A committed change, as seen by live sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    TransactionAppended(ServerTransaction),
    CollaborationChanged(Collaboration),
}

struct Accepted {
    /// Reported back to the pushing device
    transaction: Option<ServerTransaction>,
    /// Every transaction this mutation appended, in version order
    appended: Vec<ServerTransaction>,
    collaborations: Vec<Collaboration>,
    replayed: bool,
}

impl Accepted {
    fn single(transaction: ServerTransaction, collaborations: Vec<Collaboration>) -> Self {
        Self {
            transaction: Some(transaction.clone()),
            appended: vec![transaction],
            collaborations,
            replayed: false,
        }
    }
}

pub struct TransactionLog {
    revisions: RevisionStore,
    events: Arc<EventBus>,
}

impl TransactionLog {
    pub fn new(
        store: Arc<ReplicaStore>,
        policy: Arc<dyn AccessPolicy>,
        events: Arc<EventBus>,
        config: RevisionConfig,
    ) -> Self {
        Self {
            revisions: RevisionStore::new(store, policy, config),
            events,
        }
    }

    pub fn revisions(&self) -> &RevisionStore {
        &self.revisions
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn store(&self) -> &ReplicaStore {
        self.revisions.store()
    }

    /// Highest version assigned so far.
    pub fn current_version(&self) -> Result<u64, StoreError> {
        self.store().counter(VERSION_SEQUENCE)
    }

    pub fn node(&self, node_id: NodeId) -> Result<Option<Node>, StoreError> {
        self.store().get_json(CF_NODES, &keys::id(node_id))
    }

    /// Accept a pushed batch in order, one result per mutation.
    pub fn accept(&self, actor: UserId, mutations: &[OutboxMutation]) -> Vec<MutationResult> {
        mutations
            .iter()
            .map(|mutation| match self.accept_one(actor, mutation) {
                Ok(transaction) => MutationResult {
                    id: mutation.id,
                    status: MutationStatus::Success,
                    version: transaction.map(|t| t.version),
                },
                Err(e) => {
                    match &e {
                        RevisionError::Unauthorized(_) => {}
                        RevisionError::Store(_) | RevisionError::Unreadable { .. } => {
                            log::error!("Mutation #{} from {actor} failed: {e}", mutation.id)
                        }
                        _ => log::debug!("Mutation #{} from {actor} rejected: {e}", mutation.id),
                    }
                    MutationResult {
                        id: mutation.id,
                        status: e.status(),
                        version: None,
                    }
                }
            })
            .collect()
    }

    /// Accept one mutation. `Ok(None)` means there was nothing left to do
    /// (a delete of a node that is already gone).
    pub fn accept_one(&self, actor: UserId, mutation: &OutboxMutation) -> Result<Option<ServerTransaction>, RevisionError> {
        let accepted = match &mutation.payload {
            MutationPayload::CreateNode { node_id, fragment, .. } => {
                self.accept_create(actor, *node_id, fragment, mutation.created_at)?
            }
            MutationPayload::UpdateNode { node_id, fragments, .. } => {
                self.accept_update(actor, *node_id, fragments, mutation.created_at)?
            }
            MutationPayload::DeleteNode { node_id, .. } => self.accept_delete(actor, *node_id, mutation.created_at)?,
        };

        if !accepted.replayed {
            for transaction in accepted.appended {
                log::debug!(
                    "Appended {:?} of {} to {} at version {}",
                    transaction.operation,
                    transaction.node_id,
                    transaction.root_id,
                    transaction.version
                );
                self.events.publish(LogEvent::TransactionAppended(transaction));
            }
            for collaboration in accepted.collaborations {
                self.events.publish(LogEvent::CollaborationChanged(collaboration));
            }
        }
        Ok(accepted.transaction)
    }

    /// Transaction previously appended under `id`, for retried pushes.
    fn appended(&self, id: Uuid) -> Result<Option<ServerTransaction>, StoreError> {
        let Some(location) = self.store().get_raw(CF_TRANSACTION_IDS, &keys::id(id))? else {
            return Ok(None);
        };
        self.store().get(CF_TRANSACTIONS, &location)
    }

    fn append(&self, uow: &mut UnitOfWork<'_>, transaction: &ServerTransaction) -> Result<(), StoreError> {
        let location = keys::sequenced(transaction.root_id, transaction.version);
        uow.put(CF_TRANSACTIONS, &location, transaction)?;
        uow.put_raw(CF_TRANSACTION_IDS, &keys::id(transaction.id), &location)
    }

    fn replayed(transaction: ServerTransaction) -> Accepted {
        Accepted {
            transaction: Some(transaction),
            appended: Vec::new(),
            collaborations: Vec::new(),
            replayed: true,
        }
    }

    fn accept_create(
        &self,
        actor: UserId,
        node_id: NodeId,
        fragment: &FragmentData,
        created_at: u64,
    ) -> Result<Accepted, RevisionError> {
        let mut document = YrsDocument::new();
        document
            .apply_update(&fragment.data)
            .map_err(|e| RevisionError::InvalidAttributes(e.to_string()))?;
        let attributes = NodeAttributes::from_value(document.materialize())?;
        attributes.validate()?;

        self.store().write(|uow| {
            if let Some(transaction) = self.appended(fragment.id)? {
                return Ok(Self::replayed(transaction));
            }
            if uow.store().contains(CF_NODES, &keys::id(node_id))? {
                return Err(RevisionError::InvalidAttributes(format!("node {node_id} already exists")));
            }
            let parent = self.revisions.resolve_parent(attributes.node_type(), attributes.parent_id())?;
            self.revisions.authorize_create(actor, parent.as_ref(), &attributes)?;

            let version = uow.next_sequence(VERSION_SEQUENCE)?;
            let server_created_at = now_millis();
            let root_id = parent.as_ref().map(|p| p.root_id).unwrap_or(node_id);
            let node = Node {
                id: node_id,
                node_type: attributes.node_type(),
                parent_id: attributes.parent_id(),
                root_id,
                attributes,
                created_at,
                created_by: actor,
                updated_at: None,
                updated_by: None,
                local_revision: 0,
                server_revision: version,
            };
            let stored = UpdateFragment {
                id: fragment.id,
                node_id,
                data: fragment.data.clone(),
                created_at,
                created_by: actor,
            };
            let staged = self.revisions.stage_new(uow, &node, &stored, version)?;

            let transaction = ServerTransaction {
                id: fragment.id,
                operation: TransactionOperation::Create,
                node_id,
                root_id,
                data: Some(fragment.data.clone()),
                created_at,
                created_by: actor,
                server_created_at,
                version,
            };
            self.append(uow, &transaction)?;
            Ok(Accepted::single(transaction, staged.collaborations))
        })
    }

    fn accept_update(
        &self,
        actor: UserId,
        node_id: NodeId,
        fragments: &[FragmentData],
        created_at: u64,
    ) -> Result<Accepted, RevisionError> {
        let last = fragments
            .last()
            .ok_or_else(|| RevisionError::InvalidAttributes("update carries no fragments".into()))?;

        self.store().write(|uow| {
            if let Some(transaction) = self.appended(last.id)? {
                return Ok(Self::replayed(transaction));
            }
            let current: Node = uow
                .store()
                .get_json(CF_NODES, &keys::id(node_id))?
                .ok_or(RevisionError::NotFound(node_id))?;

            let mut document = self.revisions.load_document(node_id)?;
            let prior = document.state_vector();
            for fragment in fragments {
                document
                    .apply_update(&fragment.data)
                    .map_err(|e| RevisionError::InvalidAttributes(e.to_string()))?;
            }
            let delta = document.diff_since(&prior)?;
            let attributes = NodeAttributes::from_value(document.materialize())?;
            attributes.validate()?;
            if attributes.node_type() != current.node_type {
                return Err(RevisionError::InvalidAttributes(format!(
                    "{} cannot become {}",
                    current.node_type,
                    attributes.node_type()
                )));
            }
            self.revisions.authorize_update(actor, &current, &attributes)?;

            let mut root_id = current.root_id;
            if attributes.parent_id() != current.parent_id {
                let parent = self.revisions.resolve_parent(current.node_type, attributes.parent_id())?;
                self.revisions.authorize_create(actor, parent.as_ref(), &attributes)?;
                root_id = parent.map(|p| p.root_id).unwrap_or(node_id);
            }

            let server_created_at = now_millis();
            let moved_from = (root_id != current.root_id).then_some(current.root_id);
            let mut appended = Vec::new();
            if let Some(old_root) = moved_from {
                appended.push(ServerTransaction {
                    id: Uuid::new_v4(),
                    operation: TransactionOperation::Delete,
                    node_id,
                    root_id: old_root,
                    data: None,
                    created_at,
                    created_by: actor,
                    server_created_at,
                    version: uow.next_sequence(VERSION_SEQUENCE)?,
                });
            }

            let version = uow.next_sequence(VERSION_SEQUENCE)?;
            let node = Node {
                parent_id: attributes.parent_id(),
                root_id,
                attributes,
                updated_at: Some(created_at),
                updated_by: Some(actor),
                local_revision: current.local_revision + 1,
                server_revision: version,
                ..current.clone()
            };
            let stored = UpdateFragment {
                id: last.id,
                node_id,
                data: delta.clone(),
                created_at,
                created_by: actor,
            };
            let subtree = match moved_from {
                Some(_) => self.revisions.closure().descendant_paths(node_id)?,
                None => Vec::new(),
            };
            let staged = self.revisions.stage_change(uow, &current, &node, &stored, version)?;

            // Followers of the new root may have never seen this subtree, so
            // it enters that root as full-state creates, parents first.
            let transaction = match moved_from {
                None => ServerTransaction {
                    id: last.id,
                    operation: TransactionOperation::Update,
                    node_id,
                    root_id,
                    data: Some(delta),
                    created_at,
                    created_by: actor,
                    server_created_at,
                    version,
                },
                Some(_) => ServerTransaction {
                    id: last.id,
                    operation: TransactionOperation::Create,
                    node_id,
                    root_id,
                    data: Some(document.encode_state()),
                    created_at: current.created_at,
                    created_by: current.created_by,
                    server_created_at,
                    version,
                },
            };
            appended.push(transaction.clone());

            for path in subtree.iter().filter(|p| p.depth > 0) {
                let Some(descendant) = self.revisions.get_node(path.descendant_id)? else {
                    continue;
                };
                let state = self.revisions.load_document(descendant.id)?.encode_state();
                appended.push(ServerTransaction {
                    id: Uuid::new_v4(),
                    operation: TransactionOperation::Create,
                    node_id: descendant.id,
                    root_id,
                    data: Some(state),
                    created_at: descendant.created_at,
                    created_by: descendant.created_by,
                    server_created_at,
                    version: uow.next_sequence(VERSION_SEQUENCE)?,
                });
            }
            if moved_from.is_some() {
                log::info!(
                    "Moved {node_id} with {} descendants from {} to {root_id}",
                    appended.len() - 2,
                    current.root_id
                );
            }

            for appended_tx in &appended {
                self.append(uow, appended_tx)?;
            }
            Ok(Accepted {
                transaction: Some(transaction),
                appended,
                collaborations: staged.collaborations,
                replayed: false,
            })
        })
    }

    fn accept_delete(&self, actor: UserId, node_id: NodeId, created_at: u64) -> Result<Accepted, RevisionError> {
        self.store().write(|uow| {
            let Some(node) = uow.store().get_json::<Node>(CF_NODES, &keys::id(node_id))? else {
                return Ok(Accepted {
                    transaction: None,
                    appended: Vec::new(),
                    collaborations: Vec::new(),
                    replayed: true,
                });
            };
            self.revisions.authorize_delete(actor, &node)?;

            let version = uow.next_sequence(VERSION_SEQUENCE)?;
            let (_, revoked) = self.revisions.stage_delete(uow, &node, version)?;
            let transaction = ServerTransaction {
                id: Uuid::new_v4(),
                operation: TransactionOperation::Delete,
                node_id,
                root_id: node.root_id,
                data: None,
                created_at,
                created_by: actor,
                server_created_at: now_millis(),
                version,
            };
            self.append(uow, &transaction)?;
            Ok(Accepted::single(transaction, revoked))
        })
    }

    /// Transactions of `root_id` with a version above `cursor`.
    pub fn transactions_since(
        &self,
        root_id: NodeId,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<ServerTransaction>, StoreError> {
        let start = keys::sequenced(root_id, cursor.saturating_add(1));
        self.store()
            .scan_from(CF_TRANSACTIONS, &start, root_id.as_bytes(), limit)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    /// Next page of `input` for `user_id`, starting after `cursor`.
    pub fn page(&self, user_id: UserId, input: SyncInput, cursor: u64, limit: usize) -> Result<SyncPage, StoreError> {
        let items = match input {
            SyncInput::Transactions { root_id } => SyncItems::Transactions(self.transactions_since(root_id, cursor, limit)?),
            SyncInput::Collaborations => {
                SyncItems::Collaborations(self.revisions.collaborations().changes_since(user_id, cursor, limit)?)
            }
        };
        Ok(SyncPage {
            input,
            from_cursor: cursor,
            items,
        })
    }

    /// Roots `user_id` can currently read.
    pub fn roots_for(&self, user_id: UserId) -> Result<BTreeSet<NodeId>, StoreError> {
        self.revisions.collaborations().roots_for(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::MutationType;
    use crate::storage::StoreConfig;
    use canopy_core::{Collaborators, ModelPolicy, NodeRole, PageAttributes, SpaceAttributes};
    use tempfile::tempdir;

    fn open_log(dir: &tempfile::TempDir) -> TransactionLog {
        let store = Arc::new(ReplicaStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        TransactionLog::new(store, Arc::new(ModelPolicy), Arc::new(EventBus::new(64)), RevisionConfig::for_testing())
    }

    fn create(id: u64, node_id: NodeId, attributes: &NodeAttributes) -> OutboxMutation {
        let mut document = YrsDocument::new();
        let data = document.write(&attributes.to_value().unwrap()).unwrap();
        OutboxMutation {
            id,
            mutation_type: MutationType::CreateNode,
            target_id: node_id,
            payload: MutationPayload::CreateNode {
                node_id,
                root_id: node_id,
                fragment: FragmentData { id: Uuid::new_v4(), data },
            },
            created_at: 0,
            retry_count: 0,
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

    fn page(parent_id: NodeId) -> NodeAttributes {
        NodeAttributes::Page(PageAttributes {
            parent_id,
            name: "Plan".into(),
            content: None,
            collaborators: Collaborators::new(),
        })
    }

    #[test]
    fn test_versions_strictly_increase() {
        let dir = tempdir().unwrap();
        let log = open_log(&dir);
        let admin = Uuid::new_v4();
        let root = Uuid::new_v4();

        let mut mutations = vec![create(1, root, &space(admin))];
        for i in 0..3 {
            mutations.push(create(2 + i, Uuid::new_v4(), &page(root)));
        }
        let results = log.accept(admin, &mutations);

        let versions: Vec<u64> = results.iter().map(|r| r.version.unwrap()).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
        assert_eq!(log.current_version().unwrap(), 4);
        assert_eq!(log.transactions_since(root, 2, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_client_time_stamps_node_and_transaction() {
        let dir = tempdir().unwrap();
        let log = open_log(&dir);
        let admin = Uuid::new_v4();
        let root = Uuid::new_v4();
        let written_at = 1_700_000_000_000;
        let mutation = OutboxMutation {
            created_at: written_at,
            ..create(1, root, &space(admin))
        };
        log.accept(admin, &[mutation]);

        let node = log.node(root).unwrap().unwrap();
        let transaction = &log.transactions_since(root, 0, 10).unwrap()[0];
        assert_eq!(node.created_at, written_at);
        assert_eq!(transaction.created_at, node.created_at);
        assert!(transaction.server_created_at > written_at);
    }

    #[test]
    fn test_retried_push_is_not_appended_twice() {
        let dir = tempdir().unwrap();
        let log = open_log(&dir);
        let admin = Uuid::new_v4();
        let mutation = create(1, Uuid::new_v4(), &space(admin));

        let first = log.accept(admin, std::slice::from_ref(&mutation));
        let second = log.accept(admin, std::slice::from_ref(&mutation));
        assert_eq!(first, second);
        assert_eq!(log.current_version().unwrap(), 1);
    }

    #[test]
    fn test_stranger_rejected_without_version() {
        let dir = tempdir().unwrap();
        let log = open_log(&dir);
        let admin = Uuid::new_v4();
        let root = Uuid::new_v4();
        log.accept(admin, &[create(1, root, &space(admin))]);

        let results = log.accept(Uuid::new_v4(), &[create(2, Uuid::new_v4(), &page(root))]);
        assert_eq!(results[0].status, MutationStatus::Unauthorized);
        assert_eq!(log.current_version().unwrap(), 1);
    }

    #[test]
    fn test_collaboration_stream_follows_grants() {
        let dir = tempdir().unwrap();
        let log = open_log(&dir);
        let admin = Uuid::new_v4();
        let root = Uuid::new_v4();
        log.accept(admin, &[create(1, root, &space(admin))]);

        assert_eq!(log.roots_for(admin).unwrap().into_iter().collect::<Vec<_>>(), vec![root]);
        let page = log.page(admin, SyncInput::Collaborations, 0, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page.next_cursor(), 1);
    }

    #[test]
    fn test_delete_of_missing_node_succeeds_without_version() {
        let dir = tempdir().unwrap();
        let log = open_log(&dir);
        let node = Uuid::new_v4();
        let mutation = OutboxMutation {
            id: 1,
            mutation_type: MutationType::DeleteNode,
            target_id: node,
            payload: MutationPayload::DeleteNode { node_id: node, root_id: node },
            created_at: 0,
            retry_count: 0,
        };

        let results = log.accept(Uuid::new_v4(), &[mutation]);
        assert_eq!(results[0].status, MutationStatus::Success);
        assert_eq!(results[0].version, None);
    }
}
