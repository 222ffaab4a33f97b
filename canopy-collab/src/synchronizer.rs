//! Client-side replication loop.
//!
//! For every collection (the user's collaborations and the transactions of
//! each readable root) the synchronizer keeps a persisted cursor. Pages are
//! applied strictly in cursor order: a page that starts past the local
//! cursor is buffered until the gap is filled, and the cursor only moves
//! after an item is applied. A full page is followed by another pull; a
//! short one by a one-shot subscription, renewed every time it fires.
//!
//! Local mutations are pushed one batch at a time: compact, drain, send,
//! then acknowledge or retry according to the per-mutation results.

use canopy_core::{NodeId, UserId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::broker::{Session, SessionError};
use crate::client::{ClientEvent, SyncClient};
use crate::transaction_log::TransactionLog;
use crate::outbox::{MutationOutbox, OutboxMutation};
use crate::protocol::{ClientMessage, MutationResult, ProtocolError, ServerMessage, SyncInput, SyncItems, SyncPage};
use crate::revision::{RevisionError, RevisionStore};
use crate::storage::rocks::CF_CURSORS;
use crate::storage::{ReplicaStore, StoreError, UnitOfWork};

const MIN_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 1000;

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Items requested per pull, bounded to 20..=1000 (default: 50)
    pub page_size: usize,
    /// Interval between outbox pushes (default: 1000ms)
    pub push_interval_ms: u64,
    /// Delay before reconnecting after a lost connection (default: 5000ms)
    pub reconnect_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            push_interval_ms: 1000,
            reconnect_interval_ms: 5000,
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            page_size: MIN_PAGE_SIZE,
            push_interval_ms: 50,
            reconnect_interval_ms: 100,
        }
    }

    fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms.max(1))
    }

    fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Revision(#[from] RevisionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("the replica has no outbox")]
    NoOutbox,
}

/// Persisted per-collection cursors.
pub struct CursorStore<'a> {
    store: &'a ReplicaStore,
}

impl<'a> CursorStore<'a> {
    pub fn new(store: &'a ReplicaStore) -> Self {
        Self { store }
    }

    pub fn get(&self, input: SyncInput) -> Result<u64, StoreError> {
        Ok(self.store.get(CF_CURSORS, input.key().as_bytes())?.unwrap_or(0))
    }

    /// Move the cursor forward; a lower value is ignored. Returns the cursor.
    pub fn advance(&self, input: SyncInput, cursor: u64) -> Result<u64, StoreError> {
        self.store.write(|uow| self.advance_in(uow, input, cursor))
    }

    pub fn advance_in(&self, uow: &mut UnitOfWork<'_>, input: SyncInput, cursor: u64) -> Result<u64, StoreError> {
        let current = self.get(input)?;
        if cursor <= current {
            return Ok(current);
        }
        uow.put(CF_CURSORS, input.key().as_bytes(), &cursor)?;
        Ok(cursor)
    }
}

/// What became of a received page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Applied, together with any buffered pages it made contiguous
    Applied { applied: usize, cursor: u64, more: bool },
    /// Starts past the local cursor; held until the gap is filled
    Buffered,
    /// Entirely at or below the local cursor
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub accepted: usize,
    pub rejected: usize,
    /// Nodes whose mutation was dropped after the retry ceiling
    pub evicted: Vec<NodeId>,
}

impl PushOutcome {
    fn absorb(&mut self, other: PushOutcome) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.evicted.extend(other.evicted);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootChanges {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpStats {
    pub pages: usize,
    pub applied: usize,
}

/// A drained outbox batch awaiting its results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushBatch {
    pub batch_id: u64,
    pub mutations: Vec<OutboxMutation>,
}

impl PushBatch {
    pub fn into_message(self) -> ClientMessage {
        ClientMessage::PushMutations {
            batch_id: self.batch_id,
            mutations: self.mutations,
        }
    }
}

/// Events for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    PageApplied { input: SyncInput, applied: usize, cursor: u64 },
    Pushed(PushOutcome),
    RootAdded(NodeId),
    RootRemoved(NodeId),
    ServerError(String),
}

/// Request/response access to a transaction log, for syncing without a
/// socket.
pub trait SyncSource {
    fn page(&mut self, input: SyncInput, cursor: u64, limit: usize) -> Result<SyncPage, SyncError>;
    fn push(&mut self, mutations: &[OutboxMutation]) -> Result<Vec<MutationResult>, SyncError>;
}

/// In-process [`SyncSource`] over a server session.
pub struct DirectSource<'a> {
    log: &'a TransactionLog,
    session: Session,
}

impl<'a> DirectSource<'a> {
    pub fn open(log: &'a TransactionLog, user_id: UserId, device_id: Uuid) -> Result<Self, SyncError> {
        Ok(Self {
            log,
            session: Session::open(log, user_id, device_id, MAX_PAGE_SIZE)?,
        })
    }
}

impl SyncSource for DirectSource<'_> {
    fn page(&mut self, input: SyncInput, cursor: u64, limit: usize) -> Result<SyncPage, SyncError> {
        Ok(self.session.pull(self.log, input, cursor, limit)?)
    }

    fn push(&mut self, mutations: &[OutboxMutation]) -> Result<Vec<MutationResult>, SyncError> {
        Ok(self.log.accept(self.session.user_id, mutations))
    }
}

struct InFlight {
    batch_id: u64,
    /// `(mutation id, target node)`
    mutations: Vec<(u64, NodeId)>,
}

pub struct Synchronizer {
    user_id: UserId,
    device_id: Uuid,
    revisions: Arc<RevisionStore>,
    outbox: Arc<MutationOutbox>,
    config: SyncConfig,
    roots: BTreeSet<NodeId>,
    buffered: HashMap<SyncInput, BTreeMap<u64, SyncPage>>,
    in_flight: Option<InFlight>,
    next_request_id: u64,
    next_batch_id: u64,
}

impl Synchronizer {
    /// `revisions` must carry the outbox its local writes are queued in.
    pub fn new(
        user_id: UserId,
        device_id: Uuid,
        revisions: Arc<RevisionStore>,
        mut config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let outbox = revisions.outbox().cloned().ok_or(SyncError::NoOutbox)?;
        config.page_size = config.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
        let roots = revisions.collaborations().roots_for(user_id)?;
        Ok(Self {
            user_id,
            device_id,
            revisions,
            outbox,
            config,
            roots,
            buffered: HashMap::new(),
            in_flight: None,
            next_request_id: 0,
            next_batch_id: 0,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn roots(&self) -> &BTreeSet<NodeId> {
        &self.roots
    }

    pub fn cursors(&self) -> CursorStore<'_> {
        CursorStore::new(self.revisions.store())
    }

    pub fn cursor(&self, input: SyncInput) -> Result<u64, SyncError> {
        Ok(self.cursors().get(input)?)
    }

    /// Every collection this replica follows, collaborations first.
    pub fn inputs(&self) -> Vec<SyncInput> {
        std::iter::once(SyncInput::Collaborations)
            .chain(self.roots.iter().map(|&root_id| SyncInput::Transactions { root_id }))
            .collect()
    }

    pub fn buffered_pages(&self, input: SyncInput) -> usize {
        self.buffered.get(&input).map_or(0, BTreeMap::len)
    }

    pub fn apply_page(&mut self, page: SyncPage) -> Result<PageOutcome, SyncError> {
        let input = page.input;
        let cursor = self.cursor(input)?;
        if page.from_cursor > cursor {
            log::debug!(
                "Buffering {} page from {} (local cursor {cursor})",
                input.key(),
                page.from_cursor
            );
            self.buffered.entry(input).or_default().insert(page.from_cursor, page);
            return Ok(PageOutcome::Buffered);
        }
        if page.from_cursor < cursor && page.next_cursor() <= cursor {
            return Ok(PageOutcome::Stale);
        }

        let mut more = page.len() >= self.config.page_size;
        let (mut applied, mut cursor) = self.apply_items(&page)?;

        while let Some(pages) = self.buffered.get_mut(&input) {
            let Some(from) = pages.keys().next().copied() else {
                self.buffered.remove(&input);
                break;
            };
            if from > cursor {
                break;
            }
            let Some(next) = pages.remove(&from) else {
                break;
            };
            if next.next_cursor() <= cursor {
                continue;
            }
            more = next.len() >= self.config.page_size;
            let (count, advanced) = self.apply_items(&next)?;
            applied += count;
            cursor = advanced;
        }
        if self.buffered.get(&input).is_some_and(BTreeMap::is_empty) {
            self.buffered.remove(&input);
        }

        Ok(PageOutcome::Applied { applied, cursor, more })
    }

    fn apply_items(&self, page: &SyncPage) -> Result<(usize, u64), SyncError> {
        let cursors = self.cursors();
        let mut cursor = cursors.get(page.input)?;
        let mut applied = 0;

        match &page.items {
            SyncItems::Transactions(transactions) => {
                for transaction in transactions {
                    if transaction.version <= cursor {
                        continue;
                    }
                    // The cursor stays before a transaction that failed to apply.
                    let outcome = self.revisions.apply_remote_transaction(transaction).map_err(|e| {
                        log::warn!(
                            "Stopping {} at v{}: v{} for {} failed: {e}",
                            page.input.key(),
                            cursor,
                            transaction.version,
                            transaction.node_id
                        );
                        e
                    })?;
                    log::trace!("Applied v{}: {outcome:?}", transaction.version);
                    applied += 1;
                    cursor = cursors.advance(page.input, transaction.version)?;
                }
            }
            SyncItems::Collaborations(collaborations) => {
                let grants = self.revisions.collaborations();
                for collaboration in collaborations {
                    if collaboration.version <= cursor {
                        continue;
                    }
                    cursor = self.revisions.store().write(|uow| {
                        grants.put(uow, collaboration)?;
                        cursors.advance_in(uow, page.input, collaboration.version)
                    })?;
                    applied += 1;
                }
            }
        }
        Ok((applied, cursor))
    }

    /// Recompute readable roots from the applied collaborations.
    pub fn refresh_roots(&mut self) -> Result<RootChanges, SyncError> {
        let roots = self.revisions.collaborations().roots_for(self.user_id)?;
        let changes = RootChanges {
            added: roots.difference(&self.roots).copied().collect(),
            removed: self.roots.difference(&roots).copied().collect(),
        };
        for root_id in &changes.removed {
            self.buffered.remove(&SyncInput::Transactions { root_id: *root_id });
        }
        self.roots = roots;
        Ok(changes)
    }

    /// Pull when more data is expected, otherwise subscribe.
    pub fn request(&mut self, input: SyncInput, more: bool) -> Result<ClientMessage, SyncError> {
        let cursor = self.cursor(input)?;
        if more {
            self.next_request_id += 1;
            Ok(ClientMessage::Pull {
                request_id: self.next_request_id,
                input,
                cursor,
                limit: self.config.page_size as u32,
            })
        } else {
            Ok(ClientMessage::Subscribe {
                subscription_id: input.key(),
                input,
                cursor,
            })
        }
    }

    /// Compact and drain the outbox, unless a batch is already in flight.
    pub fn prepare_push(&mut self) -> Result<Option<PushBatch>, SyncError> {
        if self.in_flight.is_some() {
            return Ok(None);
        }
        self.outbox.compact()?;
        let mutations = self.outbox.drain(self.outbox.config().batch_size)?;
        if mutations.is_empty() {
            return Ok(None);
        }
        self.next_batch_id += 1;
        self.in_flight = Some(InFlight {
            batch_id: self.next_batch_id,
            mutations: mutations.iter().map(|m| (m.id, m.target_id)).collect(),
        });
        log::debug!("Pushing batch {} ({} mutations)", self.next_batch_id, mutations.len());
        Ok(Some(PushBatch {
            batch_id: self.next_batch_id,
            mutations,
        }))
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Settle the in-flight batch. Results for any other batch are ignored.
    pub fn handle_results(&mut self, batch_id: u64, results: &[MutationResult]) -> Result<Option<PushOutcome>, SyncError> {
        match &self.in_flight {
            Some(in_flight) if in_flight.batch_id == batch_id => {}
            _ => {
                log::warn!("Ignoring results for unknown batch {batch_id}");
                return Ok(None);
            }
        }
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(None);
        };

        let by_id: HashMap<u64, &MutationResult> = results.iter().map(|r| (r.id, r)).collect();
        let mut acknowledged = Vec::new();
        let mut synced = Vec::new();
        let mut failed = Vec::new();
        for (id, target) in in_flight.mutations {
            match by_id.get(&id) {
                Some(result) if result.status.is_success() => {
                    acknowledged.push(id);
                    if let Some(version) = result.version {
                        synced.push((target, version));
                    }
                }
                Some(result) => {
                    log::warn!("Mutation #{id} for {target} rejected: {:?}", result.status);
                    failed.push(id);
                }
                None => failed.push(id),
            }
        }

        self.outbox.acknowledge(&acknowledged)?;
        for (node_id, version) in synced {
            self.revisions.mark_synced(node_id, version)?;
        }
        let evicted = self.outbox.fail_and_retry(&failed)?;

        Ok(Some(PushOutcome {
            accepted: acknowledged.len(),
            rejected: failed.len(),
            evicted: evicted.into_iter().map(|m| m.target_id).collect(),
        }))
    }

    /// Forget per-connection state. Cursors and the outbox are kept.
    pub fn reset(&mut self) {
        self.in_flight = None;
        self.buffered.clear();
    }

    /// Pull every collection until it is current.
    pub fn catch_up<S: SyncSource>(&mut self, source: &mut S) -> Result<CatchUpStats, SyncError> {
        let mut stats = CatchUpStats::default();
        self.pull_until_current(source, SyncInput::Collaborations, &mut stats)?;
        self.refresh_roots()?;
        for root_id in self.roots.clone() {
            self.pull_until_current(source, SyncInput::Transactions { root_id }, &mut stats)?;
        }
        Ok(stats)
    }

    fn pull_until_current<S: SyncSource>(
        &mut self,
        source: &mut S,
        input: SyncInput,
        stats: &mut CatchUpStats,
    ) -> Result<(), SyncError> {
        loop {
            let cursor = self.cursor(input)?;
            let page = source.page(input, cursor, self.config.page_size)?;
            stats.pages += 1;
            match self.apply_page(page)? {
                PageOutcome::Applied { applied, more, .. } => {
                    stats.applied += applied;
                    if !more {
                        return Ok(());
                    }
                }
                PageOutcome::Buffered | PageOutcome::Stale => return Ok(()),
            }
        }
    }

    /// Push batches until the outbox is empty.
    pub fn push_pending<S: SyncSource>(&mut self, source: &mut S) -> Result<PushOutcome, SyncError> {
        let mut total = PushOutcome::default();
        while let Some(batch) = self.prepare_push()? {
            let results = match source.push(&batch.mutations) {
                Ok(results) => results,
                Err(e) => {
                    self.in_flight = None;
                    return Err(e);
                }
            };
            if let Some(outcome) = self.handle_results(batch.batch_id, &results)? {
                total.absorb(outcome);
            }
        }
        Ok(total)
    }

    /// Replicate over a websocket until `shutdown` flips, reconnecting after
    /// every lost connection.
    pub async fn run(mut self, server_url: String, events: mpsc::Sender<SyncEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_connection(&server_url, &events, &mut shutdown).await {
                Ok(()) => break,
                Err(e) => log::warn!("Sync connection to {server_url} ended: {e}"),
            }
            self.reset();
            let _ = events.send(SyncEvent::Disconnected).await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval()) => {}
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Synchronizer for device {} stopped", self.device_id);
    }

    async fn run_connection(
        &mut self,
        server_url: &str,
        events: &mpsc::Sender<SyncEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let mut client = SyncClient::new(self.user_id, self.device_id, server_url);
        let mut incoming = client.take_event_rx().ok_or(ProtocolError::ConnectionClosed)?;
        client.connect().await?;
        let mut push_tick = tokio::time::interval(self.config.push_interval());

        loop {
            tokio::select! {
                event = incoming.recv() => match event {
                    Some(ClientEvent::Connected) => {
                        let _ = events.send(SyncEvent::Connected).await;
                    }
                    Some(ClientEvent::Message(message)) => self.on_message(&client, events, message).await?,
                    Some(ClientEvent::Disconnected) | None => return Err(ProtocolError::ConnectionClosed.into()),
                },

                _ = push_tick.tick() => {
                    if let Some(batch) = self.prepare_push()? {
                        client.send(&batch.into_message()).await?;
                    }
                }

                _ = shutdown.changed() => {
                    client.disconnect().await;
                    return Ok(());
                }
            }
        }
    }

    async fn on_message(
        &mut self,
        client: &SyncClient,
        events: &mpsc::Sender<SyncEvent>,
        message: ServerMessage,
    ) -> Result<(), SyncError> {
        match message {
            ServerMessage::Initialized { .. } => {
                for input in self.inputs() {
                    client.send(&self.request(input, true)?).await?;
                }
            }
            ServerMessage::Page { page, .. } => {
                let input = page.input;
                match self.apply_page(page)? {
                    PageOutcome::Applied { applied, cursor, more } => {
                        if applied > 0 {
                            let _ = events.send(SyncEvent::PageApplied { input, applied, cursor }).await;
                        }
                        client.send(&self.request(input, more)?).await?;
                        if input == SyncInput::Collaborations {
                            self.follow_roots(client, events).await?;
                        }
                    }
                    PageOutcome::Buffered => client.send(&self.request(input, true)?).await?,
                    PageOutcome::Stale => client.send(&self.request(input, false)?).await?,
                }
            }
            ServerMessage::MutationResults { batch_id, results } => {
                if let Some(outcome) = self.handle_results(batch_id, &results)? {
                    let clean = outcome.rejected == 0;
                    let _ = events.send(SyncEvent::Pushed(outcome)).await;
                    if clean {
                        if let Some(batch) = self.prepare_push()? {
                            client.send(&batch.into_message()).await?;
                        }
                    }
                }
            }
            ServerMessage::Error { message } => {
                log::warn!("Server error: {message}");
                let _ = events.send(SyncEvent::ServerError(message)).await;
            }
            ServerMessage::Pong => {}
        }
        Ok(())
    }

    async fn follow_roots(&mut self, client: &SyncClient, events: &mpsc::Sender<SyncEvent>) -> Result<(), SyncError> {
        let changes = self.refresh_roots()?;
        for root_id in changes.added {
            log::info!("Following root {root_id}");
            let _ = events.send(SyncEvent::RootAdded(root_id)).await;
            client.send(&self.request(SyncInput::Transactions { root_id }, true)?).await?;
        }
        for root_id in changes.removed {
            log::info!("Lost access to root {root_id}");
            let _ = events.send(SyncEvent::RootRemoved(root_id)).await;
            let subscription_id = SyncInput::Transactions { root_id }.key();
            client.send(&ClientMessage::Unsubscribe { subscription_id }).await?;
        }
        Ok(())
    }
}
