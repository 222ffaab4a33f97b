//! Fan-out of committed changes to connected sessions.
//!
//! The [`EventBus`] is one tokio broadcast channel shared by every
//! connection task. Each task owns a [`Session`] holding the device's
//! one-shot subscriptions and the cached set of roots its user can read;
//! when an event qualifies for a subscription the session builds the page
//! from the log and drops the subscription. Dropping the session at socket
//! teardown discards everything it held.

use canopy_core::{NodeId, UserId};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::transaction_log::{LogEvent, TransactionLog};
use crate::protocol::{SyncInput, SyncPage};
use crate::storage::StoreError;

/// Statistics for monitoring the event bus.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub events_published: u64,
    pub events_lagged: u64,
    pub active_sessions: usize,
}

struct AtomicBusStats {
    events_published: AtomicU64,
    events_lagged: AtomicU64,
}

pub struct EventBus {
    sender: broadcast::Sender<Arc<LogEvent>>,
    /// Connected devices and their users
    sessions: RwLock<HashMap<Uuid, UserId>>,
    capacity: usize,
    atomic_stats: AtomicBusStats,
}

impl EventBus {
    /// `capacity` events are buffered per receiver before a slow session lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBusStats {
                events_published: AtomicU64::new(0),
                events_lagged: AtomicU64::new(0),
            },
        }
    }

    /// Publish to every live receiver. Returns the receiver count.
    pub fn publish(&self, event: LogEvent) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.atomic_stats.events_published.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Register a connected device and return its event receiver.
    pub async fn register(&self, device_id: Uuid, user_id: UserId) -> broadcast::Receiver<Arc<LogEvent>> {
        let receiver = self.sender.subscribe();
        self.sessions.write().await.insert(device_id, user_id);
        receiver
    }

    pub async fn unregister(&self, device_id: &Uuid) -> Option<UserId> {
        self.sessions.write().await.remove(device_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats.events_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.atomic_stats.events_published.load(Ordering::Relaxed),
            events_lagged: self.atomic_stats.events_lagged.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("{user} cannot read {input}")]
    Unauthorized { user: UserId, input: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub input: SyncInput,
    pub cursor: u64,
}

/// Per-connection replication state.
pub struct Session {
    pub device_id: Uuid,
    pub user_id: UserId,
    root_ids: BTreeSet<NodeId>,
    subscriptions: HashMap<String, Subscription>,
    page_limit: usize,
}

impl Session {
    pub fn open(log: &TransactionLog, user_id: UserId, device_id: Uuid, page_limit: usize) -> Result<Self, StoreError> {
        Ok(Self {
            device_id,
            user_id,
            root_ids: log.roots_for(user_id)?,
            subscriptions: HashMap::new(),
            page_limit,
        })
    }

    pub fn root_ids(&self) -> &BTreeSet<NodeId> {
        &self.root_ids
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn authorize(&mut self, log: &TransactionLog, input: SyncInput) -> Result<(), SessionError> {
        let SyncInput::Transactions { root_id } = input else {
            return Ok(());
        };
        if self.root_ids.contains(&root_id) {
            return Ok(());
        }
        self.root_ids = log.roots_for(self.user_id)?;
        if self.root_ids.contains(&root_id) {
            Ok(())
        } else {
            Err(SessionError::Unauthorized {
                user: self.user_id,
                input: input.key(),
            })
        }
    }

    /// Page of `input` after `cursor`, bounded by the session's page limit.
    pub fn pull(&mut self, log: &TransactionLog, input: SyncInput, cursor: u64, limit: usize) -> Result<SyncPage, SessionError> {
        self.authorize(log, input)?;
        let limit = limit.min(self.page_limit).max(1);
        Ok(log.page(self.user_id, input, cursor, limit)?)
    }

    /// Answer now if data exists after `cursor`; otherwise park a one-shot
    /// subscription under `subscription_id`.
    pub fn subscribe(
        &mut self,
        log: &TransactionLog,
        subscription_id: String,
        input: SyncInput,
        cursor: u64,
    ) -> Result<Option<SyncPage>, SessionError> {
        self.authorize(log, input)?;
        let page = log.page(self.user_id, input, cursor, self.page_limit)?;
        if !page.is_empty() {
            self.subscriptions.remove(&subscription_id);
            return Ok(Some(page));
        }
        self.subscriptions.insert(subscription_id, Subscription { input, cursor });
        Ok(None)
    }

    pub fn unsubscribe(&mut self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    /// Pages owed to this session because of `event`.
    pub fn on_event(&mut self, log: &TransactionLog, event: &LogEvent) -> Result<Vec<SyncPage>, SessionError> {
        match event {
            LogEvent::TransactionAppended(transaction) => {
                if !self.root_ids.contains(&transaction.root_id) {
                    return Ok(Vec::new());
                }
                let input = SyncInput::Transactions {
                    root_id: transaction.root_id,
                };
                self.fire(log, input, transaction.version)
            }
            LogEvent::CollaborationChanged(collaboration) => {
                if collaboration.collaborator_id != self.user_id {
                    return Ok(Vec::new());
                }
                if collaboration.is_active() {
                    self.root_ids.insert(collaboration.root_id);
                } else {
                    self.root_ids = log.roots_for(self.user_id)?;
                    let readable = &self.root_ids;
                    self.subscriptions.retain(|_, s| match s.input {
                        SyncInput::Transactions { root_id } => readable.contains(&root_id),
                        SyncInput::Collaborations => true,
                    });
                }
                self.fire(log, SyncInput::Collaborations, collaboration.version)
            }
        }
    }

    /// Re-check every parked subscription against the log, for when events
    /// were missed (receiver lagged).
    pub fn refresh(&mut self, log: &TransactionLog) -> Result<Vec<SyncPage>, SessionError> {
        self.root_ids = log.roots_for(self.user_id)?;
        let mut pages = Vec::new();
        let parked: Vec<String> = self.subscriptions.keys().cloned().collect();
        for id in parked {
            let Some(subscription) = self.subscriptions.remove(&id) else {
                continue;
            };
            if let SyncInput::Transactions { root_id } = subscription.input {
                if !self.root_ids.contains(&root_id) {
                    continue;
                }
            }
            let page = log.page(self.user_id, subscription.input, subscription.cursor, self.page_limit)?;
            if page.is_empty() {
                self.subscriptions.insert(id, subscription);
            } else {
                pages.push(page);
            }
        }
        Ok(pages)
    }

    fn fire(&mut self, log: &TransactionLog, input: SyncInput, version: u64) -> Result<Vec<SyncPage>, SessionError> {
        let mut pages = Vec::new();
        let due: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.input == input && s.cursor < version)
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let Some(subscription) = self.subscriptions.remove(&id) else {
                continue;
            };
            let page = log.page(self.user_id, subscription.input, subscription.cursor, self.page_limit)?;
            if page.is_empty() {
                self.subscriptions.insert(id, subscription);
            } else {
                pages.push(page);
            }
        }
        Ok(pages)
    }
}
