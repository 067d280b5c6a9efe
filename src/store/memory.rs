use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{EventSink, NodeRepository, SubscriptionRepository, SyncStateRepository, UsageRepository};
use crate::error::{StoreError, StoreResult};
use crate::events::Event;
use crate::model::{Node, NodeId, ObservedState, SubscriberEntry, SubscriberId, UsageTotal};

/// Events beyond this many are dropped oldest-first
pub const MAX_RETAINED_EVENTS: usize = 10_000;

#[derive(Clone, Default, Deserialize, Serialize)]
struct Snapshot {
    nodes: BTreeMap<NodeId, Node>,
    subscribers: BTreeMap<SubscriberId, SubscriberEntry>,
    observed: BTreeMap<NodeId, ObservedState>,
    usage: BTreeMap<SubscriberId, UsageTotal>,
    events: VecDeque<Event>,
}

/// In-process store. With a path, every write is flushed to a JSON snapshot
/// (write to a temp file, then rename) so a restarted engine resumes where
/// the last successful write left it. A write whose flush fails is not
/// applied in memory either.
pub struct MemoryStore {
    state: RwLock<Snapshot>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            path: None,
        }
    }

    /// Load the snapshot at `path`, or start empty if it does not exist yet
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let snapshot = match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                info!(
                    "Loaded state from {}: {} nodes, {} subscribers",
                    path.display(),
                    snapshot.nodes.len(),
                    snapshot.subscribers.len()
                );
                snapshot
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No state at {}, starting empty", path.display());
                Snapshot::default()
            }
            Err(err) => return Err(StoreError::Unavailable(format!("{}: {}", path.display(), err))),
        };
        Ok(Self {
            state: RwLock::new(snapshot),
            path: Some(path.to_path_buf()),
        })
    }

    /// Fleet registration: insert or replace a node record
    pub async fn register_node(&self, mut node: Node) -> StoreResult<Node> {
        let mut state = self.state.write().await;
        node.version = state.nodes.get(&node.id).map(|n| n.version).unwrap_or(0) + 1;
        let stored = node.clone();
        self.commit(&mut state, |snapshot| {
            snapshot.nodes.insert(stored.id, stored);
        })
        .await?;
        Ok(node)
    }

    /// Subscription administration: insert or replace a subscriber record
    pub async fn upsert_subscriber(&self, mut entry: SubscriberEntry) -> StoreResult<SubscriberEntry> {
        let mut state = self.state.write().await;
        entry.version = state
            .subscribers
            .get(&entry.subscriber)
            .map(|s| s.version)
            .unwrap_or(0)
            + 1;
        let stored = entry.clone();
        self.commit(&mut state, |snapshot| {
            snapshot.subscribers.insert(stored.subscriber.clone(), stored);
        })
        .await?;
        Ok(entry)
    }

    /// Apply `change` and persist the result. With a snapshot file the change
    /// goes to a copy first and replaces the live state only once flushed.
    async fn commit<F>(&self, state: &mut Snapshot, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Snapshot) + Send,
    {
        if self.path.is_none() {
            change(state);
            return Ok(());
        }
        let mut candidate = state.clone();
        change(&mut candidate);
        self.flush(&candidate).await?;
        *state = candidate;
        Ok(())
    }

    async fn flush(&self, state: &Snapshot) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Flushed state to {}", path.display());
        Ok(())
    }
}

fn cas(what: String, stored: Option<u64>, expected: u64) -> StoreResult<()> {
    match stored {
        None if expected == 0 => Ok(()),
        Some(version) if version == expected => Ok(()),
        Some(version) => Err(StoreError::Conflict(format!(
            "{} is at version {}, write expected {}",
            what, version, expected
        ))),
        None => Err(StoreError::Conflict(format!("{} no longer exists", what))),
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn list_active_subscribers(&self) -> StoreResult<Vec<SubscriberEntry>> {
        Ok(self.state.read().await.subscribers.values().cloned().collect())
    }

    async fn get_subscriber(&self, id: &SubscriberId) -> StoreResult<Option<SubscriberEntry>> {
        Ok(self.state.read().await.subscribers.get(id).cloned())
    }

    async fn set_subscriber_enabled(
        &self,
        id: &SubscriberId,
        enabled: bool,
        expected_version: u64,
    ) -> StoreResult<SubscriberEntry> {
        let mut state = self.state.write().await;
        let stored = state
            .subscribers
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("subscriber {}", id)))?;
        cas(format!("subscriber {}", id), Some(stored.version), expected_version)?;
        let mut updated = stored.clone();
        updated.enabled = enabled;
        updated.version += 1;
        let entry = updated.clone();
        self.commit(&mut state, |snapshot| {
            snapshot.subscribers.insert(entry.subscriber.clone(), entry);
        })
        .await?;
        Ok(updated)
    }
}

#[async_trait]
impl NodeRepository for MemoryStore {
    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }

    async fn get_node(&self, id: NodeId) -> StoreResult<Option<Node>> {
        Ok(self.state.read().await.nodes.get(&id).cloned())
    }

    async fn save_node(&self, node: &Node) -> StoreResult<Node> {
        let mut state = self.state.write().await;
        let stored = state
            .nodes
            .get(&node.id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node.id)))?;
        cas(format!("node {}", node.id), Some(stored.version), node.version)?;
        let mut updated = node.clone();
        updated.version += 1;
        let record = updated.clone();
        self.commit(&mut state, |snapshot| {
            snapshot.nodes.insert(record.id, record);
        })
        .await?;
        Ok(updated)
    }
}

#[async_trait]
impl SyncStateRepository for MemoryStore {
    async fn load_observed(&self, node: NodeId) -> StoreResult<ObservedState> {
        Ok(self
            .state
            .read()
            .await
            .observed
            .get(&node)
            .cloned()
            .unwrap_or_else(|| ObservedState::empty(node)))
    }

    async fn list_observed(&self) -> StoreResult<Vec<ObservedState>> {
        Ok(self.state.read().await.observed.values().cloned().collect())
    }

    async fn save_observed(&self, observed: &ObservedState) -> StoreResult<ObservedState> {
        let mut state = self.state.write().await;
        let stored = state.observed.get(&observed.node).map(|o| o.version);
        cas(
            format!("observed state of node {}", observed.node),
            stored,
            observed.version,
        )?;
        let mut updated = observed.clone();
        updated.version += 1;
        let record = updated.clone();
        self.commit(&mut state, |snapshot| {
            snapshot.observed.insert(record.node, record);
        })
        .await?;
        Ok(updated)
    }
}

#[async_trait]
impl UsageRepository for MemoryStore {
    async fn get_usage(&self, subscriber: &SubscriberId) -> StoreResult<Option<UsageTotal>> {
        Ok(self.state.read().await.usage.get(subscriber).cloned())
    }

    async fn upsert_usage_total(&self, usage: &UsageTotal) -> StoreResult<UsageTotal> {
        let mut state = self.state.write().await;
        let stored = state.usage.get(&usage.subscriber).map(|u| u.version);
        cas(
            format!("usage of {}", usage.subscriber),
            stored,
            usage.version,
        )?;
        let mut updated = usage.clone();
        updated.version += 1;
        let record = updated.clone();
        self.commit(&mut state, |snapshot| {
            snapshot.usage.insert(record.subscriber.clone(), record);
        })
        .await?;
        Ok(updated)
    }
}

#[async_trait]
impl EventSink for MemoryStore {
    async fn append_event(&self, event: &Event) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let event = event.clone();
        self.commit(&mut state, |snapshot| {
            snapshot.events.push_back(event);
            while snapshot.events.len() > MAX_RETAINED_EVENTS {
                snapshot.events.pop_front();
            }
        })
        .await
    }

    async fn recent_events(&self, limit: usize) -> StoreResult<Vec<Event>> {
        Ok(self
            .state
            .read()
            .await
            .events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
