//! Repository interfaces the engine reads from and writes to.
//!
//! Every read is a possibly-stale snapshot. Writes of versioned records are
//! compare-and-set against the `version` field of the record passed in: the
//! store accepts the write only if its copy still carries that version, and
//! returns the record with the bumped version. A mismatch is
//! `StoreError::Conflict`.
use async_trait::async_trait;

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreResult;
use crate::events::Event;
use crate::model::{Node, NodeId, ObservedState, SubscriberEntry, SubscriberId, UsageTotal};

/// Subscription source of truth
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn list_active_subscribers(&self) -> StoreResult<Vec<SubscriberEntry>>;

    async fn get_subscriber(&self, id: &SubscriberId) -> StoreResult<Option<SubscriberEntry>>;

    /// Flip the enabled flag (CAS on `expected_version`)
    async fn set_subscriber_enabled(
        &self,
        id: &SubscriberId,
        enabled: bool,
        expected_version: u64,
    ) -> StoreResult<SubscriberEntry>;
}

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn list_nodes(&self) -> StoreResult<Vec<Node>>;

    async fn get_node(&self, id: NodeId) -> StoreResult<Option<Node>>;

    /// CAS write of an existing node record
    async fn save_node(&self, node: &Node) -> StoreResult<Node>;
}

/// Last successfully pushed entry set per node
#[async_trait]
pub trait SyncStateRepository: Send + Sync {
    /// Empty state when nothing was ever pushed
    async fn load_observed(&self, node: NodeId) -> StoreResult<ObservedState>;

    async fn list_observed(&self) -> StoreResult<Vec<ObservedState>>;

    /// CAS write; version 0 creates
    async fn save_observed(&self, state: &ObservedState) -> StoreResult<ObservedState>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn get_usage(&self, subscriber: &SubscriberId) -> StoreResult<Option<UsageTotal>>;

    /// CAS write; version 0 creates
    async fn upsert_usage_total(&self, usage: &UsageTotal) -> StoreResult<UsageTotal>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append_event(&self, event: &Event) -> StoreResult<()>;

    /// Newest first
    async fn recent_events(&self, limit: usize) -> StoreResult<Vec<Event>>;
}

/// Everything the engine needs from persistence
pub trait Store:
    SubscriptionRepository + NodeRepository + SyncStateRepository + UsageRepository + EventSink
{
}

impl<T> Store for T where
    T: SubscriptionRepository + NodeRepository + SyncStateRepository + UsageRepository + EventSink
{
}
