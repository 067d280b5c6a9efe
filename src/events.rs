//! Append-only audit trail of sync, enforcement and health events
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::model::{NodeId, SubscriberId};
use crate::store::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum EventCategory {
    #[serde(rename = "sync.success")]
    SyncSuccess,
    #[serde(rename = "sync.entry_rejected")]
    SyncEntryRejected,
    /// A node ran out of retries for its push
    #[serde(rename = "sync.failed")]
    SyncFailed,
    #[serde(rename = "sync.version_mismatch")]
    SyncVersionMismatch,
    #[serde(rename = "health.transition")]
    HealthTransition,
    #[serde(rename = "node.retired")]
    NodeRetired,
    #[serde(rename = "collector.counter_reset")]
    CounterReset,
    #[serde(rename = "enforcement.limit_reached")]
    LimitReached,
    #[serde(rename = "usage.reset")]
    UsageReset,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::SyncSuccess => "sync.success",
            EventCategory::SyncEntryRejected => "sync.entry_rejected",
            EventCategory::SyncFailed => "sync.failed",
            EventCategory::SyncVersionMismatch => "sync.version_mismatch",
            EventCategory::HealthTransition => "health.transition",
            EventCategory::NodeRetired => "node.retired",
            EventCategory::CounterReset => "collector.counter_reset",
            EventCategory::LimitReached => "enforcement.limit_reached",
            EventCategory::UsageReset => "usage.reset",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Info,
}

/// What an event is about
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Node(NodeId),
    Subscriber(SubscriberId),
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subject = match self {
            Subject::Node(id) => format!("node:{}", id),
            Subject::Subscriber(id) => format!("subscriber:{}", id),
        };
        f.pad(&subject)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub category: EventCategory,
    pub subject: Subject,
    pub outcome: Outcome,
    pub detail: String,
}

impl Event {
    pub fn new(
        category: EventCategory,
        subject: Subject,
        outcome: Outcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            subject,
            outcome,
            detail: detail.into(),
        }
    }

    pub fn node(category: EventCategory, node: NodeId, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self::new(category, Subject::Node(node), outcome, detail)
    }

    pub fn subscriber(
        category: EventCategory,
        subscriber: SubscriberId,
        outcome: Outcome,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(category, Subject::Subscriber(subscriber), outcome, detail)
    }
}

/// Writes events to the store's sink and mirrors them into the trace log.
///
/// Recording never fails the caller: a failed append is retried once and
/// then logged.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn Store>,
}

impl EventLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn record(&self, event: Event) {
        match event.outcome {
            Outcome::Failure => warn!(
                category = event.category.as_str(),
                subject = %event.subject,
                "{}",
                event.detail
            ),
            _ => info!(
                category = event.category.as_str(),
                subject = %event.subject,
                "{}",
                event.detail
            ),
        }

        if let Err(first) = self.store.append_event(&event).await {
            if let Err(second) = self.store.append_event(&event).await {
                error!(
                    category = event.category.as_str(),
                    "Dropping event after two failed appends: {} / {}",
                    first,
                    second
                );
            }
        }
    }

    pub async fn recent(&self, limit: usize) -> crate::error::Result<Vec<Event>> {
        Ok(self.store.recent_events(limit).await?)
    }
}
