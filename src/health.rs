//! Node liveness.
//!
//! The state lives in the node record (`Node::health`) and only ever changes
//! through the pure functions in this module. `NodeHealthMonitor` feeds them
//! ping outcomes and writes the result back with compare-and-set.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::events::{Event, EventCategory, EventLog, Outcome};
use crate::model::{HealthRecord, HealthState, Node, NodeId};
use crate::node_client::NodeClient;
use crate::not_found;
use crate::scheduler::TaskQueue;
use crate::store::Store;
use crate::sync::{SyncMode, SyncReason};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PingOutcome {
    Success {
        version: String,
        revision: Option<u64>,
    },
    Failure {
        reason: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

fn finish(
    current: &HealthRecord,
    mut next: HealthRecord,
    now: DateTime<Utc>,
) -> (HealthRecord, Option<Transition>) {
    if next.state == current.state {
        return (next, None);
    }
    next.since = now;
    let transition = Transition {
        from: current.state,
        to: next.state,
    };
    (next, Some(transition))
}

/// Apply the outcome of ping number `seq`.
///
/// Outcomes older than the last applied one are ignored, so transitions
/// follow ping order even when results arrive out of order. `Retired` is
/// terminal. One successful ping makes any other state `Healthy` and
/// clears the failure streak; an `Unreachable` node needs no run of
/// successes to come back.
pub fn next_health(
    current: &HealthRecord,
    seq: u64,
    outcome: &PingOutcome,
    unreachable_after: u32,
    now: DateTime<Utc>,
) -> (HealthRecord, Option<Transition>) {
    if current.state == HealthState::Retired || seq <= current.last_ping_seq {
        return (current.clone(), None);
    }
    let mut next = current.clone();
    next.last_ping_seq = seq;
    next.last_ping_at = Some(now);

    match outcome {
        PingOutcome::Success { version, .. } => {
            next.state = HealthState::Healthy;
            next.consecutive_failures = 0;
            next.engine_version = Some(version.clone());
        }
        PingOutcome::Failure { .. } => {
            next.consecutive_failures = current.consecutive_failures.saturating_add(1);
            next.state = if next.consecutive_failures >= unreachable_after
                || current.state == HealthState::Unreachable
            {
                HealthState::Unreachable
            } else {
                HealthState::Degraded
            };
        }
    }
    finish(current, next, now)
}

/// Force `Unreachable` after the synchronizer exhausted its retry budget
pub fn force_unreachable(
    current: &HealthRecord,
    unreachable_after: u32,
    now: DateTime<Utc>,
) -> (HealthRecord, Option<Transition>) {
    if matches!(current.state, HealthState::Retired | HealthState::Unreachable) {
        return (current.clone(), None);
    }
    let mut next = current.clone();
    next.state = HealthState::Unreachable;
    next.consecutive_failures = current.consecutive_failures.max(unreachable_after);
    finish(current, next, now)
}

pub fn retire(current: &HealthRecord, now: DateTime<Utc>) -> (HealthRecord, Option<Transition>) {
    let mut next = current.clone();
    next.state = HealthState::Retired;
    finish(current, next, now)
}

/// Pings nodes and keeps their health records current
pub struct NodeHealthMonitor {
    store: Arc<dyn Store>,
    client: Arc<dyn NodeClient>,
    events: EventLog,
    queue: TaskQueue,
    unreachable_after: u32,
    seq: AtomicU64,
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
}

impl NodeHealthMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn NodeClient>,
        events: EventLog,
        queue: TaskQueue,
        unreachable_after: u32,
    ) -> Self {
        Self {
            store,
            client,
            events,
            queue,
            unreachable_after,
            seq: AtomicU64::new(0),
            locks: DashMap::new(),
        }
    }

    /// Ping sequence numbers keep increasing across restarts: they never
    /// fall below the wall clock in microseconds.
    fn next_seq(&self) -> u64 {
        let floor = Utc::now().timestamp_millis().max(0) as u64 * 1000;
        self.seq.fetch_max(floor, Ordering::AcqRel);
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn lock_for(&self, node: NodeId) -> Arc<Mutex<()>> {
        self.locks.entry(node).or_default().clone()
    }

    /// Ping `node_id` and apply its outcome
    #[instrument(skip(self), level = "debug")]
    pub async fn poll_node(&self, node_id: NodeId) -> Result<Option<Transition>> {
        let seq = self.next_seq();
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| not_found!("node {}", node_id))?;
        if node.state() == HealthState::Retired {
            return Ok(None);
        }

        let outcome = match self.client.ping(&node).await {
            Ok(report) => PingOutcome::Success {
                version: report.version,
                revision: report.revision,
            },
            Err(err) => {
                debug!("[{}] ping failed: {}", node_id, err);
                PingOutcome::Failure {
                    reason: err.to_string(),
                }
            }
        };

        let unreachable_after = self.unreachable_after;
        let changed = self
            .update_health(node_id, |health, now| {
                next_health(health, seq, &outcome, unreachable_after, now)
            })
            .await?;

        let transition = match changed {
            Some((node, transition)) => {
                let detail = match &outcome {
                    PingOutcome::Failure { reason } => format!("{}: {}", transition, reason),
                    PingOutcome::Success { .. } => transition.to_string(),
                };
                self.record_transition(&node, transition, detail).await;
                if transition.from == HealthState::Unreachable
                    && transition.to == HealthState::Healthy
                {
                    // live state is unknown after an outage
                    self.queue
                        .request_sync(node_id, SyncMode::Full, SyncReason::Recovered);
                }
                Some(transition)
            }
            None => None,
        };

        if let PingOutcome::Success {
            revision: Some(live),
            ..
        } = outcome
        {
            let recovering = transition.map(|t| t.from == HealthState::Unreachable) == Some(true);
            if !recovering && node.observed_revision.map_or(false, |seen| seen != live) {
                debug!(
                    "[{}] runs revision {}, last pushed {:?}",
                    node_id, live, node.observed_revision
                );
                self.queue
                    .request_sync(node_id, SyncMode::Full, SyncReason::Drift);
            }
        }
        Ok(transition)
    }

    /// Push failures exhausted their budget
    pub async fn mark_unreachable(&self, node_id: NodeId, reason: &str) -> Result<Option<Transition>> {
        let unreachable_after = self.unreachable_after;
        let changed = self
            .update_health(node_id, |health, now| {
                force_unreachable(health, unreachable_after, now)
            })
            .await?;
        Ok(match changed {
            Some((node, transition)) => {
                self.record_transition(&node, transition, format!("{}: {}", transition, reason))
                    .await;
                Some(transition)
            }
            None => None,
        })
    }

    /// Administrative retirement. Returns the state the node left, or `None`
    /// when it was already retired.
    pub async fn retire(&self, node_id: NodeId) -> Result<Option<HealthState>> {
        let changed = self.update_health(node_id, retire).await?;
        Ok(match changed {
            Some((_, transition)) => {
                self.events
                    .record(Event::node(
                        EventCategory::NodeRetired,
                        node_id,
                        Outcome::Info,
                        format!("retired while {}", transition.from),
                    ))
                    .await;
                Some(transition.from)
            }
            None => None,
        })
    }

    async fn record_transition(&self, node: &Node, transition: Transition, detail: String) {
        let outcome = match transition.to {
            HealthState::Healthy => Outcome::Success,
            HealthState::Degraded | HealthState::Unreachable => Outcome::Failure,
            HealthState::Retired => Outcome::Info,
        };
        self.events
            .record(Event::node(
                EventCategory::HealthTransition,
                node.id,
                outcome,
                detail,
            ))
            .await;
    }

    /// Load, transition and write back the node's health under the node's
    /// lock. A conflicting write is retried once against a fresh read.
    async fn update_health<F>(
        &self,
        node_id: NodeId,
        transition: F,
    ) -> Result<Option<(Node, Transition)>>
    where
        F: Fn(&HealthRecord, DateTime<Utc>) -> (HealthRecord, Option<Transition>) + Send + Sync,
    {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;
        let mut retried = false;
        loop {
            let node = self
                .store
                .get_node(node_id)
                .await?
                .ok_or_else(|| not_found!("node {}", node_id))?;
            let (health, change) = transition(&node.health, Utc::now());
            if health == node.health {
                return Ok(None);
            }
            let mut updated = node;
            updated.health = health;
            match self.store.save_node(&updated).await {
                Ok(saved) => return Ok(change.map(|change| (saved, change))),
                Err(StoreError::Conflict(what)) if !retried => {
                    debug!("[{}] retrying health write: {}", node_id, what);
                    retried = true;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
