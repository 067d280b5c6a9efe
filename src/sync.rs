//! Reconciles each node's live inbound set against the subscription records.
//!
//! Every push carries the node's complete desired set. Pushes to one node are
//! serialized by a per-node lock which also holds the node's failure streak.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{NodeError, Result, StoreError};
use crate::events::{Event, EventCategory, EventLog, Outcome};
use crate::health::NodeHealthMonitor;
use crate::model::{
    HealthState, Inbound, Node, NodeId, ObservedState, ProtocolParams, SubscriberEntry,
    SubscriberId,
};
use crate::node_client::NodeClient;
use crate::not_found;
use crate::scheduler::TaskQueue;
use crate::store::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Push only when the desired set differs from what was last pushed
    Incremental,
    /// Push unconditionally without trusting the recorded revision
    Full,
}

/// Why a sync was requested out of band
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncReason {
    Scheduled,
    Enforcement,
    Recovered,
    Drift,
    Handoff,
    Admin,
}

impl std::fmt::Display for SyncReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SyncReason::Scheduled => "scheduled",
            SyncReason::Enforcement => "enforcement",
            SyncReason::Recovered => "recovered",
            SyncReason::Drift => "drift",
            SyncReason::Handoff => "handoff",
            SyncReason::Admin => "admin",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncOutcome {
    /// Node is not serviceable
    Skipped(HealthState),
    /// Desired set equals the last pushed one; no RPC was made
    Unchanged,
    Pushed {
        revision: u64,
        inbounds: usize,
        rejected: usize,
    },
    Failed {
        error: NodeError,
        consecutive_failures: u32,
        /// Retry budget exhausted; node handed to the health monitor
        suspended: bool,
    },
}

/// The inbound set one node should run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Desired {
    pub inbounds: BTreeMap<SubscriberId, ProtocolParams>,
    /// Assigned here but still live on another node that has not released them
    pub held_back: Vec<SubscriberId>,
    /// Refused by the node before with the same parameters
    pub excluded: BTreeMap<SubscriberId, ProtocolParams>,
}

/// Whether `holder`, which still runs a subscriber reassigned elsewhere, no
/// longer blocks the new node from adding it
pub fn releases_subscribers(
    holder: Option<&Node>,
    grace: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(holder) = holder else {
        return true;
    };
    match holder.state() {
        HealthState::Retired => true,
        HealthState::Unreachable => {
            let grace = chrono::Duration::from_std(grace)
                .unwrap_or_else(|_| chrono::Duration::MAX);
            now.signed_duration_since(holder.health.since) >= grace
        }
        HealthState::Healthy | HealthState::Degraded => false,
    }
}

/// Compute the desired inbound set of `node`.
///
/// A subscriber that moved here from another node is held back while the
/// other node's last pushed set still contains it, until that node is retired
/// or has been unreachable for `grace`.
pub fn desired_inbounds(
    node: NodeId,
    subscribers: &[SubscriberEntry],
    observed: &[ObservedState],
    nodes: &HashMap<NodeId, Node>,
    rejected: &BTreeMap<SubscriberId, ProtocolParams>,
    grace: Duration,
    now: DateTime<Utc>,
) -> Desired {
    let mut desired = Desired::default();
    for entry in subscribers
        .iter()
        .filter(|entry| entry.node == node && entry.enabled)
    {
        if rejected.get(&entry.subscriber) == Some(&entry.params) {
            desired
                .excluded
                .insert(entry.subscriber.clone(), entry.params.clone());
            continue;
        }
        let blocked = observed.iter().any(|other| {
            other.node != node
                && other.contains(&entry.subscriber)
                && !releases_subscribers(nodes.get(&other.node), grace, now)
        });
        if blocked {
            desired.held_back.push(entry.subscriber.clone());
        } else {
            desired
                .inbounds
                .insert(entry.subscriber.clone(), entry.params.clone());
        }
    }
    desired
}

fn to_inbounds(set: &BTreeMap<SubscriberId, ProtocolParams>) -> Vec<Inbound> {
    set.iter()
        .map(|(subscriber, params)| Inbound {
            subscriber: subscriber.clone(),
            params: params.clone(),
        })
        .collect()
}

pub struct ConfigSynchronizer {
    store: Arc<dyn Store>,
    client: Arc<dyn NodeClient>,
    events: EventLog,
    health: Arc<NodeHealthMonitor>,
    queue: TaskQueue,
    reassignment_grace: Duration,
    failure_threshold: u32,
    /// Per-node push lock guarding the consecutive failure count
    streaks: DashMap<NodeId, Arc<Mutex<u32>>>,
}

impl ConfigSynchronizer {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn NodeClient>,
        events: EventLog,
        health: Arc<NodeHealthMonitor>,
        queue: TaskQueue,
        reassignment_grace: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            store,
            client,
            events,
            health,
            queue,
            reassignment_grace,
            failure_threshold,
            streaks: DashMap::new(),
        }
    }

    /// Run one reconciliation of `node_id`
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_node(&self, node_id: NodeId, mode: SyncMode) -> Result<SyncOutcome> {
        let lock = self.streaks.entry(node_id).or_default().clone();
        let mut streak = lock.lock().await;

        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| not_found!("node {}", node_id))?;
        if !node.state().is_serviceable() {
            *streak = 0;
            debug!("[{}] skipping sync, node is {}", node_id, node.state());
            return Ok(SyncOutcome::Skipped(node.state()));
        }

        let subscribers = self.store.list_active_subscribers().await?;
        let all_observed = self.store.list_observed().await?;
        let nodes: HashMap<NodeId, Node> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .map(|node| (node.id, node))
            .collect();
        let mut observed = all_observed
            .iter()
            .find(|state| state.node == node_id)
            .cloned()
            .unwrap_or_else(|| ObservedState::empty(node_id));

        let desired = desired_inbounds(
            node_id,
            &subscribers,
            &all_observed,
            &nodes,
            &observed.rejected,
            self.reassignment_grace,
            Utc::now(),
        );
        if !desired.held_back.is_empty() {
            debug!(
                "[{}] holding back {} subscribers still live on their previous node",
                node_id,
                desired.held_back.len()
            );
        }
        if desired.inbounds.len() > node.capacity as usize {
            warn!(
                "[{}] {} inbounds assigned, node declares capacity {}",
                node_id,
                desired.inbounds.len(),
                node.capacity
            );
        }

        if mode == SyncMode::Incremental
            && observed.revision.is_some()
            && desired.inbounds == observed.inbounds
            && desired.excluded == observed.rejected
        {
            *streak = 0;
            return Ok(SyncOutcome::Unchanged);
        }

        let previous: BTreeSet<SubscriberId> = observed.inbounds.keys().cloned().collect();
        let mut pending = desired.inbounds;
        let mut rejected = desired.excluded;
        let mut base = match mode {
            SyncMode::Incremental => observed.revision,
            SyncMode::Full => None,
        };
        let mut mismatch_handled = false;

        let revision = loop {
            let inbounds = to_inbounds(&pending);
            match self.client.push_config(&node, &inbounds, base).await {
                Ok(revision) => break revision,
                Err(NodeError::Rejected(entries)) => {
                    let mut excluded = 0;
                    for entry in entries {
                        let Some(params) = pending.remove(&entry.subscriber) else {
                            continue;
                        };
                        excluded += 1;
                        rejected.insert(entry.subscriber.clone(), params);
                        self.events
                            .record(Event::subscriber(
                                EventCategory::SyncEntryRejected,
                                entry.subscriber,
                                Outcome::Failure,
                                format!("node {}: {}", node_id, entry.reason),
                            ))
                            .await;
                    }
                    if excluded == 0 {
                        let err = NodeError::Unreachable(
                            "node rejected entries that were not pushed".to_string(),
                        );
                        return Ok(self.push_failed(&node, &mut streak, err).await);
                    }
                    // the accepted part of the push already moved the node's revision
                    base = None;
                }
                Err(NodeError::VersionMismatch { expected, actual }) if !mismatch_handled => {
                    mismatch_handled = true;
                    self.events
                        .record(Event::node(
                            EventCategory::SyncVersionMismatch,
                            node_id,
                            Outcome::Failure,
                            format!(
                                "expected revision {:?}, node runs {}; pushing full state",
                                expected, actual
                            ),
                        ))
                        .await;
                    observed.inbounds.clear();
                    observed.revision = None;
                    base = Some(actual);
                }
                Err(err) => return Ok(self.push_failed(&node, &mut streak, err).await),
            }
        };
        *streak = 0;

        let pushed = pending.len();
        let rejected_count = rejected.len();
        observed.inbounds = pending;
        observed.rejected = rejected;
        observed.revision = Some(revision);
        observed.synced_at = Some(Utc::now());
        let observed = self.save_observed(observed).await?;
        self.record_sync(node_id, revision, observed.synced_at).await?;

        self.events
            .record(Event::node(
                EventCategory::SyncSuccess,
                node_id,
                Outcome::Success,
                format!(
                    "revision {}: {} inbounds, {} excluded",
                    revision, pushed, rejected_count
                ),
            ))
            .await;

        self.hand_off(node_id, &previous, &observed, &subscribers);

        Ok(SyncOutcome::Pushed {
            revision,
            inbounds: pushed,
            rejected: rejected_count,
        })
    }

    /// Subscribers removed from `node_id` that now belong to another node can
    /// be added there without waiting for its next cycle.
    fn hand_off(
        &self,
        node_id: NodeId,
        previous: &BTreeSet<SubscriberId>,
        observed: &ObservedState,
        subscribers: &[SubscriberEntry],
    ) {
        let removed: BTreeSet<&SubscriberId> = previous
            .iter()
            .filter(|subscriber| !observed.contains(subscriber))
            .collect();
        let targets: BTreeSet<NodeId> = subscribers
            .iter()
            .filter(|entry| {
                entry.enabled && entry.node != node_id && removed.contains(&entry.subscriber)
            })
            .map(|entry| entry.node)
            .collect();
        for target in targets {
            debug!("[{}] released subscribers for node {}", node_id, target);
            self.queue
                .request_sync(target, SyncMode::Incremental, SyncReason::Handoff);
        }
    }

    async fn push_failed(&self, node: &Node, streak: &mut u32, err: NodeError) -> SyncOutcome {
        *streak = streak.saturating_add(1);
        let failures = *streak;
        warn!(
            "[{}] push failed ({} consecutive): {}",
            node.id, failures, err
        );

        let suspended = failures >= self.failure_threshold;
        if failures == self.failure_threshold {
            self.events
                .record(Event::node(
                    EventCategory::SyncFailed,
                    node.id,
                    Outcome::Failure,
                    format!("{} consecutive push failures, last: {}", failures, err),
                ))
                .await;
        }
        if suspended {
            let reason = format!("{} consecutive push failures", failures);
            if let Err(mark_err) = self.health.mark_unreachable(node.id, &reason).await {
                error!("[{}] could not suspend node: {}", node.id, mark_err);
            }
        }
        SyncOutcome::Failed {
            error: err,
            consecutive_failures: failures,
            suspended,
        }
    }

    /// Persist the pushed set. We hold the node's push lock, so a conflict
    /// means an outside edit; retry once over the fresh version.
    async fn save_observed(&self, mut observed: ObservedState) -> Result<ObservedState> {
        match self.store.save_observed(&observed).await {
            Ok(saved) => Ok(saved),
            Err(StoreError::Conflict(what)) => {
                debug!("[{}] retrying observed state write: {}", observed.node, what);
                observed.version = self.store.load_observed(observed.node).await?.version;
                Ok(self.store.save_observed(&observed).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn record_sync(
        &self,
        node_id: NodeId,
        revision: u64,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut retried = false;
        loop {
            let mut node = self
                .store
                .get_node(node_id)
                .await?
                .ok_or_else(|| not_found!("node {}", node_id))?;
            node.observed_revision = Some(revision);
            node.last_sync_at = synced_at;
            match self.store.save_node(&node).await {
                Ok(_) => {
                    info!("[{}] in sync at revision {}", node_id, revision);
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) if !retried => retried = true,
                Err(err) => return Err(err.into()),
            }
        }
    }
}
