use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{NodeId, ProtocolParams, SubscriberId};

/// Node liveness as seen by the health monitor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unreachable,
    Retired,
}

impl HealthState {
    /// Sync and traffic collection only run against these states
    pub fn is_serviceable(&self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unreachable => "unreachable",
            HealthState::Retired => "retired",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Health fields of a node record. Owned by the health monitor.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HealthRecord {
    pub state: HealthState,
    pub consecutive_failures: u32,
    /// When `state` was entered
    pub since: DateTime<Utc>,
    pub last_ping_at: Option<DateTime<Utc>>,
    /// Sequence number of the last ping outcome applied
    pub last_ping_seq: u64,
    pub engine_version: Option<String>,
}

impl HealthRecord {
    /// A freshly registered node: nothing is known about its live state yet,
    /// so it starts out unreachable until the first ping succeeds.
    pub fn unknown(now: DateTime<Utc>) -> Self {
        Self {
            state: HealthState::Unreachable,
            consecutive_failures: 0,
            since: now,
            last_ping_at: None,
            last_ping_seq: 0,
            engine_version: None,
        }
    }
}

/// A proxy node managed by this control plane
#[derive(Clone, Deserialize, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Base URL of the node's control-plane API
    pub address: Url,
    /// Shared secret for the node's control-plane API
    pub secret: String,
    /// Declared maximum number of subscriber slots
    pub capacity: u32,
    pub health: HealthRecord,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub observed_revision: Option<u64>,
    /// Compare-and-set version, bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address.as_str())
            .field("capacity", &self.capacity)
            .field("health", &self.health.state)
            .field("observed_revision", &self.observed_revision)
            .field("version", &self.version)
            .finish()
    }
}

impl Node {
    pub fn new(id: NodeId, name: &str, address: Url, secret: &str, capacity: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            address,
            secret: secret.to_string(),
            capacity,
            health: HealthRecord::unknown(Utc::now()),
            last_sync_at: None,
            observed_revision: None,
            version: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        self.health.state
    }
}

/// What this engine last successfully pushed to a node.
///
/// `inbounds` is the exact set the node acknowledged under `revision`.
/// `rejected` remembers entries the node refused so they are not retried
/// until their protocol parameters change.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ObservedState {
    pub node: NodeId,
    pub revision: Option<u64>,
    pub inbounds: BTreeMap<SubscriberId, ProtocolParams>,
    #[serde(default)]
    pub rejected: BTreeMap<SubscriberId, ProtocolParams>,
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl ObservedState {
    pub fn empty(node: NodeId) -> Self {
        Self {
            node,
            ..Default::default()
        }
    }

    pub fn contains(&self, subscriber: &SubscriberId) -> bool {
        self.inbounds.contains_key(subscriber)
    }
}
