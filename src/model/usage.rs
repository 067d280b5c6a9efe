use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NodeId, SubscriberEntry, SubscriberId};

/// One cumulative counter reading for a subscriber on a node
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrafficSample {
    pub subscriber: SubscriberId,
    pub node: NodeId,
    pub counter: u64,
    pub observed_at: DateTime<Utc>,
}

/// Which limit a subscriber crossed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Traffic,
    Devices,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::Traffic => write!(f, "traffic"),
            LimitKind::Devices => write!(f, "devices"),
        }
    }
}

/// Accumulated usage of one subscriber in the current quota period.
///
/// `counters` holds the last counter value accounted per node. Bytes are only
/// ever derived from the difference to that checkpoint, so replaying a sample
/// adds nothing. `bytes` and the checkpoints are written together.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct UsageTotal {
    pub subscriber: SubscriberId,
    pub bytes: u64,
    pub devices: BTreeSet<String>,
    pub counters: BTreeMap<NodeId, u64>,
    /// Set once a limit has been enforced; cleared only by an administrative reset
    pub enforced: Option<LimitKind>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl UsageTotal {
    pub fn new(subscriber: SubscriberId) -> Self {
        Self {
            subscriber,
            bytes: 0,
            devices: BTreeSet::new(),
            counters: BTreeMap::new(),
            enforced: None,
            updated_at: Utc::now(),
            version: 0,
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

/// How a new counter reading relates to the last accounted one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterDelta {
    /// Counter moved forward (or was seen for the first time) by this many bytes
    Advance(u64),
    /// Counter went backwards: the node's engine restarted and began again at zero.
    /// Everything the new counter shows is fresh traffic.
    Reset { previous: u64, delta: u64 },
}

impl CounterDelta {
    pub fn bytes(&self) -> u64 {
        match self {
            CounterDelta::Advance(bytes) => *bytes,
            CounterDelta::Reset { delta, .. } => *delta,
        }
    }
}

pub fn counter_delta(last: Option<u64>, current: u64) -> CounterDelta {
    match last {
        None => CounterDelta::Advance(current),
        Some(last) if current >= last => CounterDelta::Advance(current - last),
        Some(previous) => CounterDelta::Reset {
            previous,
            delta: current,
        },
    }
}

/// Returns the limit `usage` breaches under `entry`'s quota and device limit
pub fn check_limits(
    usage: &UsageTotal,
    entry: &SubscriberEntry,
    default_device_limit: u32,
) -> Option<LimitKind> {
    if let Some(quota) = entry.quota_bytes.filter(|quota| *quota > 0) {
        if usage.bytes >= quota {
            return Some(LimitKind::Traffic);
        }
    }
    let device_limit = entry.device_limit.unwrap_or(default_device_limit);
    if device_limit > 0 && usage.device_count() > device_limit as usize {
        return Some(LimitKind::Devices);
    }
    None
}
