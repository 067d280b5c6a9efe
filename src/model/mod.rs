//! Records shared by every part of the engine
mod ids;
mod node;
mod subscriber;
mod usage;

pub use ids::{NodeId, SubscriberId};
pub use node::{HealthRecord, HealthState, Node, ObservedState};
pub use subscriber::{Inbound, ProtocolParams, SubscriberEntry};
pub use usage::{
    check_limits, counter_delta, CounterDelta, LimitKind, TrafficSample, UsageTotal,
};
