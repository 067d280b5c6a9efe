use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{NodeId, SubscriberId};

/// Proxy-engine parameters of one subscriber's inbound client
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ProtocolParams {
    /// e.g. "vless", "vmess", "trojan"
    pub protocol: String,
    /// Client UUID or password, depending on the protocol
    pub credential: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// One subscriber's configuration as held by the subscription source of truth.
///
/// Exactly one node is assigned per subscriber. `enabled == false` means the
/// inbound must be absent from that node.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SubscriberEntry {
    pub subscriber: SubscriberId,
    pub node: NodeId,
    pub params: ProtocolParams,
    /// `None` or zero means unlimited traffic
    pub quota_bytes: Option<u64>,
    /// `None` falls back to the configured default; zero means unlimited
    pub device_limit: Option<u32>,
    pub enabled: bool,
    #[serde(default)]
    pub version: u64,
}

impl SubscriberEntry {
    pub fn new(subscriber: SubscriberId, node: NodeId, params: ProtocolParams) -> Self {
        Self {
            subscriber,
            node,
            params,
            quota_bytes: None,
            device_limit: None,
            enabled: true,
            version: 0,
        }
    }

    pub fn inbound(&self) -> Inbound {
        Inbound {
            subscriber: self.subscriber.clone(),
            params: self.params.clone(),
        }
    }
}

/// The unit pushed to a node's proxy engine
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Inbound {
    pub subscriber: SubscriberId,
    pub params: ProtocolParams,
}
