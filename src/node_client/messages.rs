//! JSON bodies of the node control-plane API
use serde::{Deserialize, Serialize};

use crate::model::{ProtocolParams, SubscriberId};

/// `GET api/v1/health`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Configuration revision currently live in the proxy engine
    #[serde(default)]
    pub revision: Option<u64>,
    pub engine_running: bool,
}

/// `GET api/v1/inbounds`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InboundListResponse {
    pub revision: u64,
    pub inbounds: Vec<InboundStatus>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InboundStatus {
    pub subscriber_id: SubscriberId,
    #[serde(default)]
    pub params: Option<ProtocolParams>,
    /// Cumulative byte counters since the proxy engine started
    #[serde(default)]
    pub uplink: u64,
    #[serde(default)]
    pub downlink: u64,
}

impl InboundStatus {
    pub fn counter(&self) -> u64 {
        self.uplink.saturating_add(self.downlink)
    }
}

/// Body of `PUT api/v1/inbounds/:subscriber_id`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PutInboundRequest {
    pub params: ProtocolParams,
}

/// Answer to a successful `PUT` or `DELETE`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RevisionResponse {
    pub revision: u64,
}

/// Answer to a `PUT` the proxy engine refused (HTTP 422)
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RejectionResponse {
    pub reason: String,
}
