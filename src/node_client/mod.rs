//! Control-plane RPCs against one node's proxy engine
use std::collections::HashMap;

use async_trait::async_trait;

mod http;
pub mod messages;

pub use http::HttpNodeClient;

use crate::error::NodeError;
use crate::model::{Inbound, Node, SubscriberId};

/// Result of a successful health ping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PingReport {
    pub version: String,
    /// Revision the node is running, if it reports one
    pub revision: Option<u64>,
}

/// Every call is bounded by a per-call timeout and never blocks indefinitely.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Make `inbounds` the node's complete inbound set and return the
    /// resulting revision.
    ///
    /// `base_revision` is the revision this engine last recorded for the node;
    /// a node running anything else answers `VersionMismatch`. `None` skips the
    /// check. Sending the set the node already has changes nothing and returns
    /// the same revision. Entries the node refuses come back as `Rejected`.
    async fn push_config(
        &self,
        node: &Node,
        inbounds: &[Inbound],
        base_revision: Option<u64>,
    ) -> Result<u64, NodeError>;

    /// Cumulative traffic counter per subscriber present on the node
    async fn fetch_counters(&self, node: &Node) -> Result<HashMap<SubscriberId, u64>, NodeError>;

    async fn ping(&self, node: &Node) -> Result<PingReport, NodeError>;
}
