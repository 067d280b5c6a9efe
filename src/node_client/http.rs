use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::messages::{
    HealthResponse, InboundListResponse, PutInboundRequest, RejectionResponse, RevisionResponse,
};
use super::{NodeClient, PingReport};
use crate::error::{NodeError, RejectedEntry};
use crate::model::{HealthState, Inbound, Node, ProtocolParams, SubscriberId};
use crate::settings::EngineSettings;

const API_PREFIX: [&str; 2] = ["api", "v1"];

/// Talks to the node's control-plane HTTP API, authenticating with the
/// node's shared secret as a bearer token.
#[derive(Clone, Debug)]
pub struct HttpNodeClient {
    client: reqwest::Client,
    rpc_timeout: Duration,
    degraded_rpc_timeout: Duration,
}

impl HttpNodeClient {
    pub fn new(rpc_timeout: Duration, degraded_rpc_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_timeout,
            degraded_rpc_timeout,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.rpc_timeout, settings.degraded_rpc_timeout)
    }

    fn timeout_for(&self, node: &Node) -> Duration {
        match node.state() {
            HealthState::Degraded => self.degraded_rpc_timeout.min(self.rpc_timeout),
            _ => self.rpc_timeout,
        }
    }

    async fn send(&self, node: &Node, request: RequestBuilder) -> Result<Response, NodeError> {
        let timeout = self.timeout_for(node);
        request
            .bearer_auth(&node.secret)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))
    }

    async fn decode<T: DeserializeOwned>(&self, node: &Node, response: Response) -> Result<T, NodeError> {
        let timeout = self.timeout_for(node);
        response
            .json::<T>()
            .await
            .map_err(|err| transport_error(err, timeout))
    }

    async fn list_inbounds(&self, node: &Node) -> Result<InboundListResponse, NodeError> {
        let url = endpoint(&node.address, &["inbounds"])?;
        let response = self.send(node, self.client.get(url)).await?;
        if !response.status().is_success() {
            return Err(unexpected_status(node, response.status()));
        }
        self.decode(node, response).await
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn push_config(
        &self,
        node: &Node,
        inbounds: &[Inbound],
        base_revision: Option<u64>,
    ) -> Result<u64, NodeError> {
        let listed = self.list_inbounds(node).await?;
        if let Some(expected) = base_revision {
            if listed.revision != expected {
                return Err(NodeError::VersionMismatch {
                    expected: Some(expected),
                    actual: listed.revision,
                });
            }
        }

        let present: HashMap<SubscriberId, Option<ProtocolParams>> = listed
            .inbounds
            .into_iter()
            .map(|status| (status.subscriber_id, status.params))
            .collect();
        let mut revision = listed.revision;
        let mut rejected = Vec::new();

        for inbound in inbounds {
            let unchanged = matches!(
                present.get(&inbound.subscriber),
                Some(Some(params)) if *params == inbound.params
            );
            if unchanged {
                continue;
            }
            let url = endpoint(&node.address, &["inbounds", inbound.subscriber.as_str()])?;
            let body = PutInboundRequest {
                params: inbound.params.clone(),
            };
            let response = self.send(node, self.client.put(url).json(&body)).await?;
            match response.status() {
                status if status.is_success() => {
                    revision = self.decode::<RevisionResponse>(node, response).await?.revision;
                }
                StatusCode::UNPROCESSABLE_ENTITY => {
                    let reason = response
                        .json::<RejectionResponse>()
                        .await
                        .map(|body| body.reason)
                        .unwrap_or_else(|_| "rejected by proxy engine".to_string());
                    rejected.push(RejectedEntry {
                        subscriber: inbound.subscriber.clone(),
                        reason,
                    });
                }
                status => return Err(unexpected_status(node, status)),
            }
        }

        let wanted: HashSet<&SubscriberId> = inbounds.iter().map(|i| &i.subscriber).collect();
        for subscriber in present.keys().filter(|s| !wanted.contains(s)) {
            let url = endpoint(&node.address, &["inbounds", subscriber.as_str()])?;
            let response = self.send(node, self.client.delete(url)).await?;
            match response.status() {
                status if status.is_success() => {
                    revision = self.decode::<RevisionResponse>(node, response).await?.revision;
                }
                // already gone
                StatusCode::NOT_FOUND => {}
                status => return Err(unexpected_status(node, status)),
            }
        }

        if !rejected.is_empty() {
            return Err(NodeError::Rejected(rejected));
        }
        debug!(
            "[{}] node holds {} inbounds at revision {}",
            node.id,
            inbounds.len(),
            revision
        );
        Ok(revision)
    }

    async fn fetch_counters(&self, node: &Node) -> Result<HashMap<SubscriberId, u64>, NodeError> {
        let listed = self.list_inbounds(node).await?;
        Ok(listed
            .inbounds
            .into_iter()
            .map(|status| {
                let counter = status.counter();
                (status.subscriber_id, counter)
            })
            .collect())
    }

    async fn ping(&self, node: &Node) -> Result<PingReport, NodeError> {
        let url = endpoint(&node.address, &["health"])?;
        let response = self.send(node, self.client.get(url)).await?;
        if !response.status().is_success() {
            return Err(unexpected_status(node, response.status()));
        }
        let health: HealthResponse = self.decode(node, response).await?;
        if !health.engine_running {
            return Err(NodeError::Unreachable(format!(
                "proxy engine on {} is not running (status {})",
                node.name, health.status
            )));
        }
        Ok(PingReport {
            version: health.version,
            revision: health.revision,
        })
    }
}

/// `base` + `api/v1` + `segments`, each segment percent-encoded
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, NodeError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| NodeError::Unreachable(format!("{} cannot be used as a base URL", base)))?
        .pop_if_empty()
        .extend(API_PREFIX)
        .extend(segments);
    Ok(url)
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> NodeError {
    if err.is_timeout() {
        NodeError::Timeout(timeout)
    } else {
        NodeError::Unreachable(err.to_string())
    }
}

fn unexpected_status(node: &Node, status: StatusCode) -> NodeError {
    NodeError::Unreachable(format!("{} answered HTTP {}", node.name, status))
}
