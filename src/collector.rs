//! Polls per-subscriber traffic counters and feeds them to the enforcer
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::enforcer::UsageEnforcer;
use crate::error::Result;
use crate::model::{HealthState, NodeId, TrafficSample};
use crate::node_client::NodeClient;
use crate::not_found;
use crate::store::Store;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub samples: usize,
    pub bytes: u64,
    pub resets: usize,
    pub enforced: usize,
    /// Counters for subscribers we do not manage
    pub unknown: usize,
    /// Samples that could not be accounted; retried with the next poll
    pub failures: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectOutcome {
    Skipped(HealthState),
    Collected(CollectReport),
}

pub struct TrafficCollector {
    store: Arc<dyn Store>,
    client: Arc<dyn NodeClient>,
    enforcer: Arc<UsageEnforcer>,
}

impl TrafficCollector {
    pub fn new(store: Arc<dyn Store>, client: Arc<dyn NodeClient>, enforcer: Arc<UsageEnforcer>) -> Self {
        Self {
            store,
            client,
            enforcer,
        }
    }

    /// Fetch `node_id`'s counters and account every subscriber on it.
    ///
    /// Only a failed fetch fails the call; a sample that cannot be accounted
    /// is counted in the report and the rest carry on.
    #[instrument(skip(self), level = "debug")]
    pub async fn collect_node(&self, node_id: NodeId) -> Result<CollectOutcome> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| not_found!("node {}", node_id))?;
        if !node.state().is_serviceable() {
            debug!("[{}] skipping collection, node is {}", node_id, node.state());
            return Ok(CollectOutcome::Skipped(node.state()));
        }

        let counters: BTreeMap<_, _> = self.client.fetch_counters(&node).await?.into_iter().collect();
        let observed_at = Utc::now();
        let mut report = CollectReport::default();

        for (subscriber, counter) in counters {
            let sample = TrafficSample {
                subscriber,
                node: node_id,
                counter,
                observed_at,
            };
            match self.enforcer.record_sample(&sample).await {
                Ok(None) => report.unknown += 1,
                Ok(Some(update)) => {
                    report.samples += 1;
                    report.bytes = report.bytes.saturating_add(update.bytes_added);
                    if update.counter_reset {
                        report.resets += 1;
                    }
                    if update.enforced.is_some() {
                        report.enforced += 1;
                    }
                }
                Err(err) => {
                    report.failures += 1;
                    warn!(
                        "[{}] could not account sample for {}: {}",
                        node_id, sample.subscriber, err
                    );
                }
            }
        }

        debug!(
            "[{}] collected {} samples, {} bytes",
            node_id, report.samples, report.bytes
        );
        Ok(CollectOutcome::Collected(report))
    }
}
