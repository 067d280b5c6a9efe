//! Wires the components together and exposes the administrative surface
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};
use url::Url;

use crate::collector::TrafficCollector;
use crate::enforcer::{UsageEnforcer, UsageUpdate};
use crate::error::{FleetError, Result};
use crate::events::{Event, EventLog};
use crate::health::NodeHealthMonitor;
use crate::model::{HealthState, NodeId, SubscriberId, UsageTotal};
use crate::node_client::NodeClient;
use crate::scheduler::{Scheduler, Services, TaskQueue};
use crate::settings::EngineSettings;
use crate::store::Store;
use crate::sync::{ConfigSynchronizer, SyncMode, SyncReason};
use crate::{api_error, not_found};

/// Sync status of one node
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub name: String,
    pub address: Url,
    pub capacity: u32,
    pub state: HealthState,
    pub state_since: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub engine_version: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub observed_revision: Option<u64>,
    pub inbounds: usize,
    pub rejected: usize,
}

pub struct Engine;

impl Engine {
    /// Check the store is usable, then start the scheduler.
    ///
    /// A store that cannot be read here is fatal.
    pub async fn start(
        settings: EngineSettings,
        store: Arc<dyn Store>,
        client: Arc<dyn NodeClient>,
    ) -> Result<EngineHandle> {
        settings.validate()?;
        let nodes = store.list_nodes().await?;
        let subscribers = store.list_active_subscribers().await?;
        info!(
            "Store ready: {} nodes, {} subscribers",
            nodes.len(),
            subscribers.len()
        );

        let events = EventLog::new(store.clone());
        let (queue, commands) = TaskQueue::new();
        let health = Arc::new(NodeHealthMonitor::new(
            store.clone(),
            client.clone(),
            events.clone(),
            queue.clone(),
            settings.unreachable_after,
        ));
        let sync = Arc::new(ConfigSynchronizer::new(
            store.clone(),
            client.clone(),
            events.clone(),
            health.clone(),
            queue.clone(),
            settings.reassignment_grace,
            settings.sync_failure_threshold,
        ));
        let enforcer = Arc::new(UsageEnforcer::new(
            store.clone(),
            events.clone(),
            queue.clone(),
            settings.default_device_limit,
        ));
        let collector = Arc::new(TrafficCollector::new(
            store.clone(),
            client,
            enforcer.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            settings,
            store.clone(),
            Services {
                health,
                sync,
                collector,
            },
        );
        let task = tokio::spawn(scheduler.run(commands, shutdown_rx));

        Ok(EngineHandle {
            store,
            events,
            queue,
            enforcer,
            shutdown_tx: Arc::new(shutdown_tx),
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// Administrative trigger surface of a running engine
#[derive(Clone)]
pub struct EngineHandle {
    store: Arc<dyn Store>,
    events: EventLog,
    queue: TaskQueue,
    enforcer: Arc<UsageEnforcer>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Full-state push to `node_id` ahead of its next cycle
    pub async fn force_resync(&self, node_id: NodeId) -> Result<()> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| not_found!("node {}", node_id))?;
        if node.state() == HealthState::Retired {
            return Err(api_error!("node {} is retired", node_id));
        }
        self.queue
            .request_sync(node_id, SyncMode::Full, SyncReason::Admin);
        Ok(())
    }

    /// Stop all work on `node_id` and mark it retired. Returns the state it
    /// left, `None` if it was already retired.
    pub async fn retire_node(&self, node_id: NodeId) -> Result<Option<HealthState>> {
        if self.store.get_node(node_id).await?.is_none() {
            return Err(not_found!("node {}", node_id));
        }
        self.queue.retire(node_id).await
    }

    pub async fn register_device(&self, subscriber: &SubscriberId, device: &str) -> Result<UsageUpdate> {
        if device.trim().is_empty() {
            return Err(api_error!("device id must not be empty"));
        }
        self.enforcer.register_device(subscriber, device).await
    }

    pub async fn unregister_device(&self, subscriber: &SubscriberId, device: &str) -> Result<UsageTotal> {
        self.enforcer.unregister_device(subscriber, device).await
    }

    pub async fn reset_usage(&self, subscriber: &SubscriberId) -> Result<UsageTotal> {
        self.enforcer.reset_usage(subscriber).await
    }

    pub async fn usage(&self, subscriber: &SubscriberId) -> Result<UsageTotal> {
        if let Some(usage) = self.store.get_usage(subscriber).await? {
            return Ok(usage);
        }
        match self.store.get_subscriber(subscriber).await? {
            Some(_) => Ok(UsageTotal::new(subscriber.clone())),
            None => Err(not_found!("subscriber {}", subscriber)),
        }
    }

    pub async fn fleet_status(&self) -> Result<Vec<NodeStatus>> {
        let nodes = self.store.list_nodes().await?;
        let observed = self.store.list_observed().await?;
        Ok(nodes
            .into_iter()
            .map(|node| {
                let pushed = observed.iter().find(|state| state.node == node.id);
                NodeStatus {
                    id: node.id,
                    name: node.name,
                    address: node.address,
                    capacity: node.capacity,
                    state: node.health.state,
                    state_since: node.health.since,
                    consecutive_failures: node.health.consecutive_failures,
                    last_ping_at: node.health.last_ping_at,
                    engine_version: node.health.engine_version,
                    last_sync_at: node.last_sync_at,
                    observed_revision: node.observed_revision,
                    inbounds: pushed.map_or(0, |state| state.inbounds.len()),
                    rejected: pushed.map_or(0, |state| state.rejected.len()),
                }
            })
            .collect())
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        self.events.recent(limit).await
    }

    /// Stop the scheduler and wait for it to exit
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_tx.send(true).is_err() {
            return Err(FleetError::Shutdown("scheduler already stopped".to_string()));
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                error!("Scheduler task ended abnormally: {}", err);
            }
        }
        info!("Engine stopped");
        Ok(())
    }
}
