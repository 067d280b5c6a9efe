#![allow(dead_code)]
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use fleetsync::collector::TrafficCollector;
use fleetsync::enforcer::UsageEnforcer;
use fleetsync::error::{NodeError, RejectedEntry};
use fleetsync::events::{Event, EventCategory, EventLog};
use fleetsync::health::NodeHealthMonitor;
use fleetsync::model::{
    HealthState, Inbound, Node, NodeId, ProtocolParams, SubscriberEntry, SubscriberId,
};
use fleetsync::node_client::{NodeClient, PingReport};
use fleetsync::scheduler::{SchedulerCommand, TaskQueue};
use fleetsync::settings::EngineSettings;
use fleetsync::store::{EventSink, MemoryStore, Store};
use fleetsync::sync::ConfigSynchronizer;

#[derive(Default)]
struct FakeNode {
    inbounds: BTreeMap<SubscriberId, ProtocolParams>,
    revision: u64,
    counters: HashMap<SubscriberId, u64>,
    unreachable: bool,
    reject: HashSet<SubscriberId>,
    pushes: usize,
}

/// In-process stand-in for the fleet's proxy engines
#[derive(Default)]
pub struct FakeNodeClient {
    nodes: Mutex<HashMap<NodeId, FakeNode>>,
}

impl FakeNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_node<T>(&self, node: NodeId, f: impl FnOnce(&mut FakeNode) -> T) -> T {
        let mut nodes = self.nodes.lock().unwrap();
        f(nodes.entry(node).or_default())
    }

    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        self.with_node(node, |n| n.unreachable = !reachable);
    }

    pub fn reject(&self, node: NodeId, subscriber: &str) {
        self.with_node(node, |n| n.reject.insert(subscriber.into()));
    }

    pub fn set_counter(&self, node: NodeId, subscriber: &str, counter: u64) {
        self.with_node(node, |n| n.counters.insert(subscriber.into(), counter));
    }

    /// Someone else changed the node's configuration behind our back
    pub fn tamper(&self, node: NodeId) {
        self.with_node(node, |n| {
            n.inbounds.clear();
            n.revision += 1;
        });
    }

    pub fn pushes(&self, node: NodeId) -> usize {
        self.with_node(node, |n| n.pushes)
    }

    pub fn revision(&self, node: NodeId) -> u64 {
        self.with_node(node, |n| n.revision)
    }

    pub fn inbounds(&self, node: NodeId) -> Vec<SubscriberId> {
        self.with_node(node, |n| n.inbounds.keys().cloned().collect())
    }

    pub fn has_inbound(&self, node: NodeId, subscriber: &str) -> bool {
        self.with_node(node, |n| n.inbounds.contains_key(&SubscriberId::from(subscriber)))
    }
}

#[async_trait]
impl NodeClient for FakeNodeClient {
    async fn push_config(
        &self,
        node: &Node,
        inbounds: &[Inbound],
        base_revision: Option<u64>,
    ) -> Result<u64, NodeError> {
        self.with_node(node.id, |fake| {
            if fake.unreachable {
                return Err(NodeError::Unreachable("connection refused".to_string()));
            }
            fake.pushes += 1;
            if let Some(expected) = base_revision {
                if expected != fake.revision {
                    return Err(NodeError::VersionMismatch {
                        expected: Some(expected),
                        actual: fake.revision,
                    });
                }
            }
            let mut rejected = Vec::new();
            let mut accepted = BTreeMap::new();
            for inbound in inbounds {
                if fake.reject.contains(&inbound.subscriber) {
                    rejected.push(RejectedEntry {
                        subscriber: inbound.subscriber.clone(),
                        reason: "invalid client id".to_string(),
                    });
                } else {
                    accepted.insert(inbound.subscriber.clone(), inbound.params.clone());
                }
            }
            if accepted != fake.inbounds {
                fake.inbounds = accepted;
                fake.revision += 1;
            }
            if rejected.is_empty() {
                Ok(fake.revision)
            } else {
                Err(NodeError::Rejected(rejected))
            }
        })
    }

    async fn fetch_counters(&self, node: &Node) -> Result<HashMap<SubscriberId, u64>, NodeError> {
        self.with_node(node.id, |fake| {
            if fake.unreachable {
                return Err(NodeError::Unreachable("connection refused".to_string()));
            }
            Ok(fake.counters.clone())
        })
    }

    async fn ping(&self, node: &Node) -> Result<PingReport, NodeError> {
        self.with_node(node.id, |fake| {
            if fake.unreachable {
                return Err(NodeError::Unreachable("connection refused".to_string()));
            }
            Ok(PingReport {
                version: "fake-engine 1.0".to_string(),
                revision: Some(fake.revision),
            })
        })
    }
}

pub fn params(credential: &str) -> ProtocolParams {
    ProtocolParams {
        protocol: "vless".to_string(),
        credential: credential.to_string(),
        ..Default::default()
    }
}

pub async fn add_node(store: &MemoryStore, id: u32, state: HealthState) -> Node {
    let mut node = Node::new(
        NodeId::new(id),
        &format!("edge-{}", id),
        Url::parse(&format!("http://10.0.0.{}:9090", id)).unwrap(),
        "node-secret",
        100,
    );
    node.health.state = state;
    store.register_node(node).await.unwrap()
}

pub async fn add_subscriber(
    store: &MemoryStore,
    id: &str,
    node: u32,
    quota_bytes: Option<u64>,
) -> SubscriberEntry {
    let mut entry = SubscriberEntry::new(id.into(), NodeId::new(node), params(id));
    entry.quota_bytes = quota_bytes;
    store.upsert_subscriber(entry).await.unwrap()
}

/// All components wired against one store and one fake fleet, without the
/// scheduler: out-of-band requests pile up in `requests`.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub fleet: Arc<FakeNodeClient>,
    pub events: EventLog,
    pub health: Arc<NodeHealthMonitor>,
    pub sync: Arc<ConfigSynchronizer>,
    pub enforcer: Arc<UsageEnforcer>,
    pub collector: Arc<TrafficCollector>,
    requests: mpsc::UnboundedReceiver<SchedulerCommand>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), EngineSettings::default())
    }

    pub fn with_store(store: Arc<MemoryStore>, settings: EngineSettings) -> Self {
        let fleet = Arc::new(FakeNodeClient::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let client: Arc<dyn NodeClient> = fleet.clone();
        let events = EventLog::new(dyn_store.clone());
        let (queue, requests) = TaskQueue::new();
        let health = Arc::new(NodeHealthMonitor::new(
            dyn_store.clone(),
            client.clone(),
            events.clone(),
            queue.clone(),
            settings.unreachable_after,
        ));
        let sync = Arc::new(ConfigSynchronizer::new(
            dyn_store.clone(),
            client.clone(),
            events.clone(),
            health.clone(),
            queue.clone(),
            settings.reassignment_grace,
            settings.sync_failure_threshold,
        ));
        let enforcer = Arc::new(UsageEnforcer::new(
            dyn_store.clone(),
            events.clone(),
            queue,
            settings.default_device_limit,
        ));
        let collector = Arc::new(TrafficCollector::new(dyn_store, client, enforcer.clone()));
        Self {
            store,
            fleet,
            events,
            health,
            sync,
            enforcer,
            collector,
            requests,
        }
    }

    /// Sync requests queued since the last call, as (node, mode, reason)
    pub fn take_requests(&mut self) -> Vec<SchedulerCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.requests.try_recv() {
            commands.push(command);
        }
        commands
    }

    pub async fn events_of(&self, category: EventCategory) -> Vec<Event> {
        self.store
            .recent_events(usize::MAX)
            .await
            .unwrap()
            .into_iter()
            .filter(|event| event.category == category)
            .collect()
    }

    pub async fn state_of(&self, node: u32) -> HealthState {
        use fleetsync::store::NodeRepository;
        self.store
            .get_node(NodeId::new(node))
            .await
            .unwrap()
            .unwrap()
            .state()
    }
}
