//! Drives the per-node health, sync and collection cycles.
//!
//! When each node is next due for each kind of task lives in one
//! `ScheduleTable`. Out-of-band requests (forced resyncs, enforcement pushes,
//! retirement) arrive over a `TaskQueue` and pre-empt the table
//! deterministically. At most one cycle per (node, kind) runs at a time, and
//! a shared semaphore caps the cycles in flight across the fleet.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::collector::{CollectOutcome, TrafficCollector};
use crate::error::{FleetError, Result};
use crate::health::NodeHealthMonitor;
use crate::model::{HealthState, NodeId};
use crate::settings::EngineSettings;
use crate::store::Store;
use crate::sync::{ConfigSynchronizer, SyncMode, SyncOutcome, SyncReason};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    Health,
    Sync,
    Collect,
}

const TASK_KINDS: [TaskKind; 3] = [TaskKind::Health, TaskKind::Sync, TaskKind::Collect];

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Health => write!(f, "health"),
            TaskKind::Sync => write!(f, "sync"),
            TaskKind::Collect => write!(f, "collect"),
        }
    }
}

#[derive(Debug)]
pub enum SchedulerCommand {
    Sync {
        node: NodeId,
        mode: SyncMode,
        reason: SyncReason,
    },
    Retire {
        node: NodeId,
        resp_chan: oneshot::Sender<Result<Option<HealthState>>>,
    },
}

/// Sending half of the scheduler's command channel
#[derive(Clone, Debug)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl TaskQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SchedulerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Ask for a sync of `node` ahead of its next scheduled cycle
    pub fn request_sync(&self, node: NodeId, mode: SyncMode, reason: SyncReason) {
        let command = SchedulerCommand::Sync { node, mode, reason };
        if self.tx.send(command).is_err() {
            debug!("[{}] scheduler stopped, dropping {} sync request", node, reason);
        }
    }

    /// Retire `node`: stop scheduling it and cancel its running cycles.
    /// Returns the state it left.
    pub async fn retire(&self, node: NodeId) -> Result<Option<HealthState>> {
        let (resp_chan, response) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Retire { node, resp_chan })
            .map_err(|_| FleetError::Shutdown("scheduler is not running".to_string()))?;
        response
            .await
            .map_err(|_| FleetError::Shutdown("scheduler dropped the retire request".to_string()))?
    }
}

/// Retry delay after `failures` consecutive failed pushes: base * 2^(n-1), capped
pub fn backoff_delay(failures: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(cap).min(cap)
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Slot {
    next_run: Instant,
    running: bool,
    /// Mode requested out of band; `Full` wins over `Incremental`
    requested: Option<SyncMode>,
}

/// A task taken off the table to be run now
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Due {
    pub node: NodeId,
    pub kind: TaskKind,
    pub mode: SyncMode,
}

/// Next run time per (node, task kind)
#[derive(Debug)]
pub struct ScheduleTable {
    slots: BTreeMap<(NodeId, TaskKind), Slot>,
    health_interval: Duration,
    sync_interval: Duration,
    collect_interval: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl ScheduleTable {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            slots: BTreeMap::new(),
            health_interval: settings.health_interval,
            sync_interval: settings.sync_interval,
            collect_interval: settings.collect_interval,
            backoff_base: settings.sync_backoff_base,
            backoff_cap: settings.sync_backoff_cap,
        }
    }

    pub fn interval(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Health => self.health_interval,
            TaskKind::Sync => self.sync_interval,
            TaskKind::Collect => self.collect_interval,
        }
    }

    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.slots.keys().map(|(node, _)| *node).collect()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.slots.contains_key(&(node, TaskKind::Health))
    }

    /// Start scheduling `node`: ping and sync right away, collect after
    /// one collection interval
    pub fn ensure_node(&mut self, node: NodeId, now: Instant) {
        for kind in TASK_KINDS {
            let first = match kind {
                TaskKind::Collect => now + self.collect_interval,
                TaskKind::Health | TaskKind::Sync => now,
            };
            self.slots.entry((node, kind)).or_insert(Slot {
                next_run: first,
                running: false,
                requested: None,
            });
        }
    }

    pub fn remove_node(&mut self, node: NodeId) {
        self.slots.retain(|(slot_node, _), _| *slot_node != node);
    }

    /// Make `node`'s task due now. A running task is not interrupted; the
    /// request runs as soon as it completes.
    pub fn preempt(&mut self, node: NodeId, kind: TaskKind, mode: SyncMode, now: Instant) -> bool {
        let Some(slot) = self.slots.get_mut(&(node, kind)) else {
            return false;
        };
        slot.next_run = slot.next_run.min(now);
        slot.requested = match (slot.requested, mode) {
            (Some(SyncMode::Full), _) | (_, SyncMode::Full) => Some(SyncMode::Full),
            _ => Some(SyncMode::Incremental),
        };
        true
    }

    /// Mark every due, idle task as running and return them
    pub fn take_due(&mut self, now: Instant) -> Vec<Due> {
        let mut due = Vec::new();
        for ((node, kind), slot) in self.slots.iter_mut() {
            if slot.running || slot.next_run > now {
                continue;
            }
            slot.running = true;
            due.push(Due {
                node: *node,
                kind: *kind,
                mode: slot.requested.take().unwrap_or(SyncMode::Incremental),
            });
        }
        due
    }

    /// A task finished. `failures` is the consecutive failure count of a sync
    /// that should be retried with backoff.
    pub fn complete(&mut self, node: NodeId, kind: TaskKind, failures: Option<u32>, now: Instant) {
        let delay = match failures {
            Some(failures) => backoff_delay(failures, self.backoff_base, self.backoff_cap),
            None => self.interval(kind),
        };
        let Some(slot) = self.slots.get_mut(&(node, kind)) else {
            return;
        };
        slot.running = false;
        slot.next_run = if slot.requested.is_some() {
            now
        } else {
            now + delay
        };
    }

    /// Earliest time an idle task becomes due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| !slot.running)
            .map(|slot| slot.next_run)
            .min()
    }
}

/// The components a cycle runs against
#[derive(Clone)]
pub struct Services {
    pub health: Arc<NodeHealthMonitor>,
    pub sync: Arc<ConfigSynchronizer>,
    pub collector: Arc<TrafficCollector>,
}

struct Completion {
    node: NodeId,
    kind: TaskKind,
    failures: Option<u32>,
}

pub struct Scheduler {
    settings: EngineSettings,
    store: Arc<dyn Store>,
    services: Services,
    workers: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(settings: EngineSettings, store: Arc<dyn Store>, services: Services) -> Self {
        let workers = Arc::new(Semaphore::new(settings.max_in_flight));
        Self {
            settings,
            store,
            services,
            workers,
        }
    }

    /// Dispatch loop. Runs until `shutdown` flips, then aborts whatever is
    /// still in flight.
    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "Starting scheduler: health every {}s, sync every {}s, collect every {}s, {} workers",
            self.settings.health_interval.as_secs(),
            self.settings.sync_interval.as_secs(),
            self.settings.collect_interval.as_secs(),
            self.settings.max_in_flight
        );

        let mut table = ScheduleTable::new(&self.settings);
        let mut inflight: HashMap<(NodeId, TaskKind), JoinHandle<()>> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut refresh = time::interval(self.settings.health_interval);

        loop {
            for due in table.take_due(Instant::now()) {
                let budget = table.interval(due.kind);
                let handle = self.spawn_cycle(due, budget, done_tx.clone());
                inflight.insert((due.node, due.kind), handle);
            }
            let deadline = table
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + self.settings.health_interval);

            tokio::select! {
                _ = time::sleep_until(deadline) => {}
                Some(done) = done_rx.recv() => {
                    inflight.remove(&(done.node, done.kind));
                    table.complete(done.node, done.kind, done.failures, Instant::now());
                }
                Some(command) = commands.recv() => {
                    self.handle_command(command, &mut table, &mut inflight).await;
                }
                _ = refresh.tick() => {
                    self.refresh_nodes(&mut table).await;
                }
                _ = shutdown.changed() => {
                    info!("Scheduler shutting down, aborting {} cycles", inflight.len());
                    break;
                }
            }
        }

        for (_, handle) in inflight {
            handle.abort();
        }
    }

    fn spawn_cycle(
        &self,
        due: Due,
        budget: Duration,
        done_tx: mpsc::UnboundedSender<Completion>,
    ) -> JoinHandle<()> {
        let services = self.services.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            // a cycle never overlaps the next one of the same kind
            let failures = match time::timeout(budget, run_cycle(&services, due)).await {
                Ok(failures) => failures,
                Err(_) => {
                    warn!(
                        "[{}] {} cycle exceeded {}s and was cancelled",
                        due.node,
                        due.kind,
                        budget.as_secs()
                    );
                    None
                }
            };
            let _ = done_tx.send(Completion {
                node: due.node,
                kind: due.kind,
                failures,
            });
        })
    }

    async fn handle_command(
        &self,
        command: SchedulerCommand,
        table: &mut ScheduleTable,
        inflight: &mut HashMap<(NodeId, TaskKind), JoinHandle<()>>,
    ) {
        match command {
            SchedulerCommand::Sync { node, mode, reason } => {
                if !table.contains(node) {
                    // registered since the last refresh
                    match self.store.get_node(node).await {
                        Ok(Some(record)) if record.state() != HealthState::Retired => {
                            table.ensure_node(node, Instant::now());
                        }
                        Ok(_) => {
                            debug!("[{}] ignoring {} sync for unscheduled node", node, reason);
                            return;
                        }
                        Err(err) => {
                            warn!("[{}] could not look up node: {}", node, err);
                            return;
                        }
                    }
                }
                debug!("[{}] {:?} sync requested ({})", node, mode, reason);
                table.preempt(node, TaskKind::Sync, mode, Instant::now());
            }
            SchedulerCommand::Retire { node, resp_chan } => {
                table.remove_node(node);
                let mut handles: Vec<JoinHandle<()>> = TASK_KINDS
                    .iter()
                    .filter_map(|kind| inflight.remove(&(node, *kind)))
                    .collect();
                let health = self.services.health.clone();
                let grace = self.settings.shutdown_grace;
                tokio::spawn(async move {
                    let result = health.retire(node).await;
                    let drained = time::timeout(grace, async {
                        for handle in handles.iter_mut() {
                            let _ = handle.await;
                        }
                    })
                    .await
                    .is_ok();
                    if !drained {
                        warn!(
                            "[{}] running cycles exceeded the {}s grace period, aborting",
                            node,
                            grace.as_secs()
                        );
                        for handle in &handles {
                            handle.abort();
                        }
                    }
                    if resp_chan.send(result).is_err() {
                        error!("[{}] Failed sending retire response", node);
                    }
                });
            }
        }
    }

    /// Pick up registered nodes and drop retired or deleted ones
    async fn refresh_nodes(&self, table: &mut ScheduleTable) {
        let nodes = match self.store.list_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!("Could not refresh node list: {}", err);
                return;
            }
        };
        let live: BTreeSet<NodeId> = nodes
            .iter()
            .filter(|node| node.state() != HealthState::Retired)
            .map(|node| node.id)
            .collect();
        for node in table.nodes() {
            if !live.contains(&node) {
                debug!("[{}] no longer scheduled", node);
                table.remove_node(node);
            }
        }
        let now = Instant::now();
        for node in live {
            table.ensure_node(node, now);
        }
    }
}

/// Failure count to back off with. Only a node that could not be reached
/// is retried early; a refused push waits for the regular interval, and a
/// suspended node belongs to the health monitor.
fn backoff_failures(outcome: &SyncOutcome) -> Option<u32> {
    match outcome {
        SyncOutcome::Failed {
            error,
            consecutive_failures,
            suspended: false,
        } if error.is_transient() => Some(*consecutive_failures),
        _ => None,
    }
}

/// Run one cycle. Returns the failure count when a sync should back off.
async fn run_cycle(services: &Services, due: Due) -> Option<u32> {
    match due.kind {
        TaskKind::Health => {
            if let Err(err) = services.health.poll_node(due.node).await {
                warn!("[{}] health check failed: {}", due.node, err);
            }
            None
        }
        TaskKind::Sync => match services.sync.sync_node(due.node, due.mode).await {
            Ok(outcome) => backoff_failures(&outcome),
            Err(err) => {
                warn!("[{}] sync cycle failed: {}", due.node, err);
                None
            }
        },
        TaskKind::Collect => {
            match services.collector.collect_node(due.node).await {
                Ok(CollectOutcome::Collected(report)) if report.failures > 0 => {
                    warn!(
                        "[{}] {} samples left for the next poll",
                        due.node, report.failures
                    );
                }
                Ok(_) => {}
                Err(err) => warn!("[{}] traffic collection failed: {}", due.node, err),
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;

    fn table() -> ScheduleTable {
        ScheduleTable::new(&EngineSettings::default())
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, base, cap), Duration::from_secs(32));
        assert_eq!(backoff_delay(9, base, cap), Duration::from_secs(300));
        assert_eq!(backoff_delay(64, base, cap), Duration::from_secs(300));
    }

    #[test]
    fn test_only_unreachable_pushes_back_off() {
        let failed = |error, suspended| SyncOutcome::Failed {
            error,
            consecutive_failures: 2,
            suspended,
        };
        assert_eq!(
            backoff_failures(&failed(NodeError::Unreachable("refused".into()), false)),
            Some(2)
        );
        assert_eq!(
            backoff_failures(&failed(NodeError::Timeout(Duration::from_secs(5)), false)),
            Some(2)
        );
        assert_eq!(
            backoff_failures(&failed(NodeError::Unreachable("refused".into()), true)),
            None
        );
        let mismatch = NodeError::VersionMismatch {
            expected: Some(3),
            actual: 9,
        };
        assert_eq!(backoff_failures(&failed(mismatch, false)), None);
        assert_eq!(backoff_failures(&SyncOutcome::Unchanged), None);
    }

    #[tokio::test]
    async fn test_new_node_pings_and_syncs_first() {
        let now = Instant::now();
        let mut table = table();
        table.ensure_node(NodeId::new(1), now);

        let due = table.take_due(now);
        let kinds: Vec<TaskKind> = due.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![TaskKind::Health, TaskKind::Sync]);
        // already running, nothing else due
        assert!(table.take_due(now).is_empty());
        assert_eq!(
            table.next_deadline(),
            Some(now + Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn test_running_task_is_never_taken_twice() {
        let now = Instant::now();
        let mut table = table();
        let node = NodeId::new(1);
        table.ensure_node(node, now);
        table.take_due(now);

        // forced resync while the cycle runs waits for completion
        assert!(table.preempt(node, TaskKind::Sync, SyncMode::Full, now));
        assert!(table.take_due(now).is_empty());

        table.complete(node, TaskKind::Sync, None, now);
        let due = table.take_due(now);
        assert_eq!(
            due,
            vec![Due {
                node,
                kind: TaskKind::Sync,
                mode: SyncMode::Full
            }]
        );
    }

    #[tokio::test]
    async fn test_full_request_wins_over_incremental() {
        let now = Instant::now();
        let mut table = table();
        let node = NodeId::new(2);
        table.ensure_node(node, now);
        for due in table.take_due(now) {
            table.complete(due.node, due.kind, None, now);
        }
        table.preempt(node, TaskKind::Sync, SyncMode::Full, now);
        table.preempt(node, TaskKind::Sync, SyncMode::Incremental, now);
        let due = table.take_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].mode, SyncMode::Full);
    }

    #[tokio::test]
    async fn test_failed_sync_backs_off() {
        let now = Instant::now();
        let mut table = table();
        let node = NodeId::new(3);
        table.ensure_node(node, now);
        table.take_due(now);
        table.complete(node, TaskKind::Health, None, now);
        table.complete(node, TaskKind::Sync, Some(3), now);

        // 2s * 2^2
        assert!(table.take_due(now + Duration::from_secs(7)).is_empty());
        let due = table.take_due(now + Duration::from_secs(8));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, TaskKind::Sync);
    }

    #[tokio::test]
    async fn test_removed_node_is_forgotten() {
        let now = Instant::now();
        let mut table = table();
        table.ensure_node(NodeId::new(1), now);
        table.ensure_node(NodeId::new(2), now);
        table.remove_node(NodeId::new(1));
        assert_eq!(table.nodes().into_iter().collect::<Vec<_>>(), vec![NodeId::new(2)]);
        assert!(!table.preempt(NodeId::new(1), TaskKind::Sync, SyncMode::Full, now));
        // completion of an aborted task for a removed node is ignored
        table.complete(NodeId::new(1), TaskKind::Sync, None, now);
        assert!(!table.contains(NodeId::new(1)));
    }

    #[tokio::test]
    async fn test_queue_delivers_requests() {
        let (queue, mut rx) = TaskQueue::new();
        queue.request_sync(NodeId::new(4), SyncMode::Incremental, SyncReason::Enforcement);
        match rx.recv().await {
            Some(SchedulerCommand::Sync { node, mode, reason }) => {
                assert_eq!(node, NodeId::new(4));
                assert_eq!(mode, SyncMode::Incremental);
                assert_eq!(reason, SyncReason::Enforcement);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
