//! Usage accounting and limit enforcement.
//!
//! Every change to a subscriber's usage total goes through here and is
//! serialized per subscriber, so samples arriving from two nodes at once
//! cannot both pass the quota check.
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::events::{Event, EventCategory, EventLog, Outcome};
use crate::model::{
    check_limits, counter_delta, CounterDelta, LimitKind, SubscriberEntry, SubscriberId,
    TrafficSample, UsageTotal,
};
use crate::not_found;
use crate::scheduler::TaskQueue;
use crate::store::Store;
use crate::sync::{SyncMode, SyncReason};

/// What one usage write did
#[derive(Clone, Debug, PartialEq)]
pub struct UsageUpdate {
    pub usage: UsageTotal,
    pub bytes_added: u64,
    pub counter_reset: bool,
    /// Limit enforced by this write
    pub enforced: Option<LimitKind>,
}

struct Committed<T> {
    usage: UsageTotal,
    value: T,
    breach: Option<(SubscriberEntry, LimitKind)>,
    _guard: OwnedMutexGuard<()>,
}

pub struct UsageEnforcer {
    store: Arc<dyn Store>,
    events: EventLog,
    queue: TaskQueue,
    default_device_limit: u32,
    locks: DashMap<SubscriberId, Arc<Mutex<()>>>,
}

impl UsageEnforcer {
    pub fn new(
        store: Arc<dyn Store>,
        events: EventLog,
        queue: TaskQueue,
        default_device_limit: u32,
    ) -> Self {
        Self {
            store,
            events,
            queue,
            default_device_limit,
            locks: DashMap::new(),
        }
    }

    /// Account one counter reading. Readings for subscribers we do not know
    /// are dropped and give `None`.
    #[instrument(skip(self), level = "debug")]
    pub async fn record_sample(&self, sample: &TrafficSample) -> Result<Option<UsageUpdate>> {
        if self.store.get_subscriber(&sample.subscriber).await?.is_none() {
            debug!(
                "[{}] ignoring counter for unknown subscriber {}",
                sample.node, sample.subscriber
            );
            return Ok(None);
        }
        let node = sample.node;
        let counter = sample.counter;
        let committed = self
            .mutate(&sample.subscriber, |usage| {
                let delta = counter_delta(usage.counters.get(&node).copied(), counter);
                usage.bytes = usage.bytes.saturating_add(delta.bytes());
                usage.counters.insert(node, counter);
                delta
            })
            .await?;

        let delta = committed.value;
        if let CounterDelta::Reset { previous, .. } = delta {
            self.events
                .record(Event::subscriber(
                    EventCategory::CounterReset,
                    sample.subscriber.clone(),
                    Outcome::Info,
                    format!(
                        "node {}: counter fell from {} to {}",
                        node, previous, counter
                    ),
                ))
                .await;
        }
        let (usage, enforced) = self.settle(committed.usage, committed.breach).await?;
        Ok(Some(UsageUpdate {
            usage,
            bytes_added: delta.bytes(),
            counter_reset: matches!(delta, CounterDelta::Reset { .. }),
            enforced,
        }))
    }

    /// Device-registration feed: a device id seen for `subscriber`
    #[instrument(skip(self), level = "debug")]
    pub async fn register_device(&self, subscriber: &SubscriberId, device: &str) -> Result<UsageUpdate> {
        self.require_subscriber(subscriber).await?;
        let device = device.to_string();
        let committed = self
            .mutate(subscriber, |usage| {
                usage.devices.insert(device.clone());
            })
            .await?;
        let (usage, enforced) = self.settle(committed.usage, committed.breach).await?;
        Ok(UsageUpdate {
            usage,
            bytes_added: 0,
            counter_reset: false,
            enforced,
        })
    }

    /// Forget a device. Lowers the count but never re-enables anybody.
    #[instrument(skip(self), level = "debug")]
    pub async fn unregister_device(&self, subscriber: &SubscriberId, device: &str) -> Result<UsageTotal> {
        self.require_subscriber(subscriber).await?;
        let committed = self
            .mutate(subscriber, |usage| {
                usage.devices.remove(device);
            })
            .await?;
        let (usage, _) = self.settle(committed.usage, committed.breach).await?;
        Ok(usage)
    }

    /// Start a new quota period. The only operation that lowers accumulated
    /// bytes; counter checkpoints are kept so nothing is counted twice.
    #[instrument(skip(self), level = "debug")]
    pub async fn reset_usage(&self, subscriber: &SubscriberId) -> Result<UsageTotal> {
        self.require_subscriber(subscriber).await?;
        let committed = self
            .mutate(subscriber, |usage| {
                let previous = usage.bytes;
                usage.bytes = 0;
                usage.enforced = None;
                previous
            })
            .await?;
        self.events
            .record(Event::subscriber(
                EventCategory::UsageReset,
                subscriber.clone(),
                Outcome::Info,
                format!("{} bytes cleared", committed.value),
            ))
            .await;
        let (usage, _) = self.settle(committed.usage, committed.breach).await?;
        Ok(usage)
    }

    async fn require_subscriber(&self, subscriber: &SubscriberId) -> Result<SubscriberEntry> {
        self.store
            .get_subscriber(subscriber)
            .await?
            .ok_or_else(|| not_found!("subscriber {}", subscriber))
    }

    /// Apply `change` to the usage total under the subscriber's lock and
    /// check limits on the result. The lock stays held in the returned value
    /// until enforcement is settled.
    async fn mutate<T, F>(&self, subscriber: &SubscriberId, change: F) -> Result<Committed<T>>
    where
        F: Fn(&mut UsageTotal) -> T + Send,
        T: Send,
    {
        let lock = self.locks.entry(subscriber.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        let mut retried = false;
        loop {
            let entry = self.store.get_subscriber(subscriber).await?;
            let mut usage = self
                .store
                .get_usage(subscriber)
                .await?
                .unwrap_or_else(|| UsageTotal::new(subscriber.clone()));
            let value = change(&mut usage);
            usage.updated_at = Utc::now();

            // a disabled subscriber is already enforced or switched off by hand
            let breach = entry.filter(|entry| entry.enabled).and_then(|entry| {
                check_limits(&usage, &entry, self.default_device_limit).map(|kind| (entry, kind))
            });
            if let Some((_, kind)) = &breach {
                usage.enforced = Some(*kind);
            }

            match self.store.upsert_usage_total(&usage).await {
                Ok(saved) => {
                    return Ok(Committed {
                        usage: saved,
                        value,
                        breach,
                        _guard: guard,
                    })
                }
                Err(StoreError::Conflict(what)) if !retried => {
                    debug!("retrying usage write for {}: {}", subscriber, what);
                    retried = true;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn settle(
        &self,
        usage: UsageTotal,
        breach: Option<(SubscriberEntry, LimitKind)>,
    ) -> Result<(UsageTotal, Option<LimitKind>)> {
        match breach {
            Some((entry, kind)) => {
                let enforced = self.enforce(entry, kind, &usage).await?;
                Ok((usage, enforced.then_some(kind)))
            }
            None => Ok((usage, None)),
        }
    }

    /// Disable the subscriber, have its node drop the inbound and record the
    /// enforcement. Returns false when somebody else disabled it first.
    async fn enforce(&self, entry: SubscriberEntry, kind: LimitKind, usage: &UsageTotal) -> Result<bool> {
        let mut entry = entry;
        let mut retried = false;
        loop {
            match self
                .store
                .set_subscriber_enabled(&entry.subscriber, false, entry.version)
                .await
            {
                Ok(_) => break,
                Err(StoreError::Conflict(_)) if !retried => {
                    retried = true;
                    entry = match self.store.get_subscriber(&entry.subscriber).await? {
                        Some(fresh)
                            if fresh.enabled
                                && check_limits(usage, &fresh, self.default_device_limit)
                                    .is_some() =>
                        {
                            fresh
                        }
                        _ => return Ok(false),
                    };
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.queue
            .request_sync(entry.node, SyncMode::Incremental, SyncReason::Enforcement);

        let detail = match kind {
            LimitKind::Traffic => format!(
                "traffic: {} of {} bytes, disabled on node {}",
                usage.bytes,
                entry.quota_bytes.unwrap_or_default(),
                entry.node
            ),
            LimitKind::Devices => format!(
                "devices: {} of {}, disabled on node {}",
                usage.device_count(),
                entry.device_limit.unwrap_or(self.default_device_limit),
                entry.node
            ),
        };
        self.events
            .record(Event::subscriber(
                EventCategory::LimitReached,
                entry.subscriber.clone(),
                Outcome::Info,
                detail,
            ))
            .await;
        Ok(true)
    }
}
