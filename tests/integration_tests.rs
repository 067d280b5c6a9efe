mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{add_node, add_subscriber, FakeNodeClient, Harness};
use fleetsync::collector::{CollectOutcome, CollectReport};
use fleetsync::engine::Engine;
use fleetsync::events::{EventCategory, Subject};
use fleetsync::health::Transition;
use fleetsync::model::{HealthState, LimitKind, NodeId, SubscriberId, TrafficSample};
use fleetsync::scheduler::SchedulerCommand;
use fleetsync::settings::EngineSettings;
use fleetsync::store::{
    MemoryStore, NodeRepository, SubscriptionRepository, SyncStateRepository, UsageRepository,
};
use fleetsync::sync::{SyncMode, SyncOutcome, SyncReason};

fn sync_requests(commands: Vec<SchedulerCommand>) -> Vec<(NodeId, SyncMode, SyncReason)> {
    commands
        .into_iter()
        .filter_map(|command| match command {
            SchedulerCommand::Sync { node, mode, reason } => Some((node, mode, reason)),
            SchedulerCommand::Retire { .. } => None,
        })
        .collect()
}

#[tokio::test]
async fn test_quota_crossed_by_second_sample_disables_subscriber() {
    let mut h = Harness::new();
    let node = NodeId::new(1);
    add_node(&h.store, 1, HealthState::Healthy).await;
    add_subscriber(&h.store, "s1", 1, Some(1_000_000)).await;

    let outcome = h.sync.sync_node(node, SyncMode::Incremental).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Pushed { inbounds: 1, .. }));
    assert!(h.fleet.has_inbound(node, "s1"));

    h.fleet.set_counter(node, "s1", 400_000);
    h.collector.collect_node(node).await.unwrap();
    let usage = h.store.get_usage(&"s1".into()).await.unwrap().unwrap();
    assert_eq!(usage.bytes, 400_000);
    assert!(h.take_requests().is_empty());

    h.fleet.set_counter(node, "s1", 1_100_000);
    let outcome = h.collector.collect_node(node).await.unwrap();
    assert_eq!(
        outcome,
        CollectOutcome::Collected(CollectReport {
            samples: 1,
            bytes: 700_000,
            resets: 0,
            enforced: 1,
            unknown: 0,
            failures: 0,
        })
    );

    let usage = h.store.get_usage(&"s1".into()).await.unwrap().unwrap();
    assert_eq!(usage.bytes, 1_100_000);
    assert_eq!(usage.enforced, Some(LimitKind::Traffic));
    let entry = h.store.get_subscriber(&"s1".into()).await.unwrap().unwrap();
    assert!(!entry.enabled);

    let limit_events = h.events_of(EventCategory::LimitReached).await;
    assert_eq!(limit_events.len(), 1);
    assert!(limit_events[0].detail.starts_with("traffic"));
    assert_eq!(
        sync_requests(h.take_requests()),
        vec![(node, SyncMode::Incremental, SyncReason::Enforcement)]
    );

    // the out-of-band push removes the inbound
    let outcome = h.sync.sync_node(node, SyncMode::Incremental).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Pushed { inbounds: 0, .. }));
    assert!(!h.fleet.has_inbound(node, "s1"));

    // more traffic is still counted but never enforced twice
    h.fleet.set_counter(node, "s1", 1_300_000);
    h.collector.collect_node(node).await.unwrap();
    assert_eq!(h.events_of(EventCategory::LimitReached).await.len(), 1);
    assert!(h.take_requests().is_empty());
    let usage = h.store.get_usage(&"s1".into()).await.unwrap().unwrap();
    assert_eq!(usage.bytes, 1_300_000);
}

#[tokio::test]
async fn test_three_failed_pings_then_recovery_requests_full_resync() {
    let mut h = Harness::new();
    let node = NodeId::new(1);
    add_node(&h.store, 1, HealthState::Healthy).await;

    h.fleet.set_reachable(node, false);
    for expected in [
        HealthState::Degraded,
        HealthState::Degraded,
        HealthState::Unreachable,
    ] {
        h.health.poll_node(node).await.unwrap();
        assert_eq!(h.state_of(1).await, expected);
    }
    assert_eq!(h.events_of(EventCategory::HealthTransition).await.len(), 2);
    assert!(h.take_requests().is_empty());

    h.fleet.set_reachable(node, true);
    let transition = h.health.poll_node(node).await.unwrap();
    assert_eq!(
        transition,
        Some(Transition {
            from: HealthState::Unreachable,
            to: HealthState::Healthy
        })
    );
    assert_eq!(
        sync_requests(h.take_requests()),
        vec![(node, SyncMode::Full, SyncReason::Recovered)]
    );
    assert_eq!(h.events_of(EventCategory::HealthTransition).await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_engine_suspends_silent_node_and_resyncs_on_recovery() {
    let store = Arc::new(MemoryStore::new());
    let fleet = Arc::new(FakeNodeClient::new());
    let node = NodeId::new(1);
    add_node(&store, 1, HealthState::Healthy).await;
    add_subscriber(&store, "s1", 1, None).await;

    let engine = Engine::start(EngineSettings::default(), store.clone(), fleet.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fleet.pushes(node), 1);
    assert!(fleet.has_inbound(node, "s1"));

    // pings at 30s, 60s and 90s fail
    fleet.set_reachable(node, false);
    tokio::time::sleep(Duration::from_secs(95)).await;
    let state = store.get_node(node).await.unwrap().unwrap().state();
    assert_eq!(state, HealthState::Unreachable);

    fleet.set_reachable(node, true);
    tokio::time::sleep(Duration::from_secs(31)).await;
    let state = store.get_node(node).await.unwrap().unwrap().state();
    assert_eq!(state, HealthState::Healthy);
    // recovery pushed the full state once more
    assert_eq!(fleet.pushes(node), 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_counter_reset_is_not_a_negative_delta() {
    let h = Harness::new();
    let node = NodeId::new(1);
    add_node(&h.store, 1, HealthState::Healthy).await;
    add_subscriber(&h.store, "s1", 1, None).await;

    h.fleet.set_counter(node, "s1", 5_000_000);
    h.collector.collect_node(node).await.unwrap();

    // node restarted
    h.fleet.set_counter(node, "s1", 0);
    let outcome = h.collector.collect_node(node).await.unwrap();
    match outcome {
        CollectOutcome::Collected(report) => {
            assert_eq!(report.resets, 1);
            assert_eq!(report.bytes, 0);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let usage = h.store.get_usage(&"s1".into()).await.unwrap().unwrap();
    assert_eq!(usage.bytes, 5_000_000);
    assert_eq!(h.events_of(EventCategory::CounterReset).await.len(), 1);

    h.fleet.set_counter(node, "s1", 1_200);
    h.collector.collect_node(node).await.unwrap();
    let usage = h.store.get_usage(&"s1".into()).await.unwrap().unwrap();
    assert_eq!(usage.bytes, 5_001_200);
    assert_eq!(h.events_of(EventCategory::CounterReset).await.len(), 1);
}

#[tokio::test]
async fn test_counters_for_unknown_subscribers_are_ignored() {
    let h = Harness::new();
    let node = NodeId::new(1);
    add_node(&h.store, 1, HealthState::Healthy).await;
    add_subscriber(&h.store, "s1", 1, None).await;

    h.fleet.set_counter(node, "s1", 2_000);
    h.fleet.set_counter(node, "stranger", 9_000);
    let outcome = h.collector.collect_node(node).await.unwrap();
    match outcome {
        CollectOutcome::Collected(report) => {
            assert_eq!(report.samples, 1);
            assert_eq!(report.unknown, 1);
            assert_eq!(report.failures, 0);
            assert_eq!(report.bytes, 2_000);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(h.store.get_usage(&"stranger".into()).await.unwrap().is_none());

    let sample = TrafficSample {
        subscriber: "stranger".into(),
        node,
        counter: 10_000,
        observed_at: Utc::now(),
    };
    assert!(h.enforcer.record_sample(&sample).await.unwrap().is_none());
    assert!(h.store.get_usage(&"stranger".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_one_rejected_entry_among_ten() {
    let h = Harness::new();
    let node = NodeId::new(1);
    add_node(&h.store, 1, HealthState::Healthy).await;
    for i in 0..10 {
        add_subscriber(&h.store, &format!("s{}", i), 1, None).await;
    }
    h.fleet.reject(node, "s4");

    let outcome = h.sync.sync_node(node, SyncMode::Incremental).await.unwrap();
    assert!(matches!(
        outcome,
        SyncOutcome::Pushed {
            inbounds: 9,
            rejected: 1,
            ..
        }
    ));
    assert_eq!(h.fleet.inbounds(node).len(), 9);
    assert!(!h.fleet.has_inbound(node, "s4"));

    let observed = h.store.load_observed(node).await.unwrap();
    assert_eq!(observed.inbounds.len(), 9);
    assert!(observed.rejected.contains_key(&SubscriberId::from("s4")));

    let rejected = h.events_of(EventCategory::SyncEntryRejected).await;
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].subject, Subject::Subscriber("s4".into()));
    assert_eq!(h.fleet.pushes(node), 2);

    // not retried
    let outcome = h.sync.sync_node(node, SyncMode::Incremental).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Unchanged);
    assert_eq!(h.fleet.pushes(node), 2);
}

#[tokio::test]
async fn test_second_sync_without_changes_makes_no_rpc() {
    let h = Harness::new();
    let node = NodeId::new(1);
    add_node(&h.store, 1, HealthState::Healthy).await;
    add_subscriber(&h.store, "s1", 1, None).await;
    add_subscriber(&h.store, "s2", 1, None).await;

    let first = h.sync.sync_node(node, SyncMode::Incremental).await.unwrap();
    let second = h.sync.sync_node(node, SyncMode::Incremental).await.unwrap();
    assert!(matches!(first, SyncOutcome::Pushed { inbounds: 2, .. }));
    assert_eq!(second, SyncOutcome::Unchanged);
    assert_eq!(h.fleet.pushes(node), 1);
    assert_eq!(h.events_of(EventCategory::SyncSuccess).await.len(), 1);

    // observed equals desired right after the push
    let observed = h.store.load_observed(node).await.unwrap();
    let keys: Vec<&str> = observed.inbounds.keys().map(|s| s.as_str()).collect();
    assert_eq!(keys, vec!["s1", "s2"]);
    assert_eq!(observed.revision, Some(h.fleet.revision(node)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_samples_from_two_nodes_enforce_exactly_once() {
    let mut h = Harness::new();
    add_node(&h.store, 1, HealthState::Healthy).await;
    add_node(&h.store, 2, HealthState::Healthy).await;
    add_subscriber(&h.store, "s1", 1, Some(1_000)).await;

    let mut tasks = Vec::new();
    for node in [1u32, 2] {
        let enforcer = h.enforcer.clone();
        tasks.push(tokio::spawn(async move {
            let mut enforced = 0;
            for step in 1..=50u64 {
                let sample = TrafficSample {
                    subscriber: "s1".into(),
                    node: NodeId::new(node),
                    counter: step * 100,
                    observed_at: Utc::now(),
                };
                let update = enforcer.record_sample(&sample).await.unwrap().unwrap();
                if update.enforced.is_some() {
                    enforced += 1;
                }
            }
            enforced
        }));
    }
    let mut enforced = 0;
    for task in tasks {
        enforced += task.await.unwrap();
    }

    assert_eq!(enforced, 1);
    assert_eq!(h.events_of(EventCategory::LimitReached).await.len(), 1);
    assert_eq!(sync_requests(h.take_requests()).len(), 1);
    let usage = h.store.get_usage(&"s1".into()).await.unwrap().unwrap();
    assert_eq!(usage.bytes, 10_000);
    assert!(!h.store.get_subscriber(&"s1".into()).await.unwrap().unwrap().enabled);
}

#[tokio::test]
async fn test_reassignment_removes_before_adding() {
    let mut h = Harness::new();
    let (old, new) = (NodeId::new(1), NodeId::new(2));
    add_node(&h.store, 1, HealthState::Healthy).await;
    add_node(&h.store, 2, HealthState::Healthy).await;
    add_subscriber(&h.store, "s1", 1, None).await;
    h.sync.sync_node(old, SyncMode::Incremental).await.unwrap();
    assert!(h.fleet.has_inbound(old, "s1"));

    let mut entry = h.store.get_subscriber(&"s1".into()).await.unwrap().unwrap();
    entry.node = new;
    h.store.upsert_subscriber(entry).await.unwrap();

    // still live on the old node: held back
    h.sync.sync_node(new, SyncMode::Incremental).await.unwrap();
    assert!(!h.fleet.has_inbound(new, "s1"));
    h.take_requests();

    h.sync.sync_node(old, SyncMode::Incremental).await.unwrap();
    assert!(!h.fleet.has_inbound(old, "s1"));
    assert_eq!(
        sync_requests(h.take_requests()),
        vec![(new, SyncMode::Incremental, SyncReason::Handoff)]
    );

    h.sync.sync_node(new, SyncMode::Incremental).await.unwrap();
    assert!(h.fleet.has_inbound(new, "s1"));
}

#[tokio::test]
async fn test_retired_node_releases_subscribers_immediately() {
    let h = Harness::new();
    let (old, new) = (NodeId::new(1), NodeId::new(2));
    add_node(&h.store, 1, HealthState::Healthy).await;
    add_node(&h.store, 2, HealthState::Healthy).await;
    add_subscriber(&h.store, "s1", 1, None).await;
    h.sync.sync_node(old, SyncMode::Incremental).await.unwrap();

    assert_eq!(h.health.retire(old).await.unwrap(), Some(HealthState::Healthy));
    assert_eq!(h.health.retire(old).await.unwrap(), None);
    assert_eq!(h.events_of(EventCategory::NodeRetired).await.len(), 1);

    let mut entry = h.store.get_subscriber(&"s1".into()).await.unwrap().unwrap();
    entry.node = new;
    h.store.upsert_subscriber(entry).await.unwrap();

    h.sync.sync_node(new, SyncMode::Incremental).await.unwrap();
    assert!(h.fleet.has_inbound(new, "s1"));
    assert_eq!(
        h.sync.sync_node(old, SyncMode::Incremental).await.unwrap(),
        SyncOutcome::Skipped(HealthState::Retired)
    );
    // no pings against a retired node either
    assert_eq!(h.health.poll_node(old).await.unwrap(), None);
}

#[tokio::test]
async fn test_version_mismatch_forces_full_push() {
    let h = Harness::new();
    let node = NodeId::new(1);
    add_node(&h.store, 1, HealthState::Healthy).await;
    add_subscriber(&h.store, "s1", 1, None).await;
    h.sync.sync_node(node, SyncMode::Incremental).await.unwrap();

    h.fleet.tamper(node);
    add_subscriber(&h.store, "s2", 1, None).await;

    let outcome = h.sync.sync_node(node, SyncMode::Incremental).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Pushed { inbounds: 2, .. }));
    assert!(h.fleet.has_inbound(node, "s1"));
    assert!(h.fleet.has_inbound(node, "s2"));
    assert_eq!(h.events_of(EventCategory::SyncVersionMismatch).await.len(), 1);

    let record = h.store.get_node(node).await.unwrap().unwrap();
    assert_eq!(record.observed_revision, Some(h.fleet.revision(node)));
}

#[tokio::test]
async fn test_push_failure_streak_suspends_node() {
    let h = Harness::new();
    let node = NodeId::new(1);
    add_node(&h.store, 1, HealthState::Healthy).await;
    add_subscriber(&h.store, "s1", 1, None).await;
    h.fleet.set_reachable(node, false);

    for attempt in 1..=5u32 {
        match h.sync.sync_node(node, SyncMode::Incremental).await.unwrap() {
            SyncOutcome::Failed {
                consecutive_failures,
                suspended,
                ..
            } => {
                assert_eq!(consecutive_failures, attempt);
                assert_eq!(suspended, attempt == 5);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(h.state_of(1).await, HealthState::Unreachable);
    assert_eq!(h.events_of(EventCategory::SyncFailed).await.len(), 1);
    assert_eq!(h.events_of(EventCategory::HealthTransition).await.len(), 1);
    // nothing was recorded as pushed
    assert_eq!(h.store.load_observed(node).await.unwrap().revision, None);

    assert_eq!(
        h.sync.sync_node(node, SyncMode::Incremental).await.unwrap(),
        SyncOutcome::Skipped(HealthState::Unreachable)
    );
}

#[tokio::test]
async fn test_device_limit_and_usage_reset() {
    let h = Harness::new();
    add_node(&h.store, 1, HealthState::Healthy).await;
    let mut entry = add_subscriber(&h.store, "s1", 1, None).await;
    entry.device_limit = Some(2);
    h.store.upsert_subscriber(entry).await.unwrap();
    let s1 = SubscriberId::from("s1");

    assert_eq!(h.enforcer.register_device(&s1, "phone").await.unwrap().enforced, None);
    let again = h.enforcer.register_device(&s1, "phone").await.unwrap();
    assert_eq!(again.usage.device_count(), 1);
    assert_eq!(h.enforcer.register_device(&s1, "laptop").await.unwrap().enforced, None);

    let third = h.enforcer.register_device(&s1, "tablet").await.unwrap();
    assert_eq!(third.enforced, Some(LimitKind::Devices));
    assert!(!h.store.get_subscriber(&s1).await.unwrap().unwrap().enabled);
    let events = h.events_of(EventCategory::LimitReached).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].detail.starts_with("devices"));

    let usage = h.enforcer.reset_usage(&s1).await.unwrap();
    assert_eq!(usage.bytes, 0);
    assert_eq!(usage.enforced, None);
    // re-enabling is never automatic
    assert!(!h.store.get_subscriber(&s1).await.unwrap().unwrap().enabled);
    assert_eq!(h.events_of(EventCategory::UsageReset).await.len(), 1);

    let usage = h.enforcer.unregister_device(&s1, "tablet").await.unwrap();
    assert_eq!(usage.device_count(), 2);

    assert!(h
        .enforcer
        .register_device(&"nobody".into(), "phone")
        .await
        .is_err());
}

#[tokio::test]
async fn test_sync_progress_and_counters_survive_restart() {
    let path = std::env::temp_dir().join(format!(
        "fleetsync-restart-test-{}.json",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let node = NodeId::new(1);

    {
        let store = Arc::new(MemoryStore::open(&path).await.unwrap());
        let h = Harness::with_store(store, EngineSettings::default());
        add_node(&h.store, 1, HealthState::Healthy).await;
        add_subscriber(&h.store, "s1", 1, None).await;
        h.sync.sync_node(node, SyncMode::Incremental).await.unwrap();
        h.fleet.set_counter(node, "s1", 4_096);
        h.collector.collect_node(node).await.unwrap();
    }

    let store = Arc::new(MemoryStore::open(&path).await.unwrap());
    let h = Harness::with_store(store, EngineSettings::default());
    assert_eq!(
        h.sync.sync_node(node, SyncMode::Incremental).await.unwrap(),
        SyncOutcome::Unchanged
    );
    // the same reading replayed after the restart adds nothing
    h.fleet.set_counter(node, "s1", 4_096);
    h.collector.collect_node(node).await.unwrap();
    let usage = h.store.get_usage(&"s1".into()).await.unwrap().unwrap();
    assert_eq!(usage.bytes, 4_096);

    let _ = std::fs::remove_file(&path);
}
