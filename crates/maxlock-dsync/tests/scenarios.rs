use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use maxlock_common::time;
use maxlock_dsync::{
    ChannelSink, CoordinatorConfig, LockCoordinator, MaxlockError, MemoryNode, NodeError, NodeId,
    RetryPolicy, ScriptKind,
};

fn quick_policy(retry_count: u32) -> RetryPolicy {
    RetryPolicy {
        retry_count,
        retry_delay: Duration::from_millis(5),
        retry_jitter: Duration::from_millis(2),
        attempt_timeout: Duration::from_millis(100),
    }
}

fn coordinator(nodes: &[Arc<MemoryNode>]) -> LockCoordinator {
    let config = CoordinatorConfig {
        retry: quick_policy(3),
        ..CoordinatorConfig::default()
    };
    LockCoordinator::new(MemoryNode::shared(nodes), config).unwrap()
}

fn resources(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn combinations(size: usize, choose: usize) -> Vec<Vec<usize>> {
    fn walk(
        start: usize,
        size: usize,
        choose: usize,
        current: &mut Vec<usize>,
        out: &mut Vec<Vec<usize>>,
    ) {
        if current.len() == choose {
            out.push(current.clone());
            return;
        }
        for index in start..size {
            current.push(index);
            walk(index + 1, size, choose, current, out);
            current.pop();
        }
    }

    let mut out = Vec::new();
    walk(0, size, choose, &mut Vec::new(), &mut out);
    out
}

#[tokio::test]
async fn healthy_cluster_expiration_is_drift_compensated() {
    let nodes = MemoryNode::cluster(3);
    let coordinator = coordinator(&nodes);

    let before = time::now();
    let lock = coordinator
        .acquire(&resources(&["r1"]), Duration::from_millis(1000), None)
        .await
        .unwrap();
    let after = time::now();

    let nominal = lock.expiration() + TimeDelta::milliseconds(12);
    assert!(nominal >= before + TimeDelta::milliseconds(1000));
    assert!(nominal <= after + TimeDelta::milliseconds(1000));
    assert!(lock.expiration() < after + TimeDelta::milliseconds(1000));
    assert!(!lock.is_expired());

    assert!(
        eventually(|| nodes
            .iter()
            .all(|node| node.value("r1").as_deref() == Some(lock.token().as_str())))
        .await
    );
}

#[tokio::test]
async fn zero_drift_factor_still_subtracts_constant() {
    let nodes = MemoryNode::cluster(3);
    let config = CoordinatorConfig {
        drift_factor: 0.0,
        retry: quick_policy(0),
        ..CoordinatorConfig::default()
    };
    let coordinator = LockCoordinator::new(MemoryNode::shared(&nodes), config).unwrap();

    let lock = coordinator
        .acquire(&resources(&["r1"]), Duration::from_millis(500), None)
        .await
        .unwrap();
    let after = time::now();

    assert!(lock.expiration() <= after + TimeDelta::milliseconds(498));
}

#[tokio::test]
async fn minority_unreachable_still_acquires() {
    let nodes = MemoryNode::cluster(3);
    nodes[2].set_unreachable(true);
    let coordinator = coordinator(&nodes);

    let lock = coordinator
        .acquire(&resources(&["r1"]), Duration::from_secs(5), None)
        .await
        .unwrap();

    assert_eq!(lock.attempts().len(), 1);
    assert!(lock.attempts()[0].votes_for.len() >= 2);
    assert_eq!(nodes[2].value("r1"), None);
}

#[tokio::test]
async fn majority_unreachable_exhausts_retries_and_cleans_up() {
    let nodes = MemoryNode::cluster(3);
    nodes[1].set_unreachable(true);
    nodes[2].set_unreachable(true);
    let coordinator = coordinator(&nodes);

    let result = coordinator
        .acquire(&resources(&["r1"]), Duration::from_secs(5), Some(&quick_policy(2)))
        .await;

    match result {
        Err(MaxlockError::QuorumUnreachable { attempts }) => {
            assert_eq!(attempts.len(), 3);
            for stats in &attempts {
                assert!(stats.votes_against.len() >= 2);
                assert!(stats.votes_for.is_disjoint(
                    &stats.votes_against.keys().cloned().collect()
                ));
            }
        }
        other => panic!("expected quorum failure, got {other:?}"),
    }

    let reachable = Arc::clone(&nodes[0]);
    assert!(eventually(|| reachable.calls(ScriptKind::Release) >= 1).await);
    assert!(eventually(|| reachable.value("r1").is_none()).await);
}

#[tokio::test]
async fn contended_multi_key_acquire_fails_entirely() {
    let nodes = MemoryNode::cluster(3);
    let coordinator = coordinator(&nodes);

    let held = coordinator
        .acquire(&resources(&["r1", "r2"]), Duration::from_secs(5), None)
        .await
        .unwrap();

    let second = coordinator
        .acquire(&resources(&["r1", "r2"]), Duration::from_secs(5), Some(&quick_policy(1)))
        .await;
    let err = second.unwrap_err();
    assert!(err.is_resource_locked(), "unexpected error: {err}");

    for node in &nodes {
        assert_eq!(node.value("r1").as_deref(), Some(held.token().as_str()));
        assert_eq!(node.value("r2").as_deref(), Some(held.token().as_str()));
    }
}

#[tokio::test]
async fn overlapping_multi_key_acquire_writes_nothing() {
    let nodes = MemoryNode::cluster(3);
    let coordinator = coordinator(&nodes);

    let _held = coordinator
        .acquire(&resources(&["r2"]), Duration::from_secs(5), None)
        .await
        .unwrap();

    let result = coordinator
        .acquire(&resources(&["r1", "r2"]), Duration::from_secs(5), Some(&quick_policy(1)))
        .await;
    assert!(result.unwrap_err().is_resource_locked());

    for node in &nodes {
        assert_eq!(node.value("r1"), None);
    }
}

#[tokio::test]
async fn extend_replaces_the_handle() {
    let nodes = MemoryNode::cluster(3);
    let coordinator = coordinator(&nodes);

    let mut original = coordinator
        .acquire(&resources(&["r1"]), Duration::from_millis(1000), None)
        .await
        .unwrap();
    let original_expiration = original.expiration();

    let extended = coordinator
        .extend(&mut original, Duration::from_millis(5000), None)
        .await
        .unwrap();

    assert!(extended.expiration() > original_expiration);
    assert_eq!(original.expiration_millis(), 0);
    assert!(original.is_expired());
    assert_eq!(extended.token(), original.token());
    assert_eq!(extended.resources(), original.resources());

    assert!(
        eventually(|| nodes
            .iter()
            .all(|node| node.ttl("r1").is_some_and(|ttl| ttl > Duration::from_millis(1000))))
        .await
    );
}

#[tokio::test]
async fn failed_extend_leaves_lock_untouched() {
    let nodes = MemoryNode::cluster(3);
    let coordinator = coordinator(&nodes);

    let mut lock = coordinator
        .acquire(&resources(&["r1"]), Duration::from_secs(10), None)
        .await
        .unwrap();
    let expiration = lock.expiration();

    assert!(eventually(|| nodes.iter().all(|node| node.value("r1").is_some())).await);
    for node in &nodes {
        node.insert("r1", "intruder", Duration::from_secs(10));
    }

    let result = coordinator
        .extend(&mut lock, Duration::from_secs(10), Some(&quick_policy(1)))
        .await;

    assert!(result.unwrap_err().is_resource_locked());
    assert_eq!(lock.expiration(), expiration);
    for node in &nodes {
        assert_eq!(node.value("r1").as_deref(), Some("intruder"));
    }
}

#[tokio::test]
async fn release_twice_never_touches_the_next_holder() {
    let nodes = MemoryNode::cluster(3);
    let coordinator = coordinator(&nodes);

    let mut first = coordinator
        .acquire(&resources(&["r1"]), Duration::from_secs(5), None)
        .await
        .unwrap();
    coordinator.release(&mut first, None).await.unwrap();
    assert!(first.is_expired());
    assert!(eventually(|| nodes.iter().all(|node| node.value("r1").is_none())).await);

    let second = coordinator
        .acquire(&resources(&["r1"]), Duration::from_secs(5), None)
        .await
        .unwrap();
    assert!(
        eventually(|| nodes
            .iter()
            .all(|node| node.value("r1").as_deref() == Some(second.token().as_str())))
        .await
    );

    let stats = coordinator.release(&mut first, None).await.unwrap();
    assert!(stats.votes_for.len() >= 2);
    for node in &nodes {
        assert_eq!(node.value("r1").as_deref(), Some(second.token().as_str()));
    }
}

#[tokio::test]
async fn minority_failures_never_block_a_quorum() {
    for size in [1_usize, 3, 5] {
        let tolerated = size / 2;
        for failing in combinations(size, tolerated) {
            let nodes = MemoryNode::cluster(size);
            for (position, index) in failing.iter().enumerate() {
                if position % 2 == 0 {
                    nodes[*index].set_unreachable(true);
                } else {
                    nodes[*index].set_hang(true);
                }
            }
            let coordinator = coordinator(&nodes);

            let lock = coordinator
                .acquire(&resources(&["r1"]), Duration::from_secs(5), Some(&quick_policy(0)))
                .await;
            assert!(lock.is_ok(), "size {size}, failing {failing:?}");

            let contended = coordinator
                .acquire(&resources(&["r1"]), Duration::from_secs(5), Some(&quick_policy(1)))
                .await;
            let err = contended.unwrap_err();
            assert!(
                matches!(err, MaxlockError::QuorumUnreachable { .. }) && err.is_resource_locked(),
                "size {size}, failing {failing:?}: {err}"
            );

            coordinator.shutdown().await.unwrap();
        }
    }
}

#[tokio::test]
async fn node_failures_reach_the_sink() {
    let nodes = MemoryNode::cluster(3);
    nodes[0].set_unreachable(true);
    let (sink, mut events) = ChannelSink::new(16);
    let coordinator = coordinator(&nodes).with_sink(Arc::new(sink));

    let mut lock = coordinator
        .acquire(&resources(&["r1"]), Duration::from_secs(5), None)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.node, NodeId::new("memory-0"));
    assert_eq!(event.operation, ScriptKind::Acquire);
    assert!(matches!(event.error, NodeError::Unreachable(_)));

    coordinator.release(&mut lock, None).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.operation, ScriptKind::Release);
}

#[tokio::test]
async fn settle_collects_straggler_votes() {
    let nodes = MemoryNode::cluster(3);
    nodes[2].set_hang(true);
    let coordinator = coordinator(&nodes);

    let mut lock = coordinator
        .acquire(&resources(&["r1"]), Duration::from_secs(5), Some(&quick_policy(0)))
        .await
        .unwrap();

    let settled = lock.settle().await;
    assert_eq!(settled.len(), 1);
    let stats = settled.into_iter().next().unwrap().unwrap();
    assert_eq!(stats.votes_for.len(), 2);
    assert_eq!(
        stats.votes_against.get(&NodeId::new("memory-2")),
        Some(&NodeError::Timeout { timeout_ms: 100 })
    );
    assert!(lock.settle().await.is_empty());
}
