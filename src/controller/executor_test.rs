//! Tests for the change executor
//!
//! Covers precondition re-validation, failure isolation, the move handoff
//! protocol, timeouts and concurrent application of independent changes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::driver::{
    ContainerDriver, FailureMode, MemoryContainerDriver, MemoryStorageDriver, StorageDriver,
};
use crate::model::{ActivationState, Application, DatasetId, NodeId};

use super::diff::Change;
use super::executor::{ChangeExecutor, Outcome};

fn executor(
    storage: &Arc<MemoryStorageDriver>,
    containers: &Arc<MemoryContainerDriver>,
) -> ChangeExecutor {
    ChangeExecutor::new(storage.clone(), containers.clone(), Duration::from_secs(5))
}

fn create(dataset_id: DatasetId, node: NodeId) -> Change {
    Change::CreateDataset {
        dataset_id,
        node,
        maximum_size: None,
        metadata: BTreeMap::new(),
    }
}

fn app(name: &str) -> Application {
    Application {
        name: name.to_string(),
        image: "busybox:1".to_string(),
        ports: Default::default(),
        volumes: Default::default(),
        state: ActivationState::Active,
    }
}

#[tokio::test]
async fn applies_a_batch_and_reports_per_change_outcomes() {
    let storage = Arc::new(MemoryStorageDriver::default());
    let containers = Arc::new(MemoryContainerDriver::default());
    let node = NodeId::new_random();
    let d1 = DatasetId::new_random();

    let outcomes = executor(&storage, &containers)
        .apply(vec![
            create(d1, node),
            Change::CreateContainer {
                node,
                application: app("web"),
            },
        ])
        .await;

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.outcome == Outcome::Succeeded));
    assert_eq!(storage.list(node).await.unwrap().len(), 1);
    assert_eq!(containers.list(node).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stale_preconditions_are_skipped_not_failed() {
    let storage = Arc::new(MemoryStorageDriver::default());
    let containers = Arc::new(MemoryContainerDriver::default());
    let node = NodeId::new_random();
    let d1 = DatasetId::new_random();

    // A concurrent actor already created the dataset and there is no "gone"
    // container to stop.
    storage.create(d1, node, None, BTreeMap::new()).await.unwrap();

    let outcomes = executor(&storage, &containers)
        .apply(vec![
            create(d1, node),
            Change::StopContainer {
                node,
                name: "gone".to_string(),
            },
        ])
        .await;

    for outcome in &outcomes {
        assert!(
            matches!(outcome.outcome, Outcome::Skipped(_)),
            "expected skip, got {:?}",
            outcome
        );
    }
}

#[tokio::test]
async fn one_failure_never_aborts_independent_changes() {
    let storage = Arc::new(MemoryStorageDriver::default());
    let containers = Arc::new(MemoryContainerDriver::default());
    containers.inject_failure(FailureMode::CreateContainer).await;

    let node = NodeId::new_random();
    let d1 = DatasetId::new_random();

    let outcomes = executor(&storage, &containers)
        .apply(vec![
            Change::CreateContainer {
                node,
                application: app("web"),
            },
            create(d1, node),
        ])
        .await;

    assert!(matches!(outcomes[0].outcome, Outcome::Failed(_)));
    assert_eq!(outcomes[1].outcome, Outcome::Succeeded);
    assert_eq!(storage.list(node).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_attach_leaves_the_origin_authoritative() {
    let storage = Arc::new(MemoryStorageDriver::default());
    let containers = Arc::new(MemoryContainerDriver::default());
    let node_a = NodeId::new_random();
    let node_b = NodeId::new_random();
    let d1 = DatasetId::new_random();

    storage.create(d1, node_a, None, BTreeMap::new()).await.unwrap();
    storage.inject_failure(FailureMode::Attach).await;

    let change = Change::MoveDataset {
        dataset_id: d1,
        from: node_a,
        to: node_b,
    };
    let outcomes = executor(&storage, &containers)
        .apply(vec![change.clone()])
        .await;
    assert!(matches!(outcomes[0].outcome, Outcome::Failed(_)));

    // Data stayed consistent on the original node.
    assert_eq!(storage.list(node_a).await.unwrap().len(), 1);
    assert!(storage.list(node_b).await.unwrap().is_empty());

    // The mismatch persists, so a later cycle retries the same move and
    // succeeds once the backend recovers.
    storage.clear_failure(FailureMode::Attach).await;
    let outcomes = executor(&storage, &containers).apply(vec![change]).await;
    assert_eq!(outcomes[0].outcome, Outcome::Succeeded);
    assert!(storage.list(node_a).await.unwrap().is_empty());
    assert_eq!(storage.list(node_b).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_backend_calls_fail_on_timeout() {
    let storage = Arc::new(MemoryStorageDriver::default());
    let containers = Arc::new(MemoryContainerDriver::default());
    storage.set_latency(Some(Duration::from_secs(120))).await;

    let node = NodeId::new_random();
    let outcomes = executor(&storage, &containers)
        .apply(vec![create(DatasetId::new_random(), node)])
        .await;

    match &outcomes[0].outcome {
        Outcome::Failed(reason) => assert!(reason.contains("timed out"), "{}", reason),
        other => panic!("expected timeout failure, got {:?}", other),
    }
}

#[tokio::test]
async fn independent_changes_commute() {
    let node_a = NodeId::new_random();
    let node_b = NodeId::new_random();
    let d1 = DatasetId::new_random();
    let d2 = DatasetId::new_random();

    let mut final_states = Vec::new();
    for order in [vec![(d1, node_a), (d2, node_b)], vec![(d2, node_b), (d1, node_a)]] {
        let storage = Arc::new(MemoryStorageDriver::default());
        let containers = Arc::new(MemoryContainerDriver::default());
        let changes = order.into_iter().map(|(id, node)| create(id, node)).collect();
        let outcomes = executor(&storage, &containers).apply(changes).await;
        assert!(outcomes.iter().all(|o| o.outcome == Outcome::Succeeded));

        let mut state: Vec<(NodeId, Vec<DatasetId>)> = Vec::new();
        for node in [node_a, node_b] {
            let ids = storage
                .list(node)
                .await
                .unwrap()
                .into_iter()
                .map(|d| d.dataset_id)
                .collect();
            state.push((node, ids));
        }
        final_states.push(state);
    }

    assert_eq!(final_states[0], final_states[1]);
}
