//! Tests for the convergence loop
//!
//! Drives full observe → diff → execute passes against the in-memory
//! drivers and checks eventual convergence, idempotence and backoff.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigurationStore;
use crate::driver::{FailureMode, MemoryContainerDriver, MemoryStorageDriver, StorageDriver};
use crate::error::Error;
use crate::model::{
    ActivationState, Application, Dataset, DatasetId, DesiredConfiguration, NodeId, Volume,
};
use crate::observer::StateObserver;

use super::convergence::{calculate_backoff, ConvergenceLoop, Phase};
use super::executor::{ChangeExecutor, Outcome};

struct Harness {
    store: Arc<ConfigurationStore>,
    storage: Arc<MemoryStorageDriver>,
    containers: Arc<MemoryContainerDriver>,
    convergence: ConvergenceLoop,
}

fn harness(initial: DesiredConfiguration) -> Harness {
    let storage = Arc::new(MemoryStorageDriver::default());
    let containers = Arc::new(MemoryContainerDriver::default());
    let store = Arc::new(ConfigurationStore::new(initial).unwrap());
    let observer = Arc::new(StateObserver::new(storage.clone(), containers.clone()));
    let executor = ChangeExecutor::new(storage.clone(), containers.clone(), Duration::from_secs(5));
    let convergence = ConvergenceLoop::new(
        store.clone(),
        observer,
        executor,
        Duration::from_secs(10),
    );
    Harness {
        store,
        storage,
        containers,
        convergence,
    }
}

fn configured_dataset(primary: NodeId) -> (DatasetId, DesiredConfiguration) {
    let dataset_id = DatasetId::new_random();
    let mut config = DesiredConfiguration::default();
    config.datasets.insert(
        dataset_id,
        Dataset {
            dataset_id,
            maximum_size: Some(1 << 30),
            primary,
            metadata: BTreeMap::new(),
            deleted: false,
        },
    );
    (dataset_id, config)
}

#[tokio::test]
async fn a_pass_converges_and_the_next_pass_is_empty() {
    let node = NodeId::new_random();
    let (dataset_id, config) = configured_dataset(node);
    let h = harness(config);

    let outcomes = h.convergence.run_once().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].outcome, Outcome::Succeeded);
    assert_eq!(h.convergence.phase(), Phase::Idle);

    let attached = h.storage.list(node).await.unwrap();
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].dataset_id, dataset_id);

    // Converged: recomputing against the resulting state yields nothing.
    assert!(h.convergence.run_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn observation_failure_enters_backoff() {
    let node = NodeId::new_random();
    let (_, config) = configured_dataset(node);
    let h = harness(config);

    h.storage.set_unreachable(node, true).await;
    h.containers.set_unreachable(node, true).await;

    let err = h.convergence.run_once().await.unwrap_err();
    assert!(matches!(err, Error::Observation(_)));
    assert_eq!(h.convergence.phase(), Phase::Backoff);

    // Recovery: the next pass observes and converges.
    h.storage.set_unreachable(node, false).await;
    h.containers.set_unreachable(node, false).await;
    let outcomes = h.convergence.run_once().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(h.convergence.phase(), Phase::Idle);
}

#[tokio::test]
async fn failed_changes_are_retried_by_the_next_cycle() {
    let node = NodeId::new_random();
    let (_, config) = configured_dataset(node);
    let h = harness(config);

    h.storage.inject_failure(FailureMode::Create).await;
    let outcomes = h.convergence.run_once().await.unwrap();
    assert!(matches!(outcomes[0].outcome, Outcome::Failed(_)));

    h.storage.clear_failure(FailureMode::Create).await;
    let outcomes = h.convergence.run_once().await.unwrap();
    assert_eq!(outcomes[0].outcome, Outcome::Succeeded);
    assert!(h.convergence.run_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn dependent_container_converges_one_cycle_after_its_dataset() {
    let node = NodeId::new_random();
    let (dataset_id, mut config) = configured_dataset(node);

    let mut mongo = Application {
        name: "mongodb".to_string(),
        image: "mongo:7".to_string(),
        ports: Default::default(),
        volumes: Default::default(),
        state: ActivationState::Active,
    };
    mongo.volumes.insert(Volume {
        node_path: "/srv/volumes/mongodb".into(),
        container_path: "/data/db".into(),
        dataset_id: Some(dataset_id),
    });
    config.applications.insert(node, BTreeSet::from([mongo]));

    let h = harness(config);

    // Cycle 1: the dataset lands; the container is deferred.
    let outcomes = h.convergence.run_once().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].change.kind(), "create_dataset");

    // Cycle 2: the container starts on top of its dataset.
    let outcomes = h.convergence.run_once().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].change.kind(), "create_container");
    assert_eq!(outcomes[0].outcome, Outcome::Succeeded);

    // Cycle 3: converged.
    assert!(h.convergence.run_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn a_dataset_on_an_unreachable_host_is_not_recreated_elsewhere() {
    let node_a = NodeId::new_random();
    let node_b = NodeId::new_random();
    let (dataset_id, config) = configured_dataset(node_a);
    let h = harness(config);

    h.convergence.run_once().await.unwrap();
    assert_eq!(h.storage.list(node_a).await.unwrap().len(), 1);

    // The host drops out while the primary changes to another node. The data
    // still lives on the unobservable host, so nothing may touch the dataset
    // this cycle; a create on node_b would leave two copies.
    h.storage.set_unreachable(node_a, true).await;
    h.containers.set_unreachable(node_a, true).await;
    h.store
        .update_dataset(dataset_id, Some(node_b), None)
        .unwrap();

    let outcomes = h.convergence.run_once().await.unwrap();
    assert!(outcomes.is_empty(), "expected deferral, got {:?}", outcomes);
    assert!(h.storage.list(node_b).await.unwrap().is_empty());

    // Once the host returns, the pending change is a move, not a create.
    h.storage.set_unreachable(node_a, false).await;
    h.containers.set_unreachable(node_a, false).await;
    let outcomes = h.convergence.run_once().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].change.kind(), "move_dataset");
    assert_eq!(outcomes[0].outcome, Outcome::Succeeded);

    // Exactly one copy exists, on the desired primary.
    assert!(h.storage.list(node_a).await.unwrap().is_empty());
    assert_eq!(h.storage.list(node_b).await.unwrap().len(), 1);
}

#[tokio::test]
async fn replacing_the_configuration_removes_strays_from_deconfigured_nodes() {
    let node = NodeId::new_random();
    let (_, config) = configured_dataset(node);
    let h = harness(config);

    h.convergence.run_once().await.unwrap();
    assert_eq!(h.storage.list(node).await.unwrap().len(), 1);

    // The new configuration mentions neither the dataset nor its node; the
    // node stays in the observation scope and the stray volume is deleted.
    h.store.replace(DesiredConfiguration::default()).unwrap();

    let outcomes = h.convergence.run_once().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].change.kind(), "delete_dataset");
    assert_eq!(outcomes[0].outcome, Outcome::Succeeded);
    assert!(h.storage.list(node).await.unwrap().is_empty());

    assert!(h.convergence.run_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn a_move_requested_through_the_store_converges() {
    let node_a = NodeId::new_random();
    let node_b = NodeId::new_random();
    let (dataset_id, config) = configured_dataset(node_a);
    let h = harness(config);

    h.convergence.run_once().await.unwrap();
    assert_eq!(h.storage.list(node_a).await.unwrap().len(), 1);

    h.store
        .update_dataset(dataset_id, Some(node_b), None)
        .unwrap();

    let outcomes = h.convergence.run_once().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].change.kind(), "move_dataset");
    assert_eq!(outcomes[0].outcome, Outcome::Succeeded);

    assert!(h.storage.list(node_a).await.unwrap().is_empty());
    assert_eq!(h.storage.list(node_b).await.unwrap().len(), 1);
    assert!(h.convergence.run_once().await.unwrap().is_empty());
}

#[test]
fn backoff_doubles_and_caps() {
    assert_eq!(calculate_backoff(0, None, None), Duration::from_secs(1));
    assert_eq!(calculate_backoff(1, None, None), Duration::from_secs(2));
    assert_eq!(calculate_backoff(2, None, None), Duration::from_secs(4));
    assert_eq!(calculate_backoff(5, None, None), Duration::from_secs(32));
    // capped at 60 s
    assert_eq!(calculate_backoff(6, None, None), Duration::from_secs(60));
    assert_eq!(calculate_backoff(20, None, None), Duration::from_secs(60));

    assert_eq!(
        calculate_backoff(3, Some(15), Some(300)),
        Duration::from_secs(120)
    );
}
