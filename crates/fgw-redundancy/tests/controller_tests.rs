//! ---
//! fgw_section: "07-resilience-fault-tolerance"
//! fgw_subsection: "tests"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Redundancy controller behaviour against a shared store."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fgw_common::model::DriverInstanceState;
use fgw_redundancy::{
    InstanceIdentity, PromotionReason, RedundancyController, RedundancyError,
    RedundancySettings, Transition,
};
use fgw_store::{DocumentStore, MemoryStore};
use tokio::sync::broadcast;

fn settings() -> RedundancySettings {
    RedundancySettings {
        tick: Duration::from_millis(10),
        stale_threshold: 4,
        demotion_jitter_min: Duration::ZERO,
        demotion_jitter_max: Duration::ZERO,
    }
}

fn controller(store: &Arc<MemoryStore>, node: &str) -> RedundancyController {
    let store: Arc<dyn DocumentStore> = store.clone();
    RedundancyController::new(InstanceIdentity::new("OPC-UA", 1, node), settings(), store)
}

#[tokio::test]
async fn first_instance_bootstraps_record_and_becomes_active() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let mut a = controller(&store, "nodeA");

    let outcome = a.tick().await.unwrap();
    assert!(outcome.active);
    assert_eq!(
        outcome.transition,
        Some(Transition::Promoted(PromotionReason::Bootstrap))
    );
    let record = store.find_instance("OPC-UA", 1).await.unwrap().unwrap();
    assert_eq!(record.active_node_name, "nodeA");
}

#[tokio::test]
async fn standby_takes_over_only_after_heartbeat_stops() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let mut a = controller(&store, "nodeA");
    let mut b = controller(&store, "nodeB");

    assert!(a.tick().await.unwrap().active);

    // While A keeps renewing, B never claims.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(a.tick().await.unwrap().active);
        assert!(!b.tick().await.unwrap().active);
    }

    // A crashes: B already holds the last heartbeat as baseline, so the
    // fourth unchanged observation claims.
    for _ in 0..3 {
        assert!(!b.tick().await.unwrap().active);
    }
    let outcome = b.tick().await.unwrap();
    assert!(outcome.active);
    assert_eq!(
        outcome.transition,
        Some(Transition::Promoted(PromotionReason::StaleHeartbeat))
    );

    // A comes back, sees B recorded as active and steps down.
    let back = a.tick().await.unwrap();
    assert!(!back.active);
    assert_eq!(
        back.transition,
        Some(Transition::Demoted {
            active_node: "nodeB".into()
        })
    );
}

#[tokio::test]
async fn store_outage_keeps_previous_role() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let mut a = controller(&store, "nodeA");
    assert!(a.tick().await.unwrap().active);

    store.set_online(false);
    for _ in 0..6 {
        let outcome = a.tick().await.unwrap();
        assert!(outcome.active);
        assert!(outcome.transition.is_none());
    }
    store.set_online(true);
    assert!(a.tick().await.unwrap().active);
}

#[tokio::test]
async fn store_outage_does_not_advance_stale_counter() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    store.put_instance(DriverInstanceState::bootstrap(
        "OPC-UA",
        1,
        "nodeA",
        Utc::now(),
        "0.1.0",
    ));
    let mut b = controller(&store, "nodeB");
    for _ in 0..3 {
        b.tick().await.unwrap();
    }
    store.set_online(false);
    for _ in 0..5 {
        assert!(!b.tick().await.unwrap().active);
    }
    store.set_online(true);
    // Baseline plus two unchanged so far; two more are needed.
    assert!(!b.tick().await.unwrap().active);
    assert!(b.tick().await.unwrap().active);
}

#[tokio::test]
async fn disallowed_node_is_fatal() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let mut record =
        DriverInstanceState::bootstrap("OPC-UA", 1, "nodeA", Utc::now(), "0.1.0");
    record.node_names = vec!["nodeA".into()];
    store.put_instance(record);

    let mut c = controller(&store, "nodeC");
    assert!(matches!(
        c.tick().await,
        Err(RedundancyError::NodeNotAllowed { .. })
    ));
}

#[tokio::test]
async fn disabled_instance_stops_the_run_loop() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let mut record =
        DriverInstanceState::bootstrap("OPC-UA", 1, "nodeA", Utc::now(), "0.1.0");
    record.enabled = false;
    store.put_instance(record);

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let result = tokio::time::timeout(
        Duration::from_secs(1),
        controller(&store, "nodeA").run(shutdown_rx),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(RedundancyError::InstanceDisabled { .. })));
}

#[tokio::test]
async fn active_instance_stamps_connection_stats() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let mut a = controller(&store, "nodeA").with_connections(vec![3, 4]);
    a.tick().await.unwrap();
    assert_eq!(store.connection_stats(3).unwrap().node_name, "nodeA");
    assert_eq!(store.connection_stats(4).unwrap().node_name, "nodeA");
}

#[tokio::test]
async fn handle_tracks_role_and_keep_running_flag() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let mut record =
        DriverInstanceState::bootstrap("OPC-UA", 1, "nodeA", Utc::now(), "0.1.0");
    record.keep_protocol_running_while_inactive = true;
    store.put_instance(record);

    let mut b = controller(&store, "nodeB");
    let handle = b.handle();
    b.tick().await.unwrap();
    assert!(!handle.is_active());
    assert!(handle.keep_sessions_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_loop_stops_on_shutdown() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let a = controller(&store, "nodeA");
    let handle = a.handle();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(a.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.is_active());
    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}
