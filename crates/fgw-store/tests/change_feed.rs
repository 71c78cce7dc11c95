//! ---
//! fgw_section: "03-store-client"
//! fgw_subsection: "tests"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Store capability checks: bulk writes, claims, change feed."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::Utc;
use fgw_common::model::{
    CommandRequest, DriverInstanceState, PointKind, PointRecord, ValueUpdate, SUPERVISED_ORIGIN,
};
use fgw_store::{DocumentStore, HeartbeatObservation, MemoryStore, PointUpdate, StoreError};
use futures::StreamExt;

#[tokio::test]
async fn feed_delivers_inserts_in_order() {
    let store = MemoryStore::new("json_scada");
    let mut feed = store.watch_command_inserts().await.unwrap();

    let first = CommandRequest::new(1, "a", "int32", 1.0);
    let second = CommandRequest::new(1, "b", "int32", 2.0);
    store.insert_command(&first).await.unwrap();
    store.insert_command(&second).await.unwrap();

    let got_first = tokio::time::timeout(Duration::from_secs(1), feed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let got_second = tokio::time::timeout(Duration::from_secs(1), feed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got_first.id, first.id);
    assert_eq!(got_second.id, second.id);
}

#[tokio::test]
async fn bulk_update_only_touches_supervised_records() {
    let store = MemoryStore::new("json_scada");
    store
        .insert_point(&PointRecord::supervised(
            300_001,
            "PLC3.a",
            3,
            "a",
            PointKind::Analog,
        ))
        .await
        .unwrap();
    let mut command_only =
        PointRecord::supervised(300_002, "PLC3.a.cmd", 3, "a", PointKind::Analog);
    command_only.origin = "command".into();
    store.insert_point(&command_only).await.unwrap();

    let source = ValueUpdate::numeric(3, "a", 42.0).to_source_data();
    let updates = vec![
        PointUpdate {
            connection_number: 3,
            address: "a".into(),
            source: source.clone(),
        },
        PointUpdate {
            connection_number: 3,
            address: "unknown".into(),
            source: source.clone(),
        },
    ];
    let result = store.bulk_update_points(&updates).await.unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(result.modified, 1);

    // Same content again matches without modifying.
    let again = store.bulk_update_points(&updates[..1]).await.unwrap();
    assert_eq!((again.matched, again.modified), (1, 0));

    let supervised = store
        .find_point(3, "a", SUPERVISED_ORIGIN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(supervised.source_data_update.unwrap().value_at_source, 42.0);
    let untouched = store.find_point(3, "a", "command").await.unwrap().unwrap();
    assert!(untouched.source_data_update.is_none());
}

#[tokio::test]
async fn claim_loses_when_heartbeat_moved() {
    let store = MemoryStore::new("json_scada");
    let t0 = Utc::now();
    let state = DriverInstanceState::bootstrap("OPC-UA", 1, "nodeA", t0, "0.1.0");
    store.insert_instance(&state).await.unwrap();
    let observed = HeartbeatObservation::of(&state);

    assert!(store
        .renew_heartbeat("OPC-UA", 1, "nodeA", t0 + chrono::Duration::seconds(5), "0.1.0")
        .await
        .unwrap());
    assert!(!store
        .claim_active("OPC-UA", 1, "nodeB", &observed, Utc::now(), "0.1.0")
        .await
        .unwrap());

    let fresh = store.find_instance("OPC-UA", 1).await.unwrap().unwrap();
    assert!(store
        .claim_active(
            "OPC-UA",
            1,
            "nodeB",
            &HeartbeatObservation::of(&fresh),
            Utc::now(),
            "0.1.0"
        )
        .await
        .unwrap());
    let claimed = store.find_instance("OPC-UA", 1).await.unwrap().unwrap();
    assert_eq!(claimed.active_node_name, "nodeB");
    assert!(!store
        .renew_heartbeat("OPC-UA", 1, "nodeA", Utc::now(), "0.1.0")
        .await
        .unwrap());
}

#[tokio::test]
async fn duplicate_instance_insert_is_rejected() {
    let store = MemoryStore::new("json_scada");
    let state = DriverInstanceState::bootstrap("OPC-DA", 2, "n", Utc::now(), "0.1.0");
    store.insert_instance(&state).await.unwrap();
    assert!(matches!(
        store.insert_instance(&state).await,
        Err(StoreError::Duplicate(_))
    ));
}
