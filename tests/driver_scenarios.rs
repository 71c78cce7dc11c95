//! ---
//! fgw_section: "15-testing-qa-runbook"
//! fgw_subsection: "tests"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Ingestion and command scenarios through a running driver."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fgw_adapters::{FieldAdapter, NativeValue, SimulatedAdapter};
use fgw_common::config::DriverConfig;
use fgw_common::model::{CommandRequest, ConnectionConfig, ValueUpdate, SUPERVISED_ORIGIN};
use fgw_core::{DriverRuntime, RuntimeHandle};
use fgw_store::{DocumentStore, MemoryStore};

struct Driver {
    store: Arc<MemoryStore>,
    adapter: Arc<SimulatedAdapter>,
    handle: RuntimeHandle,
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn active_driver(idle_sleep: Duration) -> Driver {
    let store = Arc::new(MemoryStore::new("json_scada"));
    store.put_connection(ConnectionConfig::new("SIMULATED", 1, 3, "SIM3"));
    let adapter = Arc::new(SimulatedAdapter::new("SIMULATED"));

    let mut config = DriverConfig::new("nodeA", "memory://", "json_scada");
    config.runtime.redundancy_tick = Duration::from_millis(20);
    config.runtime.idle_sleep = idle_sleep;
    config.runtime.store_retry = Duration::from_millis(5);
    config.runtime.dispatcher_backoff = Duration::from_millis(10);

    let dyn_store: Arc<dyn DocumentStore> = store.clone();
    let dyn_adapter: Arc<dyn FieldAdapter> = adapter.clone();
    let handle = DriverRuntime::new(config, 1, dyn_store, dyn_adapter)
        .start()
        .await
        .unwrap();
    let activity = handle.activity();
    wait_until("activation", || activity.is_active()).await;
    let sessions = adapter.clone();
    wait_until("session", || sessions.is_live(3)).await;
    // Let the command feed subscription settle.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Driver {
        store,
        adapter,
        handle,
    }
}

async fn resolved(store: &MemoryStore, command: &CommandRequest) -> CommandRequest {
    for _ in 0..300 {
        let stored = store.find_command(command.id).await.unwrap().unwrap();
        if stored.is_terminal() {
            return stored;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("command {} never resolved", command.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_address_gets_first_key_of_its_connection() {
    let driver = active_driver(Duration::from_millis(5)).await;
    assert!(driver
        .adapter
        .publish(ValueUpdate::numeric(3, "Line1.Meter.kW", 118.25)));

    let store = driver.store.clone();
    wait_until("point update", || {
        store
            .points()
            .iter()
            .any(|p| p.key == 300_001 && p.source_data_update.is_some())
    })
    .await;
    let record = driver
        .store
        .find_point(3, "Line1.Meter.kW", SUPERVISED_ORIGIN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.key, 3 * 100_000 + 1);
    assert_eq!(record.tag, "SIM3.Line1.Meter.kW");
    assert_eq!(record.group1, "SIM3");
    assert_eq!(record.source_data_update.unwrap().value_at_source, 118.25);
    driver.handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_is_held_under_the_bound_and_flushed_in_batches() {
    let driver = active_driver(Duration::from_millis(200)).await;
    let queue = driver.handle.queue();
    let writes_before = driver.store.bulk_write_count();
    for n in 0..2_000 {
        queue.enqueue(ValueUpdate::numeric(3, format!("Burst.P{n}"), n as f64));
    }
    assert_eq!(queue.dropped_total(), 0);

    let store = driver.store.clone();
    wait_until("burst flushed", || store.points().len() == 2_000).await;
    let pending = queue.clone();
    wait_until("queue drained", || pending.is_empty()).await;
    // 2,000 items need at least two batches of at most 1,250.
    assert!(driver.store.bulk_write_count() - writes_before >= 2);
    let store = driver.store.clone();
    wait_until("values written", || {
        store.points().iter().all(|p| p.source_data_update.is_some())
    })
    .await;
    driver.handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_command_is_cancelled_without_touching_the_field() {
    let driver = active_driver(Duration::from_millis(5)).await;
    let command = CommandRequest::new(3, "Breaker.Q1", "boolean", 1.0)
        .issued_at(Utc::now() - chrono::Duration::seconds(15));
    driver.store.insert_command(&command).await.unwrap();

    let stored = resolved(&driver.store, &command).await;
    assert_eq!(stored.cancel_reason.as_deref(), Some("expired"));
    assert!(driver.adapter.writes().is_empty());
    driver.handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn int32_command_reaches_the_field_natively() {
    let driver = active_driver(Duration::from_millis(5)).await;
    let command = CommandRequest::new(3, "Regulator.Tap", "int32", 42.0);
    driver.store.insert_command(&command).await.unwrap();

    let stored = resolved(&driver.store, &command).await;
    assert_eq!(stored.delivered, Some(true));
    assert_eq!(stored.ack, Some(true));
    let writes = driver.adapter.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].connection_number, 3);
    assert_eq!(writes[0].value, NativeValue::I32(42));
    driver.handle.shutdown().await.unwrap();
}
