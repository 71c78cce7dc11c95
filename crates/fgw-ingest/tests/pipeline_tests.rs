//! ---
//! fgw_section: "04-ingestion"
//! fgw_subsection: "tests"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Drain loop behaviour against the in-memory store."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use fgw_common::model::{ConnectionConfig, ValueUpdate, SUPERVISED_ORIGIN};
use fgw_ingest::{CycleOutcome, IngestionPipeline, PipelineSettings, TagRegistry, UpdateQueue};
use fgw_redundancy::{Activity, ActivitySwitch};
use fgw_store::{DocumentStore, MemoryStore};
use tokio::sync::broadcast;

fn settings() -> PipelineSettings {
    PipelineSettings {
        batch_size: 1_250,
        batch_budget: Duration::from_secs(5),
        idle_sleep: Duration::from_millis(5),
        store_retry: Duration::from_millis(5),
    }
}

fn pipeline(store: &Arc<MemoryStore>, connections: &[ConnectionConfig]) -> (ActivitySwitch, IngestionPipeline) {
    let (switch, handle) = ActivitySwitch::new(Activity {
        active: true,
        keep_protocol_running: false,
    });
    let store: Arc<dyn DocumentStore> = store.clone();
    let registry = TagRegistry::new("OPC-UA", connections, 100_000, store.clone());
    let queue = Arc::new(UpdateQueue::new(20_000));
    (switch, IngestionPipeline::new(settings(), queue, registry, store, handle))
}

fn plc(number: u32) -> ConnectionConfig {
    ConnectionConfig::new("OPC-UA", 1, number, format!("PLC{number}"))
}

#[tokio::test]
async fn new_address_is_created_then_updated() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let (_switch, mut pipeline) = pipeline(&store, &[plc(3)]);

    pipeline
        .queue()
        .enqueue(ValueUpdate::numeric(3, "Feeder.Current", 42.5));
    let CycleOutcome::Flushed(stats) = pipeline.run_cycle().await else {
        panic!("expected a flushed batch");
    };
    assert_eq!(stats.created, 1);
    assert_eq!(stats.matched, 1);
    assert_eq!(stats.modified, 1);

    let record = store
        .find_point(3, "Feeder.Current", SUPERVISED_ORIGIN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.key, 300_001);
    let source = record.source_data_update.unwrap();
    assert_eq!(source.value_at_source, 42.5);
    assert!(!source.invalid_at_source);
}

#[tokio::test]
async fn two_thousand_updates_flush_in_two_batches() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let (_switch, mut pipeline) = pipeline(&store, &[plc(1)]);
    let queue = pipeline.queue();
    for n in 0..2_000 {
        queue.enqueue(ValueUpdate::numeric(1, format!("p{}", n % 50), n as f64));
    }
    assert_eq!(queue.len(), 2_000);
    assert_eq!(queue.dropped_total(), 0);

    let mut sizes = Vec::new();
    while let CycleOutcome::Flushed(stats) = pipeline.run_cycle().await {
        sizes.push(stats.items);
    }
    assert_eq!(sizes, vec![1_250, 750]);
    assert_eq!(store.bulk_write_count(), 2);
    assert_eq!(store.points().len(), 50);
}

#[tokio::test]
async fn same_address_never_duplicates() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let (_switch, mut pipeline) = pipeline(&store, &[plc(2)]);
    for n in 0..5 {
        pipeline.queue().enqueue(ValueUpdate::numeric(2, "a", n as f64));
    }
    pipeline.queue().enqueue(ValueUpdate::numeric(2, "b", 0.0));
    pipeline.run_cycle().await;
    pipeline.queue().enqueue(ValueUpdate::numeric(2, "a", 9.0));
    pipeline.run_cycle().await;

    let keys: Vec<i64> = store.points().iter().map(|p| p.key).collect();
    assert_eq!(keys, vec![200_001, 200_002]);
}

#[tokio::test]
async fn failed_bulk_write_requeues_in_order() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let (_switch, mut pipeline) = pipeline(&store, &[plc(1)]);
    for n in 0..3 {
        pipeline.queue().enqueue(ValueUpdate::numeric(1, format!("p{n}"), n as f64));
    }
    store.fail_next_bulk_writes(1);

    assert_eq!(
        pipeline.run_cycle().await,
        CycleOutcome::Failed {
            requeued: 3,
            trimmed: 0
        }
    );
    assert_eq!(pipeline.queue().len(), 3);

    let CycleOutcome::Flushed(stats) = pipeline.run_cycle().await else {
        panic!("retry should flush");
    };
    assert_eq!(stats.matched, 3);
    // Records created before the failure are reused on retry.
    assert_eq!(stats.created, 0);
}

#[tokio::test]
async fn rejected_bulk_write_is_dropped_instead_of_retried_forever() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let (_switch, mut pipeline) = pipeline(&store, &[plc(1)]);
    for n in 0..3 {
        pipeline.queue().enqueue(ValueUpdate::numeric(1, format!("p{n}"), n as f64));
    }
    store.reject_next_bulk_writes(1);

    assert_eq!(
        pipeline.run_cycle().await,
        CycleOutcome::Discarded { discarded: 3 }
    );
    assert!(pipeline.queue().is_empty());

    // The next batch is unaffected by the rejected one.
    pipeline.queue().enqueue(ValueUpdate::numeric(1, "p0", 7.0));
    let CycleOutcome::Flushed(stats) = pipeline.run_cycle().await else {
        panic!("next batch should flush");
    };
    assert_eq!(stats.items, 1);
    assert_eq!(stats.matched, 1);
    let record = store.find_point(1, "p0", SUPERVISED_ORIGIN).await.unwrap().unwrap();
    assert_eq!(record.source_data_update.unwrap().value_at_source, 7.0);
}

#[tokio::test]
async fn unreachable_store_keeps_queue_intact() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let (_switch, mut pipeline) = pipeline(&store, &[plc(1)]);
    pipeline.queue().enqueue(ValueUpdate::numeric(1, "x", 1.0));
    store.set_online(false);
    assert_eq!(pipeline.run_cycle().await, CycleOutcome::StoreUnavailable);
    assert_eq!(pipeline.queue().len(), 1);
    store.set_online(true);
    assert!(matches!(pipeline.run_cycle().await, CycleOutcome::Flushed(_)));
}

#[tokio::test]
async fn standby_discards_queue_and_cache() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let (switch, mut pipeline) = pipeline(&store, &[plc(1)]);
    pipeline.queue().enqueue(ValueUpdate::numeric(1, "x", 1.0));
    pipeline.run_cycle().await;
    assert!(pipeline.registry().is_known(1, "x"));

    switch.set_active(false);
    pipeline.queue().enqueue(ValueUpdate::numeric(1, "y", 1.0));
    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Standby);
    assert!(pipeline.queue().is_empty());
    assert!(!pipeline.registry().is_known(1, "x"));
    assert!(store.find_point(1, "y", SUPERVISED_ORIGIN).await.unwrap().is_none());

    // Promotion reloads the registry from the store.
    switch.set_active(true);
    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Idle);
    assert!(pipeline.registry().is_known(1, "x"));
}

#[tokio::test]
async fn unknown_connections_and_disabled_auto_create_are_not_tagged() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let mut manual = plc(4);
    manual.auto_create_tags = false;
    let (_switch, mut pipeline) = pipeline(&store, &[manual]);
    pipeline.queue().enqueue(ValueUpdate::numeric(4, "x", 1.0));
    pipeline.queue().enqueue(ValueUpdate::numeric(8, "x", 1.0));

    let CycleOutcome::Flushed(stats) = pipeline.run_cycle().await else {
        panic!("expected a flushed batch");
    };
    assert_eq!(stats.items, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.matched, 0);
    assert!(store.points().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_loop_drains_until_shutdown() {
    let store = Arc::new(MemoryStore::new("json_scada"));
    let (_switch, pipeline) = pipeline(&store, &[plc(1)]);
    let queue = pipeline.queue();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(pipeline.run(shutdown_rx));

    for n in 0..10 {
        queue.enqueue(ValueUpdate::numeric(1, format!("p{n}"), 1.0));
    }
    for _ in 0..100 {
        if store.points().len() == 10 && queue.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.points().len(), 10);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}
