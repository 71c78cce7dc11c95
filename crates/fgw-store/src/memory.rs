//! ---
//! fgw_section: "03-store-client"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared store abstractions and backends."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fgw_common::model::{
    CommandRequest, CommandResolution, ConnectionConfig, DriverInstanceState, PointRecord,
    SUPERVISED_ORIGIN,
};
use futures::StreamExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    BulkWriteResult, CommandFeed, DocumentStore, HeartbeatObservation, PointUpdate, Result,
    StoreError,
};

const FEED_CAPACITY: usize = 1024;

/// `stats` sub-document of a connection record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Node that last served the connection.
    pub node_name: String,
    /// When the node last stamped the record.
    pub time_tag: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Collections {
    instances: Vec<DriverInstanceState>,
    connections: Vec<ConnectionConfig>,
    connection_stats: HashMap<u32, ConnectionStats>,
    points: BTreeMap<i64, PointRecord>,
    addresses: HashMap<(u32, String, String), i64>,
    tags: HashMap<String, i64>,
    commands: IndexMap<Uuid, CommandRequest>,
}

/// In-process document store with the same semantics the runtime expects from
/// the shared database. Used by the daemon's `memory://` backend and by tests.
#[derive(Debug)]
pub struct MemoryStore {
    database: String,
    inner: RwLock<Collections>,
    online: AtomicBool,
    bulk_writes: AtomicU64,
    failing_bulk_writes: AtomicU64,
    rejected_bulk_writes: AtomicU64,
    rejected_resolutions: AtomicU64,
    command_tx: Mutex<broadcast::Sender<CommandRequest>>,
}

impl MemoryStore {
    /// Create an empty store for the named database.
    pub fn new(database: impl Into<String>) -> Self {
        let (command_tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            database: database.into(),
            inner: RwLock::new(Collections::default()),
            online: AtomicBool::new(true),
            bulk_writes: AtomicU64::new(0),
            failing_bulk_writes: AtomicU64::new(0),
            rejected_bulk_writes: AtomicU64::new(0),
            rejected_resolutions: AtomicU64::new(0),
            command_tx: Mutex::new(command_tx),
        }
    }

    /// Database name this store was opened for.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Simulate losing (or regaining) connectivity. Every operation fails while offline.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of successful bulk writes so far.
    pub fn bulk_write_count(&self) -> u64 {
        self.bulk_writes.load(Ordering::SeqCst)
    }

    /// Make the next `count` bulk writes fail as if the connection dropped
    /// mid-write, while liveness checks keep succeeding.
    pub fn fail_next_bulk_writes(&self, count: u64) {
        self.failing_bulk_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` bulk writes fail with a permanent rejection, as
    /// a schema validator would. Retrying such a batch never succeeds.
    pub fn reject_next_bulk_writes(&self, count: u64) {
        self.rejected_bulk_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` command resolutions fail with a permanent rejection.
    pub fn reject_next_resolutions(&self, count: u64) {
        self.rejected_resolutions.store(count, Ordering::SeqCst);
    }

    /// End every open command feed, as a server-side stream invalidation
    /// would. Later subscriptions see new inserts again.
    pub fn close_command_feeds(&self) {
        let (fresh, _) = broadcast::channel(FEED_CAPACITY);
        drop(std::mem::replace(&mut *self.command_tx.lock(), fresh));
    }

    /// Upsert an instance record directly, bypassing the conditional write paths.
    pub fn put_instance(&self, state: DriverInstanceState) {
        let mut inner = self.inner.write();
        inner.instances.retain(|existing| {
            !(existing.protocol_driver == state.protocol_driver
                && existing.protocol_driver_instance_number
                    == state.protocol_driver_instance_number)
        });
        inner.instances.push(state);
    }

    /// Add a connection record.
    pub fn put_connection(&self, connection: ConnectionConfig) {
        self.inner.write().connections.push(connection);
    }

    /// Current `stats` of a connection, if any node stamped it.
    pub fn connection_stats(&self, connection_number: u32) -> Option<ConnectionStats> {
        self.inner
            .read()
            .connection_stats
            .get(&connection_number)
            .cloned()
    }

    /// Snapshot of every point record, ordered by key.
    pub fn points(&self) -> Vec<PointRecord> {
        self.inner.read().points.values().cloned().collect()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "database {} unreachable",
                self.database
            )))
        }
    }
}

/// Consume one pending injected fault, if any.
fn take_one(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn instance_mut<'a>(
    instances: &'a mut [DriverInstanceState],
    driver: &str,
    instance: u32,
) -> Option<&'a mut DriverInstanceState> {
    instances.iter_mut().find(|state| {
        state.protocol_driver == driver && state.protocol_driver_instance_number == instance
    })
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.ensure_online()
    }

    async fn find_instance(
        &self,
        driver: &str,
        instance: u32,
    ) -> Result<Option<DriverInstanceState>> {
        self.ensure_online()?;
        let inner = self.inner.read();
        Ok(inner
            .instances
            .iter()
            .find(|state| {
                state.protocol_driver == driver
                    && state.protocol_driver_instance_number == instance
            })
            .cloned())
    }

    async fn insert_instance(&self, state: &DriverInstanceState) -> Result<()> {
        self.ensure_online()?;
        let mut inner = self.inner.write();
        let exists = inner.instances.iter().any(|existing| {
            existing.protocol_driver == state.protocol_driver
                && existing.protocol_driver_instance_number == state.protocol_driver_instance_number
        });
        if exists {
            return Err(StoreError::Duplicate(format!(
                "{}#{}",
                state.protocol_driver, state.protocol_driver_instance_number
            )));
        }
        inner.instances.push(state.clone());
        Ok(())
    }

    async fn renew_heartbeat(
        &self,
        driver: &str,
        instance: u32,
        node: &str,
        at: DateTime<Utc>,
        version: &str,
    ) -> Result<bool> {
        self.ensure_online()?;
        let mut inner = self.inner.write();
        match instance_mut(&mut inner.instances, driver, instance) {
            Some(state) if state.active_node_name == node => {
                state.active_node_keep_alive_time_tag = Some(at);
                state.software_version = version.to_owned();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_active(
        &self,
        driver: &str,
        instance: u32,
        node: &str,
        observed: &HeartbeatObservation,
        at: DateTime<Utc>,
        version: &str,
    ) -> Result<bool> {
        self.ensure_online()?;
        let mut inner = self.inner.write();
        match instance_mut(&mut inner.instances, driver, instance) {
            Some(state)
                if state.active_node_name == observed.active_node_name
                    && state.active_node_keep_alive_time_tag == observed.keep_alive =>
            {
                state.active_node_name = node.to_owned();
                state.active_node_keep_alive_time_tag = Some(at);
                state.software_version = version.to_owned();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_connections(
        &self,
        driver: &str,
        instance: u32,
    ) -> Result<Vec<ConnectionConfig>> {
        self.ensure_online()?;
        let inner = self.inner.read();
        Ok(inner
            .connections
            .iter()
            .filter(|conn| {
                conn.enabled
                    && conn.protocol_driver == driver
                    && conn.protocol_driver_instance_number == instance
            })
            .cloned()
            .collect())
    }

    async fn update_connection_stats(
        &self,
        connection_number: u32,
        node: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_online()?;
        self.inner.write().connection_stats.insert(
            connection_number,
            ConnectionStats {
                node_name: node.to_owned(),
                time_tag: at,
            },
        );
        Ok(())
    }

    async fn find_points(&self, connection_number: u32, origin: &str) -> Result<Vec<PointRecord>> {
        self.ensure_online()?;
        let inner = self.inner.read();
        Ok(inner
            .points
            .values()
            .filter(|point| {
                point.protocol_source_connection_number == connection_number
                    && point.origin == origin
            })
            .cloned()
            .collect())
    }

    async fn find_point_by_tag(&self, tag: &str) -> Result<Option<PointRecord>> {
        self.ensure_online()?;
        let inner = self.inner.read();
        Ok(inner
            .tags
            .get(tag)
            .and_then(|id| inner.points.get(id))
            .cloned())
    }

    async fn find_point(
        &self,
        connection_number: u32,
        address: &str,
        origin: &str,
    ) -> Result<Option<PointRecord>> {
        self.ensure_online()?;
        let inner = self.inner.read();
        let key = (connection_number, address.to_owned(), origin.to_owned());
        Ok(inner
            .addresses
            .get(&key)
            .and_then(|id| inner.points.get(id))
            .cloned())
    }

    async fn insert_point(&self, record: &PointRecord) -> Result<()> {
        self.ensure_online()?;
        let mut inner = self.inner.write();
        if inner.points.contains_key(&record.key) {
            return Err(StoreError::Duplicate(format!("_id {}", record.key)));
        }
        let index_key = (
            record.protocol_source_connection_number,
            record.protocol_source_object_address.clone(),
            record.origin.clone(),
        );
        if inner.addresses.contains_key(&index_key) {
            return Err(StoreError::Duplicate(format!(
                "connection {} address {}",
                index_key.0, index_key.1
            )));
        }
        if inner.tags.contains_key(&record.tag) {
            return Err(StoreError::Duplicate(format!("tag {}", record.tag)));
        }
        inner.addresses.insert(index_key, record.key);
        inner.tags.insert(record.tag.clone(), record.key);
        inner.points.insert(record.key, record.clone());
        trace!(key = record.key, tag = %record.tag, "point inserted");
        Ok(())
    }

    async fn bulk_update_points(&self, updates: &[PointUpdate]) -> Result<BulkWriteResult> {
        self.ensure_online()?;
        if take_one(&self.failing_bulk_writes) {
            return Err(StoreError::Unavailable("bulk write interrupted".to_owned()));
        }
        if take_one(&self.rejected_bulk_writes) {
            return Err(StoreError::Backend("document failed validation".to_owned()));
        }
        let mut result = BulkWriteResult::default();
        let mut inner = self.inner.write();
        let Collections {
            points, addresses, ..
        } = &mut *inner;
        for update in updates {
            let key = (
                update.connection_number,
                update.address.clone(),
                SUPERVISED_ORIGIN.to_owned(),
            );
            let Some(point) = addresses.get(&key).and_then(|id| points.get_mut(id)) else {
                continue;
            };
            result.matched += 1;
            if point.source_data_update.as_ref() != Some(&update.source) {
                point.source_data_update = Some(update.source.clone());
                result.modified += 1;
            }
        }
        self.bulk_writes.fetch_add(1, Ordering::SeqCst);
        debug!(
            operations = updates.len(),
            matched = result.matched,
            modified = result.modified,
            "bulk write applied"
        );
        Ok(result)
    }

    async fn insert_command(&self, command: &CommandRequest) -> Result<()> {
        self.ensure_online()?;
        {
            let mut inner = self.inner.write();
            if inner.commands.contains_key(&command.id) {
                return Err(StoreError::Duplicate(command.id.to_string()));
            }
            inner.commands.insert(command.id, command.clone());
        }
        // No subscribers is not an error.
        let _ = self.command_tx.lock().send(command.clone());
        Ok(())
    }

    async fn find_command(&self, id: Uuid) -> Result<Option<CommandRequest>> {
        self.ensure_online()?;
        Ok(self.inner.read().commands.get(&id).cloned())
    }

    async fn resolve_command(&self, id: Uuid, resolution: &CommandResolution) -> Result<bool> {
        self.ensure_online()?;
        if take_one(&self.rejected_resolutions) {
            return Err(StoreError::Backend(format!("update of command {id} not permitted")));
        }
        let mut inner = self.inner.write();
        match inner.commands.get_mut(&id) {
            Some(command) if !command.is_terminal() => {
                command.apply(resolution);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn watch_command_inserts(&self) -> Result<CommandFeed> {
        self.ensure_online()?;
        let receiver = self.command_tx.lock().subscribe();
        // A closed channel is reported once, then the stream ends.
        let feed = futures::stream::unfold(Some(receiver), |state| async move {
            let mut receiver = state?;
            match receiver.recv().await {
                Ok(command) => Some((Ok(command), Some(receiver))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    Some((Err(StoreError::FeedLagged(skipped)), Some(receiver)))
                }
                Err(broadcast::error::RecvError::Closed) => {
                    Some((Err(StoreError::FeedClosed), None))
                }
            }
        });
        Ok(feed.boxed())
    }
}
