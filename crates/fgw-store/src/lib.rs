//! ---
//! fgw_section: "03-store-client"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared store abstractions and backends."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
//! Thin access layer over the shared real-time document store.
//!
//! Components never talk to a database driver directly; they hold an
//! `Arc<dyn DocumentStore>` and use the record-level operations below.
#![warn(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fgw_common::config::TlsConfig;
use fgw_common::model::{
    CommandRequest, CommandResolution, ConnectionConfig, DriverInstanceState, PointRecord,
    SourceDataUpdate,
};
use futures::stream::BoxStream;
use uuid::Uuid;

pub mod memory;
pub mod mongo;

pub use memory::{ConnectionStats, MemoryStore};
pub use mongo::MongoStore;

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Connectivity loss or timeout; callers retry after a pause.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Insert rejected by a unique key.
    #[error("duplicate key: {0}")]
    Duplicate(String),
    /// A record could not be converted to or from its stored form.
    #[error("record encoding error: {0}")]
    Encoding(String),
    /// The backend rejected the operation; retrying the same request will not help.
    #[error("store rejected operation: {0}")]
    Backend(String),
    /// The change feed ended.
    #[error("change feed closed")]
    FeedClosed,
    /// The subscriber fell behind and notifications were lost.
    #[error("change feed lagged by {0} notifications")]
    FeedLagged(u64),
    /// The connection string names a backend this build does not provide.
    #[error("unsupported store connection string: {0}")]
    UnsupportedBackend(String),
}

impl StoreError {
    /// Whether the loop that saw this error should simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::FeedClosed | StoreError::FeedLagged(_)
        )
    }
}

/// Stream of newly inserted command records.
pub type CommandFeed = BoxStream<'static, Result<CommandRequest>>;

/// One "update-if-match" operation of a bulk write.
///
/// The filter is `(connectionNumber, address, origin = "supervised")`; records
/// with any other origin sharing the address are never touched.
#[derive(Debug, Clone, PartialEq)]
pub struct PointUpdate {
    /// Owning connection number.
    pub connection_number: u32,
    /// Field address at the source.
    pub address: String,
    /// Fields written into `sourceDataUpdate`.
    pub source: SourceDataUpdate,
}

/// Aggregate outcome of a bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    /// Operations whose filter matched a record.
    pub matched: u64,
    /// Records actually changed.
    pub modified: u64,
}

/// Heartbeat as seen by a standby instance, used to make claims conditional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatObservation {
    /// `activeNodeName` at observation time.
    pub active_node_name: String,
    /// `activeNodeKeepAliveTimeTag` at observation time.
    pub keep_alive: Option<DateTime<Utc>>,
}

impl HeartbeatObservation {
    /// Capture the heartbeat fields of an instance record.
    pub fn of(state: &DriverInstanceState) -> Self {
        Self {
            active_node_name: state.active_node_name.clone(),
            keep_alive: state.active_node_keep_alive_time_tag,
        }
    }
}

/// Record-level operations the driver runtime needs from the shared store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Lightweight liveness check.
    async fn ping(&self) -> Result<()>;

    /// Read the instance record for `(driver, instance)`.
    async fn find_instance(
        &self,
        driver: &str,
        instance: u32,
    ) -> Result<Option<DriverInstanceState>>;

    /// Insert a new instance record.
    async fn insert_instance(&self, state: &DriverInstanceState) -> Result<()>;

    /// Stamp the heartbeat if `node` is still the active node. Returns whether a record matched.
    async fn renew_heartbeat(
        &self,
        driver: &str,
        instance: u32,
        node: &str,
        at: DateTime<Utc>,
        version: &str,
    ) -> Result<bool>;

    /// Write `node` as active if the record still matches `observed`. Returns whether the claim won.
    async fn claim_active(
        &self,
        driver: &str,
        instance: u32,
        node: &str,
        observed: &HeartbeatObservation,
        at: DateTime<Utc>,
        version: &str,
    ) -> Result<bool>;

    /// Enabled connections configured for `(driver, instance)`.
    async fn find_connections(&self, driver: &str, instance: u32)
        -> Result<Vec<ConnectionConfig>>;

    /// Stamp the connection's `stats` with the node currently serving it.
    async fn update_connection_stats(
        &self,
        connection_number: u32,
        node: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// All point records of a connection with the given origin, ordered by key.
    async fn find_points(&self, connection_number: u32, origin: &str) -> Result<Vec<PointRecord>>;

    /// Point record carrying `tag`, whatever connection or origin owns it.
    async fn find_point_by_tag(&self, tag: &str) -> Result<Option<PointRecord>>;

    /// Point-in-time read by the compound filter.
    async fn find_point(
        &self,
        connection_number: u32,
        address: &str,
        origin: &str,
    ) -> Result<Option<PointRecord>>;

    /// Insert a point record. Fails with [`StoreError::Duplicate`] on key, tag or address clashes.
    async fn insert_point(&self, record: &PointRecord) -> Result<()>;

    /// Apply many update-if-match operations in one round trip, in order.
    async fn bulk_update_points(&self, updates: &[PointUpdate]) -> Result<BulkWriteResult>;

    /// Insert a command record and notify feed subscribers.
    async fn insert_command(&self, command: &CommandRequest) -> Result<()>;

    /// Read a command record.
    async fn find_command(&self, id: Uuid) -> Result<Option<CommandRequest>>;

    /// Write a terminal outcome unless the command is already terminal. Returns whether it applied.
    async fn resolve_command(&self, id: Uuid, resolution: &CommandResolution) -> Result<bool>;

    /// Subscribe to command inserts made after this call.
    async fn watch_command_inserts(&self) -> Result<CommandFeed>;
}

/// Open the backend named by a connection string.
///
/// `memory://` selects the in-process store; `mongodb://` and
/// `mongodb+srv://` open a MongoDB client configured with `tls`. Only the
/// scheme of an unsupported string is echoed back, never its credentials.
pub async fn connect(
    connection_string: &str,
    database: &str,
    tls: &TlsConfig,
) -> Result<Arc<dyn DocumentStore>> {
    let scheme = connection_string
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .unwrap_or(connection_string);
    match scheme {
        "memory" => Ok(Arc::new(MemoryStore::new(database))),
        "mongodb" | "mongodb+srv" => {
            let store = MongoStore::connect(connection_string, database, tls).await?;
            Ok(Arc::new(store))
        }
        other => Err(StoreError::UnsupportedBackend(other.to_owned())),
    }
}
