//! ---
//! fgw_section: "06-command-dispatch"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Relays operator commands from the store to field adapters."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fgw_adapters::FieldAdapter;
use fgw_common::config::RuntimeConfig;
use fgw_common::model::{CommandRequest, CommandResolution, ConnectionConfig};
use fgw_metrics::CommandMetrics;
use fgw_redundancy::ActivityHandle;
use fgw_store::{CommandFeed, DocumentStore, StoreError};
use futures::StreamExt;
use indexmap::IndexSet;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::value_types;

/// Ids remembered to suppress re-processing of repeated notifications.
const PROCESSED_CAPACITY: usize = 4096;
const FEED_BUFFER: usize = 64;

pub const REASON_EXPIRED: &str = "expired";
pub const REASON_NOT_CONNECTED: &str = "not connected";
pub const REASON_COMMANDS_DISABLED: &str = "commands disabled";

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub expiry: Duration,
    pub restart_backoff: Duration,
    pub write_timeout: Duration,
    /// Cancel commands with "not connected" while standby instead of leaving
    /// them to the active instance.
    pub cancel_while_standby: bool,
}

impl DispatcherSettings {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            expiry: runtime.command_expiry,
            restart_backoff: runtime.dispatcher_backoff,
            write_timeout: runtime.command_write_timeout,
            cancel_while_standby: runtime.cancel_commands_while_standby,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Targets a connection served by another driver instance.
    ForeignConnection,
    /// This instance is standby.
    Standby,
    /// Already seen, or resolved before we got to it.
    AlreadyHandled,
}

/// How one observed command ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Ignored(IgnoreReason),
    Cancelled(String),
    Delivered { ack: bool, description: String },
}

impl DispatchOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            DispatchOutcome::Ignored(_) => "ignored",
            DispatchOutcome::Cancelled(reason) => match reason.as_str() {
                REASON_EXPIRED => "expired",
                REASON_NOT_CONNECTED => "not_connected",
                REASON_COMMANDS_DISABLED => "commands_disabled",
                _ => "invalid_value",
            },
            DispatchOutcome::Delivered { ack: true, .. } => "acked",
            DispatchOutcome::Delivered { ack: false, .. } => "not_acked",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("command feed ended")]
    FeedEnded,
}

struct Forwarder(JoinHandle<()>);

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Watches command inserts and resolves each one exactly once.
pub struct CommandDispatcher {
    settings: DispatcherSettings,
    store: Arc<dyn DocumentStore>,
    adapter: Arc<dyn FieldAdapter>,
    connections: HashMap<u32, ConnectionConfig>,
    activity: ActivityHandle,
    processed: IndexSet<Uuid>,
    metrics: Option<CommandMetrics>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("settings", &self.settings)
            .field("protocol", &self.adapter.protocol())
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        store: Arc<dyn DocumentStore>,
        adapter: Arc<dyn FieldAdapter>,
        connections: &[ConnectionConfig],
        activity: ActivityHandle,
    ) -> Self {
        Self {
            settings,
            store,
            adapter,
            connections: connections
                .iter()
                .map(|c| (c.protocol_connection_number, c.clone()))
                .collect(),
            activity,
            processed: IndexSet::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: CommandMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle one observed command. Only store errors while writing the
    /// outcome are returned; everything else ends in an outcome.
    pub async fn process(&mut self, command: CommandRequest) -> Result<DispatchOutcome, DispatchError> {
        let outcome = self.decide_and_resolve(&command).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(outcome.metric_label());
        }
        Ok(outcome)
    }

    async fn decide_and_resolve(&mut self, command: &CommandRequest) -> Result<DispatchOutcome, DispatchError> {
        let number = command.protocol_source_connection_number;
        let address = command.protocol_source_object_address.as_str();

        let Some(connection) = self.connections.get(&number) else {
            debug!(connection = number, id = %command.id, "command for another driver instance ignored");
            return Ok(DispatchOutcome::Ignored(IgnoreReason::ForeignConnection));
        };
        if self.processed.contains(&command.id) || command.is_terminal() {
            return Ok(DispatchOutcome::Ignored(IgnoreReason::AlreadyHandled));
        }
        let active = self.activity.is_active();
        if !active && !self.settings.cancel_while_standby {
            debug!(connection = number, id = %command.id, "standby instance leaves command to the active node");
            return Ok(DispatchOutcome::Ignored(IgnoreReason::Standby));
        }

        let age = Utc::now().signed_duration_since(command.time_tag);
        if matches!(age.to_std(), Ok(age) if age > self.settings.expiry) {
            info!(connection = %connection.name, address, value = command.value, age_s = age.num_seconds(), "command expired");
            return self.cancel(command, REASON_EXPIRED).await;
        }

        if !connection.commands_enabled {
            info!(connection = %connection.name, address, "commands disabled on connection");
            return self.cancel(command, REASON_COMMANDS_DISABLED).await;
        }
        if !active || !self.adapter.is_live(number) {
            info!(connection = %connection.name, address, active, "connection not live; command cancelled");
            return self.cancel(command, REASON_NOT_CONNECTED).await;
        }

        let value = match value_types::to_native(command) {
            Ok(value) => value,
            Err(err) => {
                warn!(connection = %connection.name, address, error = %err, "command value not convertible");
                return self.cancel(command, err.cancel_reason()).await;
            }
        };

        info!(connection = %connection.name, address, %value, "writing command");
        let timeout = self.settings.write_timeout;
        let (ack, description) = match tokio::time::timeout(
            timeout,
            self.adapter.write_command(number, address, value, timeout),
        )
        .await
        {
            Ok(Ok(outcome)) => (outcome.ok, outcome.diagnostic),
            Ok(Err(err)) => (false, format!("{err:#}")),
            Err(_) => (false, format!("write timed out after {}ms", timeout.as_millis())),
        };

        let resolution = CommandResolution::Delivered {
            ack,
            description: description.clone(),
            at: Utc::now(),
        };
        self.resolve(command, &resolution).await?;
        info!(connection = number, address, ack, result = %description, "command delivered");
        Ok(DispatchOutcome::Delivered { ack, description })
    }

    async fn cancel(&mut self, command: &CommandRequest, reason: &str) -> Result<DispatchOutcome, DispatchError> {
        self.resolve(command, &CommandResolution::cancelled(reason)).await?;
        Ok(DispatchOutcome::Cancelled(reason.to_owned()))
    }

    async fn resolve(&mut self, command: &CommandRequest, resolution: &CommandResolution) -> Result<(), DispatchError> {
        let applied = self.store.resolve_command(command.id, resolution).await?;
        if !applied {
            debug!(id = %command.id, "command was already resolved elsewhere");
        }
        if self.processed.len() >= PROCESSED_CAPACITY {
            self.processed.shift_remove_index(0);
        }
        self.processed.insert(command.id);
        Ok(())
    }

    /// Subscribe and process until shutdown. Connectivity errors and a lost
    /// feed restart the subscription; a rejected outcome write or an
    /// undecodable notification only skips that one command.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            match self.subscribe_and_process(&mut shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    warn!(error = %err, backoff_ms = self.settings.restart_backoff.as_millis() as u64, "command subscription failed; restarting");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_restart();
                    }
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.settings.restart_backoff) => {}
                    }
                }
            }
        }
        debug!("command dispatcher stopped");
    }

    async fn subscribe_and_process(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), DispatchError> {
        let feed = self.store.watch_command_inserts().await?;
        let (tx, mut rx) = mpsc::channel(FEED_BUFFER);
        let _forwarder = Forwarder(tokio::spawn(forward(feed, tx)));
        debug!(protocol = %self.adapter.protocol(), "command subscription open");

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                received = rx.recv() => match received {
                    Some(Ok(command)) => {
                        let id = command.id;
                        match self.process(command).await {
                            Ok(_) => {}
                            Err(DispatchError::Store(err)) if !err.is_transient() => {
                                error!(%id, error = %err, "store rejected command outcome; command skipped");
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    Some(Err(StoreError::Encoding(reason))) => {
                        warn!(error = %reason, "undecodable command notification skipped");
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(DispatchError::FeedEnded),
                },
            }
        }
    }
}

async fn forward(mut feed: CommandFeed, tx: mpsc::Sender<Result<CommandRequest, StoreError>>) {
    while let Some(item) = feed.next().await {
        if tx.send(item).await.is_err() {
            break;
        }
    }
}
