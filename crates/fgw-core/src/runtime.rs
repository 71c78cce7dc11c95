//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Primary orchestration and lifecycle management."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;

use fgw_adapters::FieldAdapter;
use fgw_commands::{CommandDispatcher, DispatcherSettings};
use fgw_common::config::DriverConfig;
use fgw_common::model::ConnectionConfig;
use fgw_ingest::{IngestionPipeline, PipelineSettings, TagRegistry, UpdateQueue};
use fgw_metrics::{CommandMetrics, IngestMetrics, RedundancyMetrics, SharedRegistry};
use fgw_redundancy::{
    ActivityHandle, InstanceIdentity, RedundancyController, RedundancyError, RedundancySettings,
};
use fgw_store::{DocumentStore, StoreError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::sessions::SessionManager;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no enabled connections configured for driver {driver} instance {instance}")]
    NoConnections { driver: String, instance: u32 },
    #[error("could not load connections: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Redundancy(#[from] RedundancyError),
    #[error("{task} task ended abnormally: {reason}")]
    Task { task: &'static str, reason: String },
    #[error(transparent)]
    Metrics(#[from] anyhow::Error),
}

impl RuntimeError {
    /// Misconfiguration that a restart will not fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::NoConnections { .. } | RuntimeError::Redundancy(_)
        )
    }
}

/// One driver instance: the redundancy, ingestion, dispatch and session
/// loops over a single store and field adapter.
pub struct DriverRuntime {
    config: Arc<DriverConfig>,
    instance: u32,
    store: Arc<dyn DocumentStore>,
    adapter: Arc<dyn FieldAdapter>,
    metrics_registry: Option<SharedRegistry>,
}

impl std::fmt::Debug for DriverRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRuntime")
            .field("driver", &self.adapter.protocol())
            .field("instance", &self.instance)
            .field("node", &self.config.node_name)
            .finish_non_exhaustive()
    }
}

impl DriverRuntime {
    pub fn new(
        config: DriverConfig,
        instance: u32,
        store: Arc<dyn DocumentStore>,
        adapter: Arc<dyn FieldAdapter>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            instance,
            store,
            adapter,
            metrics_registry: None,
        }
    }

    pub fn with_metrics(mut self, registry: SharedRegistry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    pub fn driver(&self) -> &str {
        self.adapter.protocol()
    }

    /// Enabled connections of this driver instance: the config file list when
    /// it names any, else the store's connection records.
    pub async fn load_connections(&self) -> Result<Vec<ConnectionConfig>, RuntimeError> {
        let driver = self.driver();
        let configured: Vec<ConnectionConfig> = self
            .config
            .connections
            .iter()
            .filter(|c| c.protocol_driver == driver && c.protocol_driver_instance_number == self.instance)
            .cloned()
            .collect();
        let source = if configured.is_empty() { "store" } else { "config" };
        let candidates = if configured.is_empty() {
            self.store.find_connections(driver, self.instance).await?
        } else {
            configured
        };

        let connections: Vec<ConnectionConfig> = candidates.into_iter().filter(|c| c.enabled).collect();
        if connections.is_empty() {
            return Err(RuntimeError::NoConnections {
                driver: driver.to_owned(),
                instance: self.instance,
            });
        }
        for connection in &connections {
            info!(
                connection = connection.protocol_connection_number,
                name = %connection.name,
                source,
                auto_create = connection.auto_create_tags,
                commands = connection.commands_enabled,
                "connection loaded"
            );
        }
        Ok(connections)
    }

    /// Load connections and spawn every loop.
    pub async fn start(self) -> Result<RuntimeHandle, RuntimeError> {
        let connections = self.load_connections().await?;
        let runtime = &self.config.runtime;
        let driver = self.driver().to_owned();

        let (ingest_metrics, command_metrics, redundancy_metrics) = match &self.metrics_registry {
            Some(registry) => (
                Some(IngestMetrics::new(registry)?),
                Some(CommandMetrics::new(registry)?),
                Some(RedundancyMetrics::new(registry)?),
            ),
            None => (None, None, None),
        };

        let (shutdown_tx, _) = broadcast::channel(4);

        let mut controller = RedundancyController::new(
            InstanceIdentity::new(&driver, self.instance, &self.config.node_name),
            RedundancySettings::from_runtime(runtime),
            self.store.clone(),
        )
        .with_connections(connections.iter().map(|c| c.protocol_connection_number).collect());
        if let Some(metrics) = redundancy_metrics {
            controller = controller.with_metrics(metrics);
        }
        let activity = controller.handle();

        let mut queue = UpdateQueue::new(runtime.queue_bound);
        let mut registry = TagRegistry::new(
            &driver,
            &connections,
            runtime.auto_key_multiplier,
            self.store.clone(),
        );
        if let Some(metrics) = &ingest_metrics {
            queue = queue.with_metrics(metrics.clone());
            registry = registry.with_metrics(metrics.clone());
        }
        let queue = Arc::new(queue);
        let mut pipeline = IngestionPipeline::new(
            PipelineSettings::from_runtime(runtime),
            queue.clone(),
            registry,
            self.store.clone(),
            activity.clone(),
        );
        if let Some(metrics) = ingest_metrics {
            pipeline = pipeline.with_metrics(metrics);
        }

        let mut dispatcher = CommandDispatcher::new(
            DispatcherSettings::from_runtime(runtime),
            self.store.clone(),
            self.adapter.clone(),
            &connections,
            activity.clone(),
        );
        if let Some(metrics) = command_metrics {
            dispatcher = dispatcher.with_metrics(metrics);
        }

        let sessions = SessionManager::new(
            self.adapter.clone(),
            connections.clone(),
            queue.clone(),
            activity.clone(),
            runtime.redundancy_tick,
        );

        let redundancy = tokio::spawn(controller.run(shutdown_tx.subscribe()));
        let workers = vec![
            ("ingestion", tokio::spawn(pipeline.run(shutdown_tx.subscribe()))),
            ("commands", tokio::spawn(dispatcher.run(shutdown_tx.subscribe()))),
            ("sessions", tokio::spawn(sessions.run(shutdown_tx.subscribe()))),
        ];

        info!(
            driver = %driver,
            instance = self.instance,
            node = %self.config.node_name,
            connections = connections.len(),
            "driver runtime started"
        );

        Ok(RuntimeHandle {
            shutdown: shutdown_tx,
            activity,
            queue,
            connections,
            redundancy: Some(redundancy),
            workers,
        })
    }
}

/// Lifecycle control for a started [`DriverRuntime`].
#[derive(Debug)]
pub struct RuntimeHandle {
    shutdown: broadcast::Sender<()>,
    activity: ActivityHandle,
    queue: Arc<UpdateQueue>,
    connections: Vec<ConnectionConfig>,
    redundancy: Option<JoinHandle<Result<(), RedundancyError>>>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl RuntimeHandle {
    pub fn activity(&self) -> ActivityHandle {
        self.activity.clone()
    }

    pub fn is_active(&self) -> bool {
        self.activity.is_active()
    }

    /// Producer side of the ingestion queue.
    pub fn queue(&self) -> Arc<UpdateQueue> {
        self.queue.clone()
    }

    pub fn connections(&self) -> &[ConnectionConfig] {
        &self.connections
    }

    /// Resolve when the redundancy loop stops on its own, which only happens
    /// on fatal misconfiguration.
    pub async fn wait(&mut self) -> Result<(), RuntimeError> {
        let Some(task) = self.redundancy.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.redundancy = None;
        let result = flatten(joined);
        if let Err(err) = &result {
            error!(error = %err, "redundancy loop stopped");
        }
        result
    }

    /// Signal every loop to stop and wait for them. In-flight cycles complete.
    pub async fn shutdown(mut self) -> Result<(), RuntimeError> {
        let _ = self.shutdown.send(());
        let result = match self.redundancy.take() {
            Some(task) => flatten(task.await),
            None => Ok(()),
        };
        for (task, handle) in self.workers.drain(..) {
            if let Err(err) = handle.await {
                warn!(task, error = %err, "task ended abnormally");
            }
        }
        info!("driver runtime stopped");
        result
    }
}

fn flatten(
    joined: Result<Result<(), RedundancyError>, tokio::task::JoinError>,
) -> Result<(), RuntimeError> {
    match joined {
        Ok(result) => result.map_err(RuntimeError::from),
        Err(err) => Err(RuntimeError::Task {
            task: "redundancy",
            reason: err.to_string(),
        }),
    }
}
