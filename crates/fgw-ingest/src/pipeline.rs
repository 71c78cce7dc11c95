//! ---
//! fgw_section: "04-ingestion"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Value-update ingestion into the shared store."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use fgw_common::config::RuntimeConfig;
use fgw_common::model::ValueUpdate;
use fgw_metrics::IngestMetrics;
use fgw_redundancy::ActivityHandle;
use fgw_store::{DocumentStore, PointUpdate, StoreError};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use crate::queue::UpdateQueue;
use crate::registry::TagRegistry;
use crate::IngestError;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub batch_budget: Duration,
    pub idle_sleep: Duration,
    pub store_retry: Duration,
}

impl PipelineSettings {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            batch_size: runtime.batch_size.max(1),
            batch_budget: runtime.batch_budget,
            idle_sleep: runtime.idle_sleep,
            store_retry: runtime.store_retry,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

/// Per-cycle statistics, logged after every flushed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleStats {
    pub items: usize,
    pub created: usize,
    pub skipped: usize,
    pub matched: u64,
    pub modified: u64,
    pub remaining: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing queued.
    Idle,
    /// Instance is standby; queue and registry were cleared.
    Standby,
    /// Liveness check or registry priming failed; nothing was drained.
    StoreUnavailable,
    Flushed(CycleStats),
    /// The batch was aborted and put back at the head of the queue.
    Failed { requeued: usize, trimmed: usize },
    /// The store rejected the batch outright; it was dropped, not retried.
    Discarded { discarded: usize },
}

/// Drains the update queue into bulk writes while this instance is active.
pub struct IngestionPipeline {
    settings: PipelineSettings,
    queue: Arc<UpdateQueue>,
    registry: TagRegistry,
    store: Arc<dyn DocumentStore>,
    activity: ActivityHandle,
    was_active: bool,
    metrics: Option<IngestMetrics>,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("settings", &self.settings)
            .field("queued", &self.queue.len())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    pub fn new(
        settings: PipelineSettings,
        queue: Arc<UpdateQueue>,
        registry: TagRegistry,
        store: Arc<dyn DocumentStore>,
        activity: ActivityHandle,
    ) -> Self {
        Self {
            settings,
            queue,
            registry,
            store,
            activity,
            was_active: false,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Producer side, shared with the field adapters.
    pub fn queue(&self) -> Arc<UpdateQueue> {
        self.queue.clone()
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    /// One pass of the drain loop.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if !self.activity.is_active() {
            let discarded = self.queue.clear();
            if self.was_active || self.registry.is_primed() {
                self.registry.clear();
                info!(discarded, "instance is standby; ingestion state cleared");
            }
            self.was_active = false;
            return CycleOutcome::Standby;
        }

        if let Err(err) = self.store.ping().await {
            warn!(error = %err, queued = self.queue.len(), "store liveness check failed; not draining");
            return CycleOutcome::StoreUnavailable;
        }
        if !self.registry.is_primed() {
            if let Err(err) = self.registry.prime().await {
                warn!(error = %err, "could not load known points; not draining");
                return CycleOutcome::StoreUnavailable;
            }
        }
        self.was_active = true;

        if self.queue.is_empty() {
            return CycleOutcome::Idle;
        }
        self.drain_batch().await
    }

    async fn drain_batch(&mut self) -> CycleOutcome {
        let started = Instant::now();
        let mut taken: Vec<ValueUpdate> = Vec::with_capacity(self.settings.batch_size.min(self.queue.len()));
        let mut operations = Vec::with_capacity(taken.capacity());
        let mut stats = CycleStats::default();

        while taken.len() < self.settings.batch_size && started.elapsed() < self.settings.batch_budget {
            let Some(update) = self.queue.pop() else {
                break;
            };
            let Some(auto_create) = self.registry.auto_create(update.connection_number) else {
                debug!(connection = update.connection_number, address = %update.address, "update for unknown connection skipped");
                stats.skipped += 1;
                continue;
            };

            if auto_create && !self.registry.is_known(update.connection_number, &update.address) {
                match self.registry.ensure_tag(&update).await {
                    Ok(ensured) => {
                        if ensured.created {
                            stats.created += 1;
                        }
                    }
                    Err(IngestError::Store(err)) if err.is_transient() => {
                        taken.push(update);
                        return self.abort(taken, &err);
                    }
                    Err(err) => {
                        error!(connection = update.connection_number, address = %update.address, error = %err, "point record could not be created; update skipped");
                        stats.skipped += 1;
                        continue;
                    }
                }
            }

            operations.push(PointUpdate {
                connection_number: update.connection_number,
                address: update.address.clone(),
                source: update.to_source_data(),
            });
            taken.push(update);
        }

        if operations.is_empty() {
            stats.remaining = self.queue.len();
            stats.elapsed = started.elapsed();
            return CycleOutcome::Flushed(stats);
        }

        match self.store.bulk_update_points(&operations).await {
            Ok(result) => {
                stats.items = operations.len();
                stats.matched = result.matched;
                stats.modified = result.modified;
                stats.remaining = self.queue.len();
                stats.elapsed = started.elapsed();
                if let Some(metrics) = &self.metrics {
                    metrics.record_batch(stats.items, stats.matched, stats.modified, stats.elapsed);
                }
                info!(
                    items = stats.items,
                    created = stats.created,
                    skipped = stats.skipped,
                    matched = stats.matched,
                    modified = stats.modified,
                    remaining = stats.remaining,
                    dropped_total = self.queue.dropped_total(),
                    elapsed_ms = stats.elapsed.as_millis() as u64,
                    "bulk write flushed"
                );
                CycleOutcome::Flushed(stats)
            }
            Err(err) => self.abort(taken, &err),
        }
    }

    /// Transient failures put the batch back; anything else would fail the
    /// same way on every retry and wedge the queue, so the batch is dropped.
    fn abort(&self, batch: Vec<ValueUpdate>, err: &StoreError) -> CycleOutcome {
        if let Some(metrics) = &self.metrics {
            metrics.record_write_failure();
        }
        if !err.is_transient() {
            let discarded = batch.len();
            error!(error = %err, discarded, remaining = self.queue.len(), "store rejected batch; updates dropped");
            return CycleOutcome::Discarded { discarded };
        }
        let requeued = batch.len();
        let trimmed = self.queue.requeue_front(batch);
        warn!(error = %err, requeued, trimmed, "batch aborted; retrying after pause");
        CycleOutcome::Failed { requeued, trimmed }
    }

    /// Drain until shutdown. A cycle already in progress always completes.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }
            let pause = match self.run_cycle().await {
                CycleOutcome::Flushed(_) | CycleOutcome::Discarded { .. } => {
                    tokio::task::yield_now().await;
                    continue;
                }
                CycleOutcome::Idle | CycleOutcome::Standby => self.settings.idle_sleep,
                CycleOutcome::StoreUnavailable | CycleOutcome::Failed { .. } => {
                    self.settings.store_retry
                }
            };
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!(queued = self.queue.len(), "ingestion loop stopped");
    }
}
