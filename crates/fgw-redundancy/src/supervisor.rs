//! ---
//! fgw_section: "07-resilience-fault-tolerance"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Active/standby coordination through the shared instance record."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fgw_common::config::RuntimeConfig;
use fgw_common::model::DriverInstanceState;
use fgw_common::DRIVER_VERSION;
use fgw_metrics::RedundancyMetrics;
use fgw_store::{DocumentStore, StoreError};
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityHandle, ActivitySwitch};
use crate::controller::{Decision, RedundancyState};
use crate::RedundancyError;

/// Which driver instance this process competes for, and under which node name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub driver: String,
    pub instance: u32,
    pub node_name: String,
}

impl InstanceIdentity {
    pub fn new(driver: impl Into<String>, instance: u32, node_name: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            instance,
            node_name: node_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedundancySettings {
    pub tick: Duration,
    pub stale_threshold: u32,
    pub demotion_jitter_min: Duration,
    pub demotion_jitter_max: Duration,
}

impl RedundancySettings {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            tick: runtime.redundancy_tick,
            stale_threshold: runtime.stale_tick_threshold,
            demotion_jitter_min: runtime.demotion_jitter_min,
            demotion_jitter_max: runtime.demotion_jitter_max,
        }
    }

    fn demotion_delay(&self) -> Duration {
        let min = self.demotion_jitter_min.as_millis() as u64;
        let max = self.demotion_jitter_max.as_millis() as u64;
        if max == 0 || min >= max {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

impl Default for RedundancySettings {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionReason {
    /// No instance record existed.
    Bootstrap,
    /// The record already named this node (e.g. after a restart).
    Recorded,
    /// The remote heartbeat stopped advancing.
    StaleHeartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Promoted(PromotionReason),
    Demoted { active_node: String },
}

/// Result of one redundancy tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub active: bool,
    pub transition: Option<Transition>,
}

/// Claims or renews the active role for one driver instance.
pub struct RedundancyController {
    identity: InstanceIdentity,
    settings: RedundancySettings,
    store: Arc<dyn DocumentStore>,
    state: RedundancyState,
    switch: ActivitySwitch,
    connections: Vec<u32>,
    metrics: Option<RedundancyMetrics>,
}

impl std::fmt::Debug for RedundancyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedundancyController")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RedundancyController {
    pub fn new(
        identity: InstanceIdentity,
        settings: RedundancySettings,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let (switch, _) = ActivitySwitch::new(Activity::default());
        Self {
            identity,
            settings,
            store,
            state: RedundancyState::default(),
            switch,
            connections: Vec::new(),
            metrics: None,
        }
    }

    /// Connection numbers whose `stats` are stamped while active.
    pub fn with_connections(mut self, connections: Vec<u32>) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_metrics(mut self, metrics: RedundancyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn handle(&self) -> ActivityHandle {
        self.switch.handle()
    }

    pub fn is_active(&self) -> bool {
        self.switch.current().active
    }

    pub fn state(&self) -> &RedundancyState {
        &self.state
    }

    /// Run one redundancy cycle.
    ///
    /// Store errors never change the published role; only fatal
    /// misconfiguration is returned as an error.
    pub async fn tick(&mut self) -> Result<TickOutcome, RedundancyError> {
        let was_active = self.is_active();
        let node = self.identity.node_name.clone();

        let record = match self
            .store
            .find_instance(&self.identity.driver, self.identity.instance)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                warn!(driver = %self.identity.driver, instance = self.identity.instance, error = %err, "redundancy tick could not read instance record");
                self.record_failure();
                return Ok(TickOutcome {
                    active: was_active,
                    transition: None,
                });
            }
        };

        let keep_protocol_running = record
            .as_ref()
            .map(|r| r.keep_protocol_running_while_inactive)
            .unwrap_or(false);
        let previous = self.state.clone();
        let decision = self
            .state
            .decide(record.as_ref(), &node, self.settings.stale_threshold)?;
        let now = Utc::now();

        let written = match &decision {
            Decision::Bootstrap => {
                let state = DriverInstanceState::bootstrap(
                    &self.identity.driver,
                    self.identity.instance,
                    &node,
                    now,
                    DRIVER_VERSION,
                );
                match self.store.insert_instance(&state).await {
                    Ok(()) => {
                        info!(driver = %self.identity.driver, instance = self.identity.instance, node = %node, "instance record created");
                        Ok(true)
                    }
                    Err(StoreError::Duplicate(_)) => Ok(false),
                    Err(err) => Err(err),
                }
            }
            Decision::Renew => {
                self.store
                    .renew_heartbeat(
                        &self.identity.driver,
                        self.identity.instance,
                        &node,
                        now,
                        DRIVER_VERSION,
                    )
                    .await
            }
            Decision::Claim(observed) => {
                self.store
                    .claim_active(
                        &self.identity.driver,
                        self.identity.instance,
                        &node,
                        observed,
                        now,
                        DRIVER_VERSION,
                    )
                    .await
            }
            Decision::Wait { stale_ticks } => {
                debug!(node = %node, stale_ticks, "remote node holds the active role");
                Ok(true)
            }
            Decision::StepDown { .. } => Ok(true),
        };

        match written {
            Err(err) => {
                warn!(driver = %self.identity.driver, instance = self.identity.instance, error = %err, "redundancy write failed; keeping previous role");
                self.state = previous;
                self.record_failure();
                return Ok(TickOutcome {
                    active: was_active,
                    transition: None,
                });
            }
            Ok(false) if matches!(decision, Decision::Claim(_) | Decision::Bootstrap) => {
                info!(node = %node, "another node won the active role first");
                self.state = RedundancyState::default();
            }
            Ok(false) => {
                debug!(node = %node, "heartbeat renewal matched no record");
            }
            Ok(true) => {}
        }

        let active = self.state.is_active();
        let transition = match (&decision, was_active, active) {
            (Decision::StepDown { active_node }, true, false) => {
                let delay = self.settings.demotion_delay();
                info!(node = %node, active_node = %active_node, delay_ms = delay.as_millis() as u64, "another node is active; returning to standby");
                tokio::time::sleep(delay).await;
                if let Some(metrics) = &self.metrics {
                    metrics.record_demotion();
                }
                Some(Transition::Demoted {
                    active_node: active_node.clone(),
                })
            }
            (_, false, true) => {
                let reason = match &decision {
                    Decision::Bootstrap => PromotionReason::Bootstrap,
                    Decision::Claim(_) => PromotionReason::StaleHeartbeat,
                    _ => PromotionReason::Recorded,
                };
                info!(node = %node, ?reason, "instance assumed the active role");
                if let Some(metrics) = &self.metrics {
                    metrics.record_claim();
                }
                Some(Transition::Promoted(reason))
            }
            _ => None,
        };

        if active {
            self.stamp_connections(&node).await;
        }

        self.switch.set(Activity {
            active,
            keep_protocol_running,
        });
        if let Some(metrics) = &self.metrics {
            metrics.set_active(active);
        }
        Ok(TickOutcome { active, transition })
    }

    /// Tick on the configured period until shutdown or a fatal error.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RedundancyError> {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(driver = %self.identity.driver, instance = self.identity.instance, "redundancy loop shutdown");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.tick().await?;
                }
            }
        }
    }

    async fn stamp_connections(&self, node: &str) {
        let now = Utc::now();
        for connection in &self.connections {
            if let Err(err) = self
                .store
                .update_connection_stats(*connection, node, now)
                .await
            {
                warn!(connection, error = %err, "failed to update connection stats");
            }
        }
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_tick_failure();
        }
    }
}
