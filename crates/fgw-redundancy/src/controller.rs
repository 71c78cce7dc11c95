//! ---
//! fgw_section: "07-resilience-fault-tolerance"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Active/standby coordination through the shared instance record."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use fgw_common::model::DriverInstanceState;
use fgw_store::HeartbeatObservation;

use crate::RedundancyError;

/// Role of this instance, with the stale-heartbeat counter as explicit state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedundancyState {
    Standby {
        last_seen: Option<HeartbeatObservation>,
        stale_ticks: u32,
    },
    Active,
}

impl Default for RedundancyState {
    fn default() -> Self {
        RedundancyState::Standby {
            last_seen: None,
            stale_ticks: 0,
        }
    }
}

/// What a tick must write to the store, decided from one read of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No record exists; create it with this node active.
    Bootstrap,
    /// This node is the recorded active node; stamp the heartbeat.
    Renew,
    /// The remote heartbeat went stale; take over if the record still matches.
    Claim(HeartbeatObservation),
    /// Remote node is alive (or not yet stale).
    Wait { stale_ticks: u32 },
    /// Another node took over while this one was active.
    StepDown { active_node: String },
}

impl RedundancyState {
    pub fn is_active(&self) -> bool {
        matches!(self, RedundancyState::Active)
    }

    /// Advance the state machine assuming the resulting write succeeds.
    ///
    /// Callers keep a copy of the previous state to roll back when the store
    /// write fails.
    pub fn decide(
        &mut self,
        record: Option<&DriverInstanceState>,
        node: &str,
        stale_threshold: u32,
    ) -> Result<Decision, RedundancyError> {
        let Some(record) = record else {
            *self = RedundancyState::Active;
            return Ok(Decision::Bootstrap);
        };

        if !record.enabled {
            return Err(RedundancyError::InstanceDisabled {
                driver: record.protocol_driver.clone(),
                instance: record.protocol_driver_instance_number,
            });
        }
        if !record.allows_node(node) {
            return Err(RedundancyError::NodeNotAllowed {
                driver: record.protocol_driver.clone(),
                instance: record.protocol_driver_instance_number,
                node: node.to_owned(),
            });
        }

        if record.active_node_name == node {
            *self = RedundancyState::Active;
            return Ok(Decision::Renew);
        }

        let observed = HeartbeatObservation::of(record);
        match self {
            RedundancyState::Active => {
                *self = RedundancyState::Standby {
                    last_seen: Some(observed),
                    stale_ticks: 0,
                };
                Ok(Decision::StepDown {
                    active_node: record.active_node_name.clone(),
                })
            }
            RedundancyState::Standby {
                last_seen,
                stale_ticks,
            } => {
                if last_seen.as_ref() == Some(&observed) {
                    *stale_ticks += 1;
                } else {
                    *last_seen = Some(observed.clone());
                    *stale_ticks = 0;
                }
                if *stale_ticks >= stale_threshold {
                    *self = RedundancyState::Active;
                    Ok(Decision::Claim(observed))
                } else {
                    Ok(Decision::Wait {
                        stale_ticks: *stale_ticks,
                    })
                }
            }
        }
    }
}
