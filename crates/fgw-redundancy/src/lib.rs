//! ---
//! fgw_section: "07-resilience-fault-tolerance"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Active/standby coordination through the shared instance record."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
//! Redundancy management for driver instances.
//!
//! Every candidate process runs a [`RedundancyController`] tick loop against
//! the same `protocolDriverInstances` record. The controller owns the
//! "is active" flag; everything else observes it through an [`ActivityHandle`].

mod activity;
mod controller;
mod supervisor;

pub use activity::{Activity, ActivityHandle, ActivitySwitch};
pub use controller::{Decision, RedundancyState};
pub use supervisor::{
    InstanceIdentity, PromotionReason, RedundancyController, RedundancySettings, TickOutcome,
    Transition,
};

/// Fatal misconfiguration detected while reading the instance record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RedundancyError {
    #[error("driver instance {driver}#{instance} is disabled")]
    InstanceDisabled { driver: String, instance: u32 },
    #[error("node '{node}' is not in the allow-list of driver instance {driver}#{instance}")]
    NodeNotAllowed {
        driver: String,
        instance: u32,
        node: String,
    },
}
