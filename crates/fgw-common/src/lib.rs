//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared primitives and utilities for the driver runtime."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
//! Core shared primitives for the FGW driver workspace.
//! This crate exposes configuration loading, logging bootstrap, and the
//! document model exchanged with the shared real-time store.

pub mod config;
pub mod logging;
pub mod model;

pub use config::{
    DriverConfig, LoadedDriverConfig, LoggingConfig, MetricsConfig, RuntimeConfig, TlsConfig,
};
pub use logging::{init_tracing, verbosity_directive, LogFormat};
pub use model::{
    CauseOfTransmission, CommandRequest, CommandResolution, ConnectionConfig, ConnectionTuning,
    DriverInstanceState, FaultFlags, PointKind, PointRecord, SourceDataUpdate, ValueUpdate,
};

/// Version reported into the instance record by every driver process.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
