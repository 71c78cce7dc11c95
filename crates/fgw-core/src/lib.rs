//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Primary orchestration and lifecycle management."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
//! Core driver runtime, parameterised over any [`FieldAdapter`](fgw_adapters::FieldAdapter).

pub mod runtime;
pub mod sessions;

pub use runtime::{DriverRuntime, RuntimeError, RuntimeHandle};
pub use sessions::SessionManager;
