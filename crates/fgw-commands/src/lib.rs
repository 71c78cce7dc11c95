//! ---
//! fgw_section: "06-command-dispatch"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Relays operator commands from the store to field adapters."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
//! Operator commands flow inward: the store's insert feed is forwarded over a
//! channel into a single [`CommandDispatcher`] loop, which validates each
//! command, writes it through the [`FieldAdapter`](fgw_adapters::FieldAdapter)
//! and records one terminal outcome.

pub mod dispatcher;
pub mod value_types;

pub use dispatcher::{
    CommandDispatcher, DispatchError, DispatchOutcome, DispatcherSettings, IgnoreReason,
    REASON_COMMANDS_DISABLED, REASON_EXPIRED, REASON_NOT_CONNECTED,
};
pub use value_types::{lookup, to_native, ConversionError, ValueKind};
