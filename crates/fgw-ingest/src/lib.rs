//! ---
//! fgw_section: "04-ingestion"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Value-update ingestion into the shared store."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
//! Field adapters push [`ValueUpdate`](fgw_common::model::ValueUpdate)s into
//! an [`UpdateQueue`]; the [`IngestionPipeline`] drains it into bulk writes,
//! creating missing point records through the [`TagRegistry`] first.

pub mod pipeline;
pub mod queue;
pub mod registry;

pub use pipeline::{CycleOutcome, CycleStats, IngestionPipeline, PipelineSettings};
pub use queue::UpdateQueue;
pub use registry::{group_address, AddressGroups, EnsuredTag, TagRegistry};

use fgw_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("connection {0} is not served by this instance")]
    UnknownConnection(u32),
    #[error("auto-key range of connection {connection} exhausted at {last_key}")]
    KeyRangeExhausted { connection: u32, last_key: i64 },
}
