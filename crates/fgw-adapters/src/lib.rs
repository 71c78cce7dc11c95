//! ---
//! fgw_section: "05-field-adapters"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Field adapter interface consumed by the driver runtime."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fgw_common::model::{ConnectionConfig, ValueUpdate};
use futures::stream::BoxStream;

pub mod simulated;

pub use simulated::{GeneratorSettings, RecordedWrite, SimulatedAdapter, WriteScript};

/// Value updates produced by an open field session.
pub type UpdateStream = BoxStream<'static, ValueUpdate>;

/// Command value converted to the representation a field protocol writes.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    DateTime(DateTime<Utc>),
    String(String),
}

impl fmt::Display for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeValue::Bool(v) => write!(f, "{v}"),
            NativeValue::I8(v) => write!(f, "{v}i8"),
            NativeValue::U8(v) => write!(f, "{v}u8"),
            NativeValue::I16(v) => write!(f, "{v}i16"),
            NativeValue::U16(v) => write!(f, "{v}u16"),
            NativeValue::I32(v) => write!(f, "{v}i32"),
            NativeValue::U32(v) => write!(f, "{v}u32"),
            NativeValue::I64(v) => write!(f, "{v}i64"),
            NativeValue::U64(v) => write!(f, "{v}u64"),
            NativeValue::F32(v) => write!(f, "{v}f32"),
            NativeValue::F64(v) => write!(f, "{v}f64"),
            NativeValue::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            NativeValue::String(v) => write!(f, "{v:?}"),
        }
    }
}

/// What the field source answered to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Source accepted the write.
    pub ok: bool,
    /// Protocol status text, stored as the command's `resultDescription`.
    pub diagnostic: String,
}

impl WriteOutcome {
    pub fn accepted(diagnostic: impl Into<String>) -> Self {
        Self {
            ok: true,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn rejected(diagnostic: impl Into<String>) -> Self {
        Self {
            ok: false,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Unified interface implemented by protocol-specific adapters.
///
/// One adapter serves every connection of a driver instance; sessions are
/// addressed by connection number.
#[async_trait]
pub trait FieldAdapter: Send + Sync {
    /// Protocol driver name as stored in instance and connection records.
    fn protocol(&self) -> &str;

    /// Connect to the field source and start acquisition.
    async fn open_session(&self, connection: &ConnectionConfig) -> anyhow::Result<UpdateStream>;

    /// Stop acquisition and drop the session. Ends the stream returned by
    /// [`open_session`](Self::open_session).
    async fn close_session(&self, connection_number: u32);

    /// Whether the session of a connection is currently usable for writes.
    fn is_live(&self, connection_number: u32) -> bool;

    /// Write a value to a field address. Transport failures are `Err`; a
    /// write the source refused is `Ok` with `ok = false`.
    async fn write_command(
        &self,
        connection_number: u32,
        address: &str,
        value: NativeValue,
        timeout: Duration,
    ) -> anyhow::Result<WriteOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_native_kind() {
        assert_eq!(NativeValue::I32(42).to_string(), "42i32");
        assert_eq!(NativeValue::String("on".into()).to_string(), "\"on\"");
        assert_eq!(NativeValue::Bool(true).to_string(), "true");
    }
}
