//! ---
//! fgw_section: "06-command-dispatch"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Command value-type lookup and native value conversion."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use fgw_adapters::NativeValue;
use fgw_common::model::CommandRequest;
use once_cell::sync::Lazy;

/// Native kind a command value is written as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    DateTime,
    String,
}

/// Type names used by OPC UA/DA, IEC 61131 PLC tags and the platform UI.
static TYPE_TABLE: Lazy<HashMap<&'static str, ValueKind>> = Lazy::new(|| {
    use ValueKind as K;
    [
        ("boolean", K::Bool),
        ("bool", K::Bool),
        ("digital", K::Bool),
        ("sbyte", K::I8),
        ("sint", K::I8),
        ("int8", K::I8),
        ("byte", K::U8),
        ("usint", K::U8),
        ("uint8", K::U8),
        ("int16", K::I16),
        ("int", K::I16),
        ("short", K::I16),
        ("uint16", K::U16),
        ("uint", K::U16),
        ("word", K::U16),
        ("ushort", K::U16),
        ("int32", K::I32),
        ("dint", K::I32),
        ("integer", K::I32),
        ("uint32", K::U32),
        ("udint", K::U32),
        ("dword", K::U32),
        ("int64", K::I64),
        ("lint", K::I64),
        ("long", K::I64),
        ("uint64", K::U64),
        ("ulint", K::U64),
        ("lword", K::U64),
        ("float", K::F32),
        ("real", K::F32),
        ("single", K::F32),
        ("float32", K::F32),
        ("double", K::F64),
        ("lreal", K::F64),
        ("float64", K::F64),
        ("analog", K::F64),
        ("datetime", K::DateTime),
        ("date_and_time", K::DateTime),
        ("dt", K::DateTime),
        ("string", K::String),
        ("char", K::String),
        ("text", K::String),
    ]
    .into_iter()
    .collect()
});

/// Resolve a type hint, case-insensitively. An empty hint means `double`.
pub fn lookup(hint: &str) -> Option<ValueKind> {
    let hint = hint.trim();
    if hint.is_empty() {
        return Some(ValueKind::F64);
    }
    TYPE_TABLE.get(hint.to_ascii_lowercase().as_str()).copied()
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    #[error("unknown value type '{0}'")]
    UnknownType(String),
    #[error("value {value} does not fit {kind:?}")]
    OutOfRange { kind: ValueKind, value: f64 },
    #[error("'{0}' is not a valid timestamp")]
    InvalidTimestamp(String),
}

impl ConversionError {
    /// `cancelReason` written for a command that cannot be converted.
    pub fn cancel_reason(&self) -> &'static str {
        match self {
            ConversionError::UnknownType(_) => "invalid value type",
            ConversionError::OutOfRange { .. } | ConversionError::InvalidTimestamp(_) => {
                "value out of range"
            }
        }
    }
}

/// Convert a command's value to the native representation of its declared type.
pub fn to_native(command: &CommandRequest) -> Result<NativeValue, ConversionError> {
    let kind = lookup(&command.protocol_source_asdu)
        .ok_or_else(|| ConversionError::UnknownType(command.protocol_source_asdu.clone()))?;
    convert(kind, command.value, &command.value_string)
}

pub fn convert(kind: ValueKind, value: f64, text: &str) -> Result<NativeValue, ConversionError> {
    let out_of_range = || ConversionError::OutOfRange { kind, value };
    Ok(match kind {
        ValueKind::Bool => NativeValue::Bool(value != 0.0),
        ValueKind::I8 => NativeValue::I8(integral(value).ok_or_else(out_of_range)?),
        ValueKind::U8 => NativeValue::U8(integral(value).ok_or_else(out_of_range)?),
        ValueKind::I16 => NativeValue::I16(integral(value).ok_or_else(out_of_range)?),
        ValueKind::U16 => NativeValue::U16(integral(value).ok_or_else(out_of_range)?),
        ValueKind::I32 => NativeValue::I32(integral(value).ok_or_else(out_of_range)?),
        ValueKind::U32 => NativeValue::U32(integral(value).ok_or_else(out_of_range)?),
        ValueKind::I64 => NativeValue::I64(integral(value).ok_or_else(out_of_range)?),
        ValueKind::U64 => NativeValue::U64(integral(value).ok_or_else(out_of_range)?),
        ValueKind::F32 => {
            if !value.is_finite() || value.abs() > f64::from(f32::MAX) {
                return Err(out_of_range());
            }
            NativeValue::F32(value as f32)
        }
        ValueKind::F64 => {
            if !value.is_finite() {
                return Err(out_of_range());
            }
            NativeValue::F64(value)
        }
        ValueKind::DateTime => NativeValue::DateTime(timestamp(value, text)?),
        ValueKind::String => NativeValue::String(if text.is_empty() {
            value.to_string()
        } else {
            text.to_owned()
        }),
    })
}

/// Round to nearest and narrow, rejecting anything the target cannot hold.
fn integral<T: TryFrom<i128>>(value: f64) -> Option<T> {
    if !value.is_finite() {
        return None;
    }
    let rounded = value.round();
    if rounded < i128::MIN as f64 || rounded > i128::MAX as f64 {
        return None;
    }
    T::try_from(rounded as i128).ok()
}

/// RFC 3339 text when present, otherwise milliseconds since the epoch.
fn timestamp(value: f64, text: &str) -> Result<DateTime<Utc>, ConversionError> {
    let text = text.trim();
    if !text.is_empty() && text.parse::<f64>().is_err() {
        return DateTime::parse_from_rfc3339(text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| ConversionError::InvalidTimestamp(text.to_owned()));
    }
    integral::<i64>(value)
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .ok_or_else(|| ConversionError::InvalidTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_case_insensitively() {
        assert_eq!(lookup("Int32"), Some(ValueKind::I32));
        assert_eq!(lookup("DINT"), Some(ValueKind::I32));
        assert_eq!(lookup("LREAL"), Some(ValueKind::F64));
        assert_eq!(lookup(""), Some(ValueKind::F64));
        assert_eq!(lookup("quaternion"), None);
    }

    #[test]
    fn int32_command_converts_exactly() {
        let command = CommandRequest::new(1, "ns=2;s=Setpoint", "int32", 42.0);
        assert_eq!(to_native(&command), Ok(NativeValue::I32(42)));
    }

    #[test]
    fn narrowing_rejects_out_of_range() {
        assert_eq!(convert(ValueKind::U8, 255.4, ""), Ok(NativeValue::U8(255)));
        let err = convert(ValueKind::U8, 256.0, "").unwrap_err();
        assert_eq!(err.cancel_reason(), "value out of range");
        assert!(convert(ValueKind::U16, -1.0, "").is_err());
        assert!(convert(ValueKind::I32, f64::NAN, "").is_err());
        assert!(convert(ValueKind::F32, 1e300, "").is_err());
    }

    #[test]
    fn boolean_is_nonzero() {
        assert_eq!(convert(ValueKind::Bool, 0.0, ""), Ok(NativeValue::Bool(false)));
        assert_eq!(convert(ValueKind::Bool, -3.0, ""), Ok(NativeValue::Bool(true)));
    }

    #[test]
    fn strings_prefer_the_text_field() {
        assert_eq!(
            convert(ValueKind::String, 0.0, "OPEN"),
            Ok(NativeValue::String("OPEN".into()))
        );
        assert_eq!(
            convert(ValueKind::String, 1.5, ""),
            Ok(NativeValue::String("1.5".into()))
        );
    }

    #[test]
    fn timestamps_from_text_or_millis() {
        let parsed = convert(ValueKind::DateTime, 0.0, "2024-03-01T12:00:00Z").unwrap();
        assert_eq!(
            parsed,
            NativeValue::DateTime(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
        let millis = convert(ValueKind::DateTime, 1_000.0, "1000").unwrap();
        assert_eq!(millis, NativeValue::DateTime(Utc.timestamp_millis_opt(1_000).unwrap()));
        assert!(convert(ValueKind::DateTime, 0.0, "yesterday").is_err());
    }

    #[test]
    fn unknown_type_cancels_as_invalid() {
        let command = CommandRequest::new(1, "a", "matrix", 1.0);
        let err = to_native(&command).unwrap_err();
        assert_eq!(err.cancel_reason(), "invalid value type");
    }
}
