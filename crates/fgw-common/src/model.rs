//! ---
//! fgw_section: "02-data-model"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Documents exchanged with the shared real-time store."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
//! Document model shared by every driver component.
//!
//! Field names are serialised in camelCase so that records written by these
//! drivers match the documents other platform processes read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const REALTIME_DATA_COLLECTION: &str = "realtimeData";
pub const INSTANCES_COLLECTION: &str = "protocolDriverInstances";
pub const CONNECTIONS_COLLECTION: &str = "protocolConnections";
pub const COMMANDS_COLLECTION: &str = "commandsQueue";

/// Origin of point records owned by the acquisition side of a driver.
pub const SUPERVISED_ORIGIN: &str = "supervised";
/// Placeholder used when an address has no parent group.
pub const ROOT_GROUP: &str = "@root";

fn default_true() -> bool {
    true
}

fn default_separator() -> String {
    ".".to_owned()
}

/// Static configuration for one link to a field source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub protocol_driver: String,
    pub protocol_driver_instance_number: u32,
    pub protocol_connection_number: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub commands_enabled: bool,
    #[serde(default)]
    pub auto_create_tags: bool,
    /// Separator used to split field addresses into group path and leaf.
    #[serde(default = "default_separator")]
    pub hierarchy_separator: String,
    #[serde(default, rename = "endpointURLs")]
    pub endpoint_urls: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(flatten)]
    pub tuning: ConnectionTuning,
    /// Protocol-specific settings, opaque to the runtime.
    #[serde(default)]
    pub options: serde_json::Map<String, Value>,
}

impl ConnectionConfig {
    pub fn new(
        protocol_driver: impl Into<String>,
        instance_number: u32,
        connection_number: u32,
        name: impl Into<String>,
    ) -> Self {
        Self {
            protocol_driver: protocol_driver.into(),
            protocol_driver_instance_number: instance_number,
            protocol_connection_number: connection_number,
            name: name.into(),
            description: String::new(),
            enabled: true,
            commands_enabled: true,
            auto_create_tags: true,
            hierarchy_separator: default_separator(),
            endpoint_urls: Vec::new(),
            topics: Vec::new(),
            tuning: ConnectionTuning::default(),
            options: serde_json::Map::new(),
        }
    }
}

/// Dead-band and interval tuning applied to auto-created points and subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTuning {
    #[serde(default, rename = "autoCreateTagPublishingInterval")]
    pub publishing_interval: f64,
    #[serde(default, rename = "autoCreateTagSamplingInterval")]
    pub sampling_interval: f64,
    #[serde(default, rename = "autoCreateTagQueueSize")]
    pub queue_size: u32,
    #[serde(default)]
    pub dead_band: f64,
    /// General interrogation period in seconds.
    #[serde(default)]
    pub gi_interval: f64,
    #[serde(default)]
    pub historian_period: f64,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            publishing_interval: 2.5,
            sampling_interval: 0.0,
            queue_size: 10,
            dead_band: 0.0,
            gi_interval: 300.0,
            historian_period: 0.0,
        }
    }
}

/// Classifier attached to each value change, using IEC 60870-5 codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CauseOfTransmission {
    Periodic,
    #[default]
    Spontaneous,
    Interrogated,
}

impl CauseOfTransmission {
    pub fn code(self) -> u8 {
        match self {
            CauseOfTransmission::Periodic => 1,
            CauseOfTransmission::Spontaneous => 3,
            CauseOfTransmission::Interrogated => 20,
        }
    }
}

/// Transient fault qualifiers an adapter may raise alongside a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultFlags {
    pub overflow: bool,
    pub blocked: bool,
    pub substituted: bool,
    pub not_topical: bool,
}

/// Protocol-agnostic value change produced by a field adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub connection_number: u32,
    pub address: String,
    pub value: f64,
    pub value_string: String,
    /// Raw or structured payload (arrays, extension objects).
    pub value_json: Option<Value>,
    /// Native type name at the source (e.g. `boolean`, `float`, `string`).
    pub type_hint: String,
    pub good: bool,
    pub cause: CauseOfTransmission,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
    pub is_array: bool,
    pub flags: FaultFlags,
}

impl ValueUpdate {
    /// Good-quality numeric update captured now.
    pub fn numeric(connection_number: u32, address: impl Into<String>, value: f64) -> Self {
        Self {
            connection_number,
            address: address.into(),
            value,
            value_string: value.to_string(),
            value_json: None,
            type_hint: "double".to_owned(),
            good: true,
            cause: CauseOfTransmission::Spontaneous,
            source_timestamp: None,
            captured_at: Utc::now(),
            is_array: false,
            flags: FaultFlags::default(),
        }
    }

    /// Good-quality boolean update captured now.
    pub fn digital(connection_number: u32, address: impl Into<String>, value: bool) -> Self {
        let mut update = Self::numeric(connection_number, address, if value { 1.0 } else { 0.0 });
        update.value_string = value.to_string();
        update.type_hint = "boolean".to_owned();
        update
    }

    /// Good-quality string update captured now.
    pub fn text(connection_number: u32, address: impl Into<String>, value: impl Into<String>) -> Self {
        let mut update = Self::numeric(connection_number, address, 0.0);
        update.value_string = value.into();
        update.type_hint = "string".to_owned();
        update
    }

    pub fn with_quality(mut self, good: bool) -> Self {
        self.good = good;
        self
    }

    pub fn with_source_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.source_timestamp = Some(timestamp);
        self
    }

    pub fn with_cause(mut self, cause: CauseOfTransmission) -> Self {
        self.cause = cause;
        self
    }

    pub fn with_json(mut self, payload: Value) -> Self {
        self.is_array = payload.is_array();
        self.value_json = Some(payload);
        self
    }

    /// Point type an auto-created record for this update should carry.
    pub fn point_kind(&self) -> PointKind {
        match self.type_hint.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => PointKind::Digital,
            "string" | "extensionobject" => PointKind::String,
            _ if self.is_array || self.value_json.is_some() => PointKind::Json,
            _ => PointKind::Analog,
        }
    }

    /// Build the `sourceDataUpdate` sub-document written by the ingestion pipeline.
    pub fn to_source_data(&self) -> SourceDataUpdate {
        SourceDataUpdate {
            value_at_source: self.value,
            value_string_at_source: self.value_string.clone(),
            value_json_at_source: self.value_json.clone(),
            asdu_at_source: self.type_hint.clone(),
            cause_of_transmission_at_source: self.cause.code().to_string(),
            time_tag_at_source: self.source_timestamp,
            time_tag_at_source_ok: self.source_timestamp.is_some(),
            time_tag: self.captured_at,
            not_topical_at_source: self.flags.not_topical,
            invalid_at_source: !self.good,
            overflow_at_source: self.flags.overflow,
            blocked_at_source: self.flags.blocked,
            substituted_at_source: self.flags.substituted,
        }
    }
}

/// Latest acquisition state of a point, as reported by the source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceDataUpdate {
    pub value_at_source: f64,
    pub value_string_at_source: String,
    #[serde(default)]
    pub value_json_at_source: Option<Value>,
    pub asdu_at_source: String,
    pub cause_of_transmission_at_source: String,
    #[serde(default)]
    pub time_tag_at_source: Option<DateTime<Utc>>,
    pub time_tag_at_source_ok: bool,
    pub time_tag: DateTime<Utc>,
    pub not_topical_at_source: bool,
    pub invalid_at_source: bool,
    pub overflow_at_source: bool,
    pub blocked_at_source: bool,
    pub substituted_at_source: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PointKind {
    Analog,
    Digital,
    String,
    Json,
}

/// Persisted representation of one monitored field address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PointRecord {
    #[serde(rename = "_id")]
    pub key: i64,
    pub tag: String,
    pub protocol_source_connection_number: u32,
    pub protocol_source_object_address: String,
    #[serde(default)]
    pub protocol_source_common_address: String,
    #[serde(default, rename = "protocolSourceASDU")]
    pub protocol_source_asdu: String,
    pub origin: String,
    #[serde(rename = "type")]
    pub kind: PointKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ungrouped_description: String,
    #[serde(default)]
    pub group1: String,
    #[serde(default)]
    pub group2: String,
    #[serde(default)]
    pub group3: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub value_string: String,
    #[serde(default)]
    pub value_json: Option<Value>,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub invalid_detect_timeout: u32,
    #[serde(default)]
    pub alarm_state: i32,
    #[serde(default)]
    pub state_text_true: String,
    #[serde(default)]
    pub state_text_false: String,
    pub hi_limit: f64,
    pub hihi_limit: f64,
    pub hihihi_limit: f64,
    pub lo_limit: f64,
    pub lolo_limit: f64,
    pub lololo_limit: f64,
    pub kconv1: f64,
    pub kconv2: f64,
    #[serde(default)]
    pub historian_dead_band: f64,
    #[serde(default)]
    pub historian_period: f64,
    #[serde(default)]
    pub command_of_supervised: i64,
    #[serde(default)]
    pub time_tag: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_data_update: Option<SourceDataUpdate>,
}

impl PointRecord {
    /// Record with the platform's default alarm, limit and conversion fields.
    pub fn supervised(
        key: i64,
        tag: impl Into<String>,
        connection_number: u32,
        address: impl Into<String>,
        kind: PointKind,
    ) -> Self {
        let digital = kind == PointKind::Digital;
        Self {
            key,
            tag: tag.into(),
            protocol_source_connection_number: connection_number,
            protocol_source_object_address: address.into(),
            protocol_source_common_address: ROOT_GROUP.to_owned(),
            protocol_source_asdu: String::new(),
            origin: SUPERVISED_ORIGIN.to_owned(),
            kind,
            description: String::new(),
            ungrouped_description: String::new(),
            group1: String::new(),
            group2: ROOT_GROUP.to_owned(),
            group3: String::new(),
            value: 0.0,
            value_string: String::new(),
            value_json: None,
            invalid: true,
            invalid_detect_timeout: 60_000,
            alarm_state: if digital { 2 } else { -1 },
            state_text_true: if digital { "TRUE".to_owned() } else { String::new() },
            state_text_false: if digital { "FALSE".to_owned() } else { String::new() },
            hi_limit: f64::MAX,
            hihi_limit: f64::MAX,
            hihihi_limit: f64::MAX,
            lo_limit: -f64::MAX,
            lolo_limit: -f64::MAX,
            lololo_limit: -f64::MAX,
            kconv1: 1.0,
            kconv2: 0.0,
            historian_dead_band: 0.0,
            historian_period: 0.0,
            command_of_supervised: 0,
            time_tag: None,
            source_data_update: None,
        }
    }
}

/// Operator command, inserted once by the platform and resolved once by a driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub protocol_source_connection_number: u32,
    pub protocol_source_object_address: String,
    /// Declared value type of the target (e.g. `int32`, `boolean`).
    #[serde(default, rename = "protocolSourceASDU")]
    pub protocol_source_asdu: String,
    #[serde(default)]
    pub protocol_source_command_duration: f64,
    #[serde(default)]
    pub protocol_source_command_use_sbo: bool,
    #[serde(default)]
    pub point_key: i64,
    #[serde(default)]
    pub tag: String,
    pub value: f64,
    #[serde(default)]
    pub value_string: String,
    #[serde(default)]
    pub originator_user_name: String,
    #[serde(default)]
    pub originator_ip_address: String,
    /// Issue timestamp.
    pub time_tag: DateTime<Utc>,
    #[serde(default)]
    pub delivered: Option<bool>,
    #[serde(default)]
    pub ack: Option<bool>,
    #[serde(default)]
    pub ack_time_tag: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub result_description: Option<String>,
}

impl CommandRequest {
    /// Fresh, unresolved command issued now.
    pub fn new(
        connection_number: u32,
        address: impl Into<String>,
        type_hint: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol_source_connection_number: connection_number,
            protocol_source_object_address: address.into(),
            protocol_source_asdu: type_hint.into(),
            protocol_source_command_duration: 0.0,
            protocol_source_command_use_sbo: false,
            point_key: 0,
            tag: String::new(),
            value,
            value_string: value.to_string(),
            originator_user_name: String::new(),
            originator_ip_address: String::new(),
            time_tag: Utc::now(),
            delivered: None,
            ack: None,
            ack_time_tag: None,
            cancel_reason: None,
            result_description: None,
        }
    }

    pub fn issued_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.time_tag = timestamp;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.delivered == Some(true)
            || self
                .cancel_reason
                .as_deref()
                .is_some_and(|reason| !reason.is_empty())
    }

    /// Apply a resolution to the outcome fields.
    pub fn apply(&mut self, resolution: &CommandResolution) {
        match resolution {
            CommandResolution::Delivered {
                ack,
                description,
                at,
            } => {
                self.delivered = Some(true);
                self.ack = Some(*ack);
                self.ack_time_tag = Some(*at);
                self.result_description = Some(description.clone());
            }
            CommandResolution::Cancelled { reason } => {
                self.cancel_reason = Some(reason.clone());
            }
        }
    }
}

/// Terminal outcome written back onto a [`CommandRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResolution {
    Delivered {
        ack: bool,
        description: String,
        at: DateTime<Utc>,
    },
    Cancelled {
        reason: String,
    },
}

impl CommandResolution {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        CommandResolution::Cancelled {
            reason: reason.into(),
        }
    }
}

/// Shared redundancy record for one (driver, instance number) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverInstanceState {
    pub protocol_driver: String,
    pub protocol_driver_instance_number: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub log_level: u8,
    #[serde(default)]
    pub node_names: Vec<String>,
    #[serde(default)]
    pub active_node_name: String,
    #[serde(default)]
    pub active_node_keep_alive_time_tag: Option<DateTime<Utc>>,
    #[serde(default)]
    pub keep_protocol_running_while_inactive: bool,
    #[serde(default)]
    pub software_version: String,
}

impl DriverInstanceState {
    /// Record created by the first process to find none, marking itself active.
    pub fn bootstrap(
        driver: impl Into<String>,
        instance_number: u32,
        node_name: impl Into<String>,
        now: DateTime<Utc>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            protocol_driver: driver.into(),
            protocol_driver_instance_number: instance_number,
            enabled: true,
            log_level: 1,
            node_names: Vec::new(),
            active_node_name: node_name.into(),
            active_node_keep_alive_time_tag: Some(now),
            keep_protocol_running_while_inactive: false,
            software_version: version.into(),
        }
    }

    /// An empty allow-list admits every node.
    pub fn allows_node(&self, node_name: &str) -> bool {
        self.node_names.is_empty() || self.node_names.iter().any(|name| name == node_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_parses_platform_document() {
        let doc = json!({
            "protocolDriver": "OPC-UA",
            "protocolDriverInstanceNumber": 1,
            "protocolConnectionNumber": 3,
            "name": "PLC3",
            "enabled": true,
            "commandsEnabled": false,
            "autoCreateTags": true,
            "endpointURLs": ["opc.tcp://plc3:4840"],
            "autoCreateTagPublishingInterval": 1.0,
            "deadBand": 0.5
        });
        let conn: ConnectionConfig = serde_json::from_value(doc).unwrap();
        assert_eq!(conn.protocol_connection_number, 3);
        assert!(!conn.commands_enabled);
        assert_eq!(conn.endpoint_urls, vec!["opc.tcp://plc3:4840".to_owned()]);
        assert_eq!(conn.tuning.publishing_interval, 1.0);
        assert_eq!(conn.tuning.dead_band, 0.5);
        assert_eq!(conn.hierarchy_separator, ".");
    }

    #[test]
    fn point_kind_follows_type_hint() {
        assert_eq!(ValueUpdate::digital(1, "a", true).point_kind(), PointKind::Digital);
        assert_eq!(ValueUpdate::text(1, "a", "x").point_kind(), PointKind::String);
        assert_eq!(ValueUpdate::numeric(1, "a", 1.0).point_kind(), PointKind::Analog);
        assert_eq!(
            ValueUpdate::numeric(1, "a", 0.0)
                .with_json(json!([1, 2]))
                .point_kind(),
            PointKind::Json
        );
    }

    #[test]
    fn source_data_marks_bad_quality_invalid() {
        let update = ValueUpdate::numeric(2, "x.y", 4.5).with_quality(false);
        let data = update.to_source_data();
        assert!(data.invalid_at_source);
        assert!(!data.time_tag_at_source_ok);
        assert_eq!(data.cause_of_transmission_at_source, "3");
        assert!(!data.overflow_at_source);
    }

    #[test]
    fn supervised_defaults_depend_on_kind() {
        let digital = PointRecord::supervised(1, "t", 1, "a", PointKind::Digital);
        assert_eq!(digital.alarm_state, 2);
        assert_eq!(digital.state_text_true, "TRUE");
        let analog = PointRecord::supervised(2, "u", 1, "b", PointKind::Analog);
        assert_eq!(analog.alarm_state, -1);
        assert_eq!(analog.hi_limit, f64::MAX);
        assert_eq!(analog.lo_limit, -f64::MAX);
        assert!(analog.invalid);
        assert_eq!(analog.origin, SUPERVISED_ORIGIN);
    }

    #[test]
    fn command_terminality() {
        let mut command = CommandRequest::new(1, "a", "int32", 42.0);
        assert!(!command.is_terminal());
        command.apply(&CommandResolution::cancelled("expired"));
        assert!(command.is_terminal());
        assert_eq!(command.delivered, None);
    }

    #[test]
    fn empty_allow_list_admits_any_node() {
        let mut state = DriverInstanceState::bootstrap("OPC-UA", 1, "a", Utc::now(), "0.1.0");
        assert!(state.allows_node("b"));
        state.node_names = vec!["a".into()];
        assert!(!state.allows_node("b"));
    }
}
