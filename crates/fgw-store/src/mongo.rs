//! ---
//! fgw_section: "03-store-client"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared store abstractions and backends."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
//! MongoDB backend for [`DocumentStore`].
//!
//! Records travel as BSON documents. Timestamps are stored as BSON dates,
//! and command ids created by other tools (ObjectIds) are mapped onto
//! UUIDs so the rest of the runtime only ever sees one id type.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use fgw_common::config::TlsConfig;
use fgw_common::model::{
    CommandRequest, CommandResolution, ConnectionConfig, DriverInstanceState, PointRecord,
    COMMANDS_COLLECTION, CONNECTIONS_COLLECTION, INSTANCES_COLLECTION, REALTIME_DATA_COLLECTION,
    SUPERVISED_ORIGIN,
};
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{self, doc, oid::ObjectId, Bson, Document};
use mongodb::change_stream::event::OperationType;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, FindOptions, Tls, TlsOptions};
use mongodb::{Client, Collection, Database};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    BulkWriteResult, CommandFeed, DocumentStore, HeartbeatObservation, PointUpdate, Result,
    StoreError,
};

const APP_NAME: &str = "fgw-driverd";
const DUPLICATE_KEY: i32 = 11000;
/// Leading bytes of a UUID that stands in for a 12-byte ObjectId.
const OBJECT_ID_MARKER: [u8; 4] = [0xff, 0xff, 0xff, 0xff];
/// Fields stored as BSON dates rather than strings.
const DATE_FIELDS: [&str; 4] = [
    "timeTag",
    "timeTagAtSource",
    "ackTimeTag",
    "activeNodeKeepAliveTimeTag",
];

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        if err.contains_label("RetryableWriteError") {
            return StoreError::Unavailable(err.to_string());
        }
        match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY => {
                StoreError::Duplicate(write.message.clone())
            }
            ErrorKind::Command(command) if command.code == DUPLICATE_KEY => {
                StoreError::Duplicate(command.message.clone())
            }
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. } => StoreError::Unavailable(err.to_string()),
            ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => {
                StoreError::Encoding(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// Store backed by a MongoDB database (`realtimeData`, `commandsQueue`, ...).
#[derive(Debug, Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    /// Build a client for `uri`. No I/O happens until the first operation.
    pub async fn connect(uri: &str, database: &str, tls: &TlsConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.app_name = Some(APP_NAME.to_owned());
        if let Some(tls) = tls_options(tls) {
            options.tls = Some(tls);
        }
        let client = Client::with_options(options)?;
        info!(database, "mongodb client configured");
        Ok(Self {
            db: client.database(database),
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }

    async fn find_many<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: Document,
        options: Option<FindOptions>,
    ) -> Result<Vec<T>> {
        let documents: Vec<Document> = self
            .collection(collection)
            .find(filter, options)
            .await?
            .try_collect()
            .await?;
        documents.into_iter().map(decode).collect()
    }

    async fn find_first<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<T>> {
        self.collection(collection)
            .find_one(filter, None)
            .await?
            .map(decode)
            .transpose()
    }
}

/// TLS settings derived from the driver configuration. `None` leaves
/// whatever the connection string asks for untouched.
pub(crate) fn tls_options(tls: &TlsConfig) -> Option<Tls> {
    let requested = tls.tls_ca_pem_file.is_some()
        || tls.tls_client_pem_file.is_some()
        || tls.tls_client_pfx_file.is_some()
        || tls.tls_insecure;
    if !requested {
        return None;
    }
    if tls.tls_client_pfx_file.is_some() {
        warn!("PKCS#12 client certificates are not supported; use tlsClientPemFile");
    }
    if tls.tls_client_key_password.is_some() {
        warn!("encrypted client keys are not supported; the key password is ignored");
    }
    let mut options = TlsOptions::default();
    options.ca_file_path = tls.tls_ca_pem_file.clone();
    options.cert_key_file_path = tls.tls_client_pem_file.clone();
    // rustls has no separate hostname switch; any relaxation disables verification.
    let relaxed = tls.tls_insecure || tls.tls_allow_chain_errors || tls.tls_allow_invalid_hostnames;
    if relaxed {
        options.allow_invalid_certificates = Some(true);
    }
    Some(Tls::Enabled(options))
}

fn to_bson_date(at: DateTime<Utc>) -> Bson {
    Bson::DateTime(bson::DateTime::from_millis(at.timestamp_millis()))
}

fn dates_to_bson(document: &mut Document) {
    for (key, value) in document.iter_mut() {
        match value {
            Bson::String(text) if DATE_FIELDS.contains(&key.as_str()) => {
                if let Ok(at) = DateTime::parse_from_rfc3339(text) {
                    *value = to_bson_date(at.with_timezone(&Utc));
                }
            }
            Bson::Document(inner) => dates_to_bson(inner),
            _ => {}
        }
    }
}

/// Undo storage representations the model types do not read directly:
/// BSON dates become RFC 3339 strings and whole doubles (numbers written by
/// JavaScript tools) become integers.
fn normalize(value: &mut Bson) {
    match value {
        Bson::DateTime(at) => {
            if let Some(at) = Utc.timestamp_millis_opt(at.timestamp_millis()).single() {
                *value = Bson::String(at.to_rfc3339_opts(SecondsFormat::Millis, true));
            }
        }
        Bson::Double(number)
            if number.is_finite() && number.fract() == 0.0 && number.abs() < 9.0e15 =>
        {
            *value = Bson::Int64(*number as i64);
        }
        Bson::Document(inner) => inner.iter_mut().for_each(|(_, v)| normalize(v)),
        Bson::Array(items) => items.iter_mut().for_each(normalize),
        _ => {}
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Document> {
    let mut document =
        bson::to_document(value).map_err(|err| StoreError::Encoding(err.to_string()))?;
    dates_to_bson(&mut document);
    Ok(document)
}

fn decode<T: DeserializeOwned>(document: Document) -> Result<T> {
    let mut value = Bson::Document(document);
    normalize(&mut value);
    bson::from_bson(value).map_err(|err| StoreError::Encoding(err.to_string()))
}

fn uuid_from_object_id(oid: ObjectId) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&OBJECT_ID_MARKER);
    bytes[4..].copy_from_slice(&oid.bytes());
    Uuid::from_bytes(bytes)
}

fn command_id_bson(id: Uuid) -> Bson {
    let bytes = id.as_bytes();
    if bytes[..4] == OBJECT_ID_MARKER {
        let mut oid = [0u8; 12];
        oid.copy_from_slice(&bytes[4..]);
        Bson::ObjectId(ObjectId::from_bytes(oid))
    } else {
        Bson::String(id.to_string())
    }
}

fn encode_command(command: &CommandRequest) -> Result<Document> {
    let mut document = encode(command)?;
    document.insert("_id", command_id_bson(command.id));
    Ok(document)
}

fn decode_command(mut document: Document) -> Result<CommandRequest> {
    match document.get("_id") {
        Some(Bson::ObjectId(oid)) => {
            let id = uuid_from_object_id(*oid);
            document.insert("_id", Bson::String(id.to_string()));
        }
        Some(Bson::Binary(binary)) if binary.bytes.len() == 16 => {
            let id = Uuid::from_slice(&binary.bytes)
                .map_err(|err| StoreError::Encoding(err.to_string()))?;
            document.insert("_id", Bson::String(id.to_string()));
        }
        _ => {}
    }
    decode(document)
}

fn instance_filter(driver: &str, instance: u32) -> Document {
    doc! {
        "protocolDriver": driver,
        "protocolDriverInstanceNumber": i64::from(instance),
    }
}

fn point_filter(connection_number: u32, address: &str, origin: &str) -> Document {
    doc! {
        "protocolSourceConnectionNumber": i64::from(connection_number),
        "protocolSourceObjectAddress": address,
        "origin": origin,
    }
}

fn reply_count(reply: &Document, key: &str) -> u64 {
    match reply.get(key) {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Double(n)) if *n >= 0.0 => *n as u64,
        _ => 0,
    }
}

fn first_write_error(reply: &Document) -> Option<StoreError> {
    let Ok(errors) = reply.get_array("writeErrors") else {
        return None;
    };
    let first = errors.first()?.as_document()?;
    let message = first.get_str("errmsg").unwrap_or("write error").to_owned();
    Some(match first.get_i32("code") {
        Ok(DUPLICATE_KEY) => StoreError::Duplicate(message),
        _ => StoreError::Backend(message),
    })
}

fn resolution_update(resolution: &CommandResolution) -> Document {
    match resolution {
        CommandResolution::Delivered {
            ack,
            description,
            at,
        } => doc! {
            "$set": {
                "delivered": true,
                "ack": *ack,
                "ackTimeTag": to_bson_date(*at),
                "resultDescription": description.as_str(),
            }
        },
        CommandResolution::Cancelled { reason } => doc! {
            "$set": { "cancelReason": reason.as_str() }
        },
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn ping(&self) -> Result<()> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    async fn find_instance(
        &self,
        driver: &str,
        instance: u32,
    ) -> Result<Option<DriverInstanceState>> {
        self.find_first(INSTANCES_COLLECTION, instance_filter(driver, instance))
            .await
    }

    async fn insert_instance(&self, state: &DriverInstanceState) -> Result<()> {
        self.collection(INSTANCES_COLLECTION)
            .insert_one(encode(state)?, None)
            .await?;
        Ok(())
    }

    async fn renew_heartbeat(
        &self,
        driver: &str,
        instance: u32,
        node: &str,
        at: DateTime<Utc>,
        version: &str,
    ) -> Result<bool> {
        let mut filter = instance_filter(driver, instance);
        filter.insert("activeNodeName", node);
        let update = doc! {
            "$set": {
                "activeNodeKeepAliveTimeTag": to_bson_date(at),
                "softwareVersion": version,
            }
        };
        let result = self
            .collection(INSTANCES_COLLECTION)
            .update_one(filter, update, None)
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn claim_active(
        &self,
        driver: &str,
        instance: u32,
        node: &str,
        observed: &HeartbeatObservation,
        at: DateTime<Utc>,
        version: &str,
    ) -> Result<bool> {
        let mut filter = instance_filter(driver, instance);
        filter.insert("activeNodeName", observed.active_node_name.as_str());
        filter.insert(
            "activeNodeKeepAliveTimeTag",
            observed.keep_alive.map_or(Bson::Null, to_bson_date),
        );
        let update = doc! {
            "$set": {
                "activeNodeName": node,
                "activeNodeKeepAliveTimeTag": to_bson_date(at),
                "softwareVersion": version,
            }
        };
        let result = self
            .collection(INSTANCES_COLLECTION)
            .update_one(filter, update, None)
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn find_connections(
        &self,
        driver: &str,
        instance: u32,
    ) -> Result<Vec<ConnectionConfig>> {
        let mut filter = instance_filter(driver, instance);
        filter.insert("enabled", true);
        self.find_many(CONNECTIONS_COLLECTION, filter, None).await
    }

    async fn update_connection_stats(
        &self,
        connection_number: u32,
        node: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let filter = doc! { "protocolConnectionNumber": i64::from(connection_number) };
        let update = doc! {
            "$set": { "stats.nodeName": node, "stats.timeTag": to_bson_date(at) }
        };
        self.collection(CONNECTIONS_COLLECTION)
            .update_one(filter, update, None)
            .await?;
        Ok(())
    }

    async fn find_points(&self, connection_number: u32, origin: &str) -> Result<Vec<PointRecord>> {
        let filter = doc! {
            "protocolSourceConnectionNumber": i64::from(connection_number),
            "origin": origin,
        };
        let mut options = FindOptions::default();
        options.sort = Some(doc! { "_id": 1 });
        self.find_many(REALTIME_DATA_COLLECTION, filter, Some(options))
            .await
    }

    async fn find_point_by_tag(&self, tag: &str) -> Result<Option<PointRecord>> {
        self.find_first(REALTIME_DATA_COLLECTION, doc! { "tag": tag })
            .await
    }

    async fn find_point(
        &self,
        connection_number: u32,
        address: &str,
        origin: &str,
    ) -> Result<Option<PointRecord>> {
        self.find_first(
            REALTIME_DATA_COLLECTION,
            point_filter(connection_number, address, origin),
        )
        .await
    }

    async fn insert_point(&self, record: &PointRecord) -> Result<()> {
        self.collection(REALTIME_DATA_COLLECTION)
            .insert_one(encode(record)?, None)
            .await?;
        Ok(())
    }

    async fn bulk_update_points(&self, updates: &[PointUpdate]) -> Result<BulkWriteResult> {
        if updates.is_empty() {
            return Ok(BulkWriteResult::default());
        }
        let statements = updates
            .iter()
            .map(|update| {
                Ok(doc! {
                    "q": point_filter(update.connection_number, &update.address, SUPERVISED_ORIGIN),
                    "u": { "$set": { "sourceDataUpdate": encode(&update.source)? } },
                })
            })
            .collect::<Result<Vec<Document>>>()?;
        let command = doc! {
            "update": REALTIME_DATA_COLLECTION,
            "updates": statements,
            "ordered": true,
        };
        let reply = self.db.run_command(command, None).await?;
        if let Some(err) = first_write_error(&reply) {
            return Err(err);
        }
        let result = BulkWriteResult {
            matched: reply_count(&reply, "n"),
            modified: reply_count(&reply, "nModified"),
        };
        debug!(
            operations = updates.len(),
            matched = result.matched,
            modified = result.modified,
            "bulk write applied"
        );
        Ok(result)
    }

    async fn insert_command(&self, command: &CommandRequest) -> Result<()> {
        self.collection(COMMANDS_COLLECTION)
            .insert_one(encode_command(command)?, None)
            .await?;
        Ok(())
    }

    async fn find_command(&self, id: Uuid) -> Result<Option<CommandRequest>> {
        self.collection(COMMANDS_COLLECTION)
            .find_one(doc! { "_id": command_id_bson(id) }, None)
            .await?
            .map(decode_command)
            .transpose()
    }

    async fn resolve_command(&self, id: Uuid, resolution: &CommandResolution) -> Result<bool> {
        let filter = doc! {
            "_id": command_id_bson(id),
            "delivered": { "$ne": true },
            "cancelReason": { "$in": [Bson::Null, ""] },
        };
        let result = self
            .collection(COMMANDS_COLLECTION)
            .update_one(filter, resolution_update(resolution), None)
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn watch_command_inserts(&self) -> Result<CommandFeed> {
        let pipeline = [doc! { "$match": { "operationType": "insert" } }];
        let stream = self
            .collection(COMMANDS_COLLECTION)
            .watch(pipeline, None)
            .await?;
        let feed = stream.map(|event| {
            let event = event?;
            match (event.operation_type, event.full_document) {
                (OperationType::Insert, Some(document)) => decode_command(document),
                _ => Err(StoreError::FeedClosed),
            }
        });
        Ok(feed.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgw_common::model::{PointKind, SourceDataUpdate};
    use std::path::PathBuf;

    #[test]
    fn tls_is_left_to_the_uri_unless_configured() {
        assert!(tls_options(&TlsConfig::default()).is_none());

        let config = TlsConfig {
            tls_ca_pem_file: Some(PathBuf::from("/etc/fgw/ca.pem")),
            tls_client_pem_file: Some(PathBuf::from("/etc/fgw/client.pem")),
            tls_allow_invalid_hostnames: true,
            ..TlsConfig::default()
        };
        match tls_options(&config) {
            Some(Tls::Enabled(options)) => {
                assert_eq!(options.ca_file_path, config.tls_ca_pem_file);
                assert_eq!(options.cert_key_file_path, config.tls_client_pem_file);
                assert_eq!(options.allow_invalid_certificates, Some(true));
            }
            other => panic!("unexpected tls settings: {other:?}"),
        }

        let strict = TlsConfig {
            tls_ca_pem_file: Some(PathBuf::from("/etc/fgw/ca.pem")),
            ..TlsConfig::default()
        };
        match tls_options(&strict) {
            Some(Tls::Enabled(options)) => assert_eq!(options.allow_invalid_certificates, None),
            other => panic!("unexpected tls settings: {other:?}"),
        }
    }

    #[test]
    fn commands_written_by_other_tools_keep_their_object_id() {
        let oid = ObjectId::parse_str("65a1f0c2e4b0a1b2c3d4e5f6").unwrap();
        let stored = doc! {
            "_id": oid,
            "protocolSourceConnectionNumber": 81.0,
            "protocolSourceObjectAddress": "4113",
            "protocolSourceASDU": "C_SC_NA_1",
            "value": 1.0,
            "timeTag": bson::DateTime::from_millis(1_700_000_000_123),
        };
        let command = decode_command(stored).unwrap();
        assert_eq!(command.protocol_source_connection_number, 81);
        assert_eq!(command.time_tag.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(command_id_bson(command.id), Bson::ObjectId(oid));

        let native = CommandRequest::new(81, "4113", "C_SC_NA_1", 1.0);
        assert_eq!(
            command_id_bson(native.id),
            Bson::String(native.id.to_string())
        );
        let encoded = encode_command(&native).unwrap();
        assert!(matches!(encoded.get("timeTag"), Some(Bson::DateTime(_))));
        assert_eq!(decode_command(encoded).unwrap().id, native.id);
    }

    #[test]
    fn nested_time_tags_are_stored_as_dates() {
        let mut record =
            PointRecord::supervised(300001, "PLC3.Line.Breaker", 3, "4113", PointKind::Digital);
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        record.source_data_update = Some(SourceDataUpdate {
            value_at_source: 1.0,
            value_string_at_source: "true".into(),
            value_json_at_source: None,
            asdu_at_source: "M_SP_TB_1".into(),
            cause_of_transmission_at_source: "3".into(),
            time_tag_at_source: Some(at),
            time_tag_at_source_ok: true,
            time_tag: at,
            not_topical_at_source: false,
            invalid_at_source: false,
            overflow_at_source: false,
            blocked_at_source: false,
            substituted_at_source: false,
        });
        let document = encode(&record).unwrap();
        let source = document.get_document("sourceDataUpdate").unwrap();
        assert!(matches!(source.get("timeTag"), Some(Bson::DateTime(_))));
        assert!(matches!(source.get("timeTagAtSource"), Some(Bson::DateTime(_))));
        assert!(matches!(document.get("tag"), Some(Bson::String(_))));

        let back: PointRecord = decode(document).unwrap();
        assert_eq!(back.source_data_update.unwrap().time_tag, at);
    }

    #[test]
    fn write_errors_in_bulk_replies_are_classified() {
        let rejected = doc! {
            "n": 1, "nModified": 1,
            "writeErrors": [{ "index": 1, "code": 121, "errmsg": "Document failed validation" }],
        };
        let err = first_write_error(&rejected).unwrap();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(!err.is_transient());

        let clean = doc! { "n": 2, "nModified": Bson::Int64(1), "ok": 1.0 };
        assert!(first_write_error(&clean).is_none());
        assert_eq!(reply_count(&clean, "n"), 2);
        assert_eq!(reply_count(&clean, "nModified"), 1);
    }
}
