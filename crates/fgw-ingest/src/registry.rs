//! ---
//! fgw_section: "04-ingestion"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Value-update ingestion into the shared store."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
//! Per-connection cache of supervised point records and on-demand
//! auto-creation of missing ones.
//!
//! The registry is owned by the single drain loop of a process, so key
//! allocation needs no lock beyond `&mut self`.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use fgw_common::model::{
    ConnectionConfig, PointRecord, ValueUpdate, ROOT_GROUP, SUPERVISED_ORIGIN,
};
use fgw_metrics::IngestMetrics;
use fgw_store::{DocumentStore, StoreError};
use tracing::{debug, info, warn};

use crate::IngestError;

/// Upper bound on consecutive key clashes tolerated for one insert.
const MAX_INSERT_ATTEMPTS: usize = 16;

/// Result of [`TagRegistry::ensure_tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsuredTag {
    pub key: i64,
    /// Whether this call inserted the record.
    pub created: bool,
}

/// Grouping metadata derived from a hierarchical field address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressGroups {
    /// First path segment, or `@root` for flat addresses.
    pub group2: String,
    /// Middle segments joined by `/`.
    pub group3: String,
    /// Last segment.
    pub leaf: String,
    /// Address without its leaf, or `@root`.
    pub common_address: String,
}

/// Split `address` on `separator` into group path and leaf.
pub fn group_address(address: &str, separator: &str) -> AddressGroups {
    let segments: Vec<&str> = if separator.is_empty() {
        vec![address]
    } else {
        address.split(separator).collect()
    };
    match segments.as_slice() {
        [] | [_] => AddressGroups {
            group2: ROOT_GROUP.to_owned(),
            group3: String::new(),
            leaf: address.to_owned(),
            common_address: ROOT_GROUP.to_owned(),
        },
        [first, middle @ .., leaf] => AddressGroups {
            group2: (*first).to_owned(),
            group3: middle.join("/"),
            leaf: (*leaf).to_owned(),
            common_address: segments[..segments.len() - 1].join(separator),
        },
    }
}

/// Auto-keys a connection may hand out: `base < key < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyRange {
    base: i64,
    end: i64,
}

impl KeyRange {
    /// `None` when `connection * multiplier` does not fit in an `i64`.
    fn of(connection: u32, multiplier: i64) -> Option<Self> {
        let base = i64::from(connection).checked_mul(multiplier)?;
        let end = base.checked_add(multiplier)?;
        Some(Self { base, end })
    }

    fn contains(&self, key: i64) -> bool {
        key > self.base && key < self.end
    }
}

#[derive(Debug)]
struct ConnectionCache {
    config: ConnectionConfig,
    tag_names: HashSet<String>,
    addresses: HashMap<String, i64>,
    range: Option<KeyRange>,
    last_key: i64,
}

impl ConnectionCache {
    fn new(config: ConnectionConfig, multiplier: i64) -> Self {
        let range = KeyRange::of(config.protocol_connection_number, multiplier);
        if range.is_none() {
            warn!(
                connection = config.protocol_connection_number,
                multiplier, "auto-key range does not fit in 64 bits; tags will not be auto-created"
            );
        }
        Self {
            config,
            tag_names: HashSet::new(),
            addresses: HashMap::new(),
            range,
            last_key: range.map_or(0, |r| r.base),
        }
    }

    fn reset(&mut self) {
        self.tag_names.clear();
        self.addresses.clear();
        self.last_key = self.range.map_or(0, |r| r.base);
    }

    fn owns_key(&self, key: i64) -> bool {
        self.range.is_some_and(|range| range.contains(key))
    }

    /// Next unused key of the range, if any is left.
    fn next_key(&self) -> Option<i64> {
        self.last_key
            .checked_add(1)
            .filter(|&key| self.owns_key(key))
    }

    fn remember(&mut self, record: &PointRecord) {
        self.tag_names.insert(record.tag.clone());
        self.addresses
            .insert(record.protocol_source_object_address.clone(), record.key);
        if self.owns_key(record.key) && record.key > self.last_key {
            self.last_key = record.key;
        }
    }
}

/// Known field addresses and auto-key cursors for the connections of one driver instance.
pub struct TagRegistry {
    driver: String,
    multiplier: i64,
    store: Arc<dyn DocumentStore>,
    connections: BTreeMap<u32, ConnectionCache>,
    primed: bool,
    metrics: Option<IngestMetrics>,
}

impl std::fmt::Debug for TagRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagRegistry")
            .field("driver", &self.driver)
            .field("multiplier", &self.multiplier)
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .field("primed", &self.primed)
            .finish_non_exhaustive()
    }
}

impl TagRegistry {
    pub fn new(
        driver: impl Into<String>,
        connections: &[ConnectionConfig],
        multiplier: i64,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let multiplier = multiplier.max(1);
        Self {
            driver: driver.into(),
            multiplier,
            store,
            connections: connections
                .iter()
                .map(|c| {
                    (
                        c.protocol_connection_number,
                        ConnectionCache::new(c.clone(), multiplier),
                    )
                })
                .collect(),
            primed: false,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Load known tag names, addresses and the highest auto-key of every
    /// connection from the store. Replaces whatever was cached before.
    pub async fn prime(&mut self) -> Result<(), IngestError> {
        for (number, cache) in self.connections.iter_mut() {
            let records = self.store.find_points(*number, SUPERVISED_ORIGIN).await?;
            cache.reset();
            for record in &records {
                cache.remember(record);
            }
            debug!(
                connection = number,
                points = records.len(),
                last_key = cache.last_key,
                "tag registry primed"
            );
        }
        self.primed = true;
        Ok(())
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Drop all cached state. Persisted records are untouched.
    pub fn clear(&mut self) {
        for cache in self.connections.values_mut() {
            cache.reset();
        }
        self.primed = false;
    }

    pub fn connection(&self, number: u32) -> Option<&ConnectionConfig> {
        self.connections.get(&number).map(|c| &c.config)
    }

    /// Auto-create policy of a connection, `None` if it is not ours.
    pub fn auto_create(&self, number: u32) -> Option<bool> {
        self.connection(number).map(|c| c.auto_create_tags)
    }

    pub fn is_known(&self, number: u32, address: &str) -> bool {
        self.connections
            .get(&number)
            .is_some_and(|c| c.addresses.contains_key(address))
    }

    pub fn last_key(&self, number: u32) -> Option<i64> {
        self.connections.get(&number).map(|c| c.last_key)
    }

    /// Make sure a supervised record exists for the update's address,
    /// creating it with the next key of its connection if needed.
    pub async fn ensure_tag(&mut self, update: &ValueUpdate) -> Result<EnsuredTag, IngestError> {
        let number = update.connection_number;
        let cache = self
            .connections
            .get_mut(&number)
            .ok_or(IngestError::UnknownConnection(number))?;

        if let Some(&key) = cache.addresses.get(&update.address) {
            return Ok(EnsuredTag {
                key,
                created: false,
            });
        }

        // Another writer may have provisioned it since priming.
        if let Some(existing) = self
            .store
            .find_point(number, &update.address, SUPERVISED_ORIGIN)
            .await?
        {
            cache.remember(&existing);
            return Ok(EnsuredTag {
                key: existing.key,
                created: false,
            });
        }

        for _ in 0..MAX_INSERT_ATTEMPTS {
            let Some(key) = cache.next_key() else {
                return Err(IngestError::KeyRangeExhausted {
                    connection: number,
                    last_key: cache.last_key,
                });
            };
            let record = build_record(&self.driver, cache, key, update);
            match self.store.insert_point(&record).await {
                Ok(()) => {
                    cache.remember(&record);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_tag_created(number);
                    }
                    info!(connection = number, key, tag = %record.tag, address = %update.address, "point record created");
                    return Ok(EnsuredTag { key, created: true });
                }
                Err(StoreError::Duplicate(reason)) => {
                    if let Some(existing) = self
                        .store
                        .find_point(number, &update.address, SUPERVISED_ORIGIN)
                        .await?
                    {
                        cache.remember(&existing);
                        return Ok(EnsuredTag {
                            key: existing.key,
                            created: false,
                        });
                    }
                    // A tag owned by another connection gets the key suffix;
                    // anything else means the key itself is taken.
                    let tag_owner = self.store.find_point_by_tag(&record.tag).await?;
                    match tag_owner {
                        Some(owner) if owner.key != key && cache.tag_names.insert(record.tag.clone()) => {
                            debug!(connection = number, key, tag = %record.tag, owner = owner.key, "tag name taken elsewhere; suffixing");
                        }
                        _ => {
                            warn!(connection = number, key, %reason, "auto-key already taken; trying next");
                            cache.last_key = key;
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(IngestError::KeyRangeExhausted {
            connection: number,
            last_key: cache.last_key,
        })
    }
}

fn build_record(driver: &str, cache: &ConnectionCache, key: i64, update: &ValueUpdate) -> PointRecord {
    let config = &cache.config;
    let groups = group_address(&update.address, &config.hierarchy_separator);

    let mut tag = format!("{}.{}", config.name, update.address);
    if cache.tag_names.contains(&tag) {
        tag = format!("{tag}~{key}");
    }

    let mut record = PointRecord::supervised(
        key,
        tag,
        config.protocol_connection_number,
        update.address.clone(),
        update.point_kind(),
    );
    record.protocol_source_common_address = groups.common_address;
    record.protocol_source_asdu = update.type_hint.clone();
    record.description = format!("{driver}~{}~{}", config.name, update.address);
    record.ungrouped_description = groups.leaf;
    record.group1 = config.name.clone();
    record.group2 = groups.group2;
    record.group3 = groups.group3;
    record.historian_dead_band = config.tuning.dead_band;
    record.historian_period = config.tuning.historian_period;
    record
}
