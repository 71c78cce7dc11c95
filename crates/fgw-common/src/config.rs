//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared primitives and utilities for the driver runtime."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::model::ConnectionConfig;

fn default_redundancy_tick() -> Duration {
    Duration::from_secs(5)
}

fn default_stale_tick_threshold() -> u32 {
    4
}

fn default_demotion_jitter_min() -> Duration {
    Duration::from_secs(1)
}

fn default_demotion_jitter_max() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_bound() -> usize {
    20_000
}

fn default_batch_size() -> usize {
    1_250
}

fn default_batch_budget() -> Duration {
    Duration::from_millis(1_500)
}

fn default_idle_sleep() -> Duration {
    Duration::from_millis(250)
}

fn default_store_retry() -> Duration {
    Duration::from_secs(1)
}

fn default_command_expiry() -> Duration {
    Duration::from_secs(10)
}

fn default_dispatcher_backoff() -> Duration {
    Duration::from_secs(3)
}

fn default_command_write_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_auto_key_multiplier() -> i64 {
    100_000
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("log")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_true() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Process configuration shared with the other platform processes.
///
/// Top-level keys follow the platform's camelCase file layout (`nodeName`,
/// `mongoConnectionString`, ...). The driver-specific `runtime`, `logging`
/// and `metrics` tables use snake_case keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub node_name: String,
    #[serde(alias = "mongoConnectionString")]
    pub store_connection_string: String,
    #[serde(alias = "mongoDatabaseName")]
    pub store_database_name: String,
    #[serde(flatten)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Optional static connection list. When empty the connections are read
    /// from the store at startup.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// Metadata describing where a [`DriverConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedDriverConfig {
    pub config: DriverConfig,
    pub source: PathBuf,
}

impl DriverConfig {
    pub const ENV_CONFIG_PATH: &'static str = "FGW_CONFIG";

    /// Default lookup locations, relative to the working directory.
    pub fn default_candidates() -> Vec<PathBuf> {
        vec![
            PathBuf::from("../conf/json-scada.json"),
            PathBuf::from("conf/json-scada.json"),
        ]
    }

    /// Build a configuration with runtime defaults for the given node and store.
    pub fn new(
        node_name: impl Into<String>,
        store_connection_string: impl Into<String>,
        store_database_name: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store_connection_string: store_connection_string.into(),
            store_database_name: store_database_name.into(),
            tls: TlsConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            connections: Vec::new(),
        }
    }

    /// Load configuration from disk, respecting the `FGW_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load the first existing candidate, or the `FGW_CONFIG` path when set,
    /// and report which file was used.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedDriverConfig> {
        let from_env = std::env::var(Self::ENV_CONFIG_PATH)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let source = match from_env {
            Some(path) => path,
            None => candidates
                .iter()
                .map(|candidate| candidate.as_ref())
                .find(|candidate| candidate.is_file())
                .map(Path::to_path_buf)
                .ok_or_else(|| {
                    let inspected: Vec<String> = candidates
                        .iter()
                        .map(|candidate| candidate.as_ref().display().to_string())
                        .collect();
                    anyhow!("no configuration file found (looked for {})", inspected.join(", "))
                })?,
        };
        let config = Self::from_path(&source)?;
        Ok(LoadedDriverConfig { config, source })
    }

    /// Parse a single file, choosing the format from its extension (JSON when unknown).
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let config: DriverConfig = match extension.as_deref() {
            Some("yaml") | Some("yml") => {
                serde_path_to_error::deserialize(serde_yaml::Deserializer::from_str(&contents))
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            Some("toml") => {
                serde_path_to_error::deserialize(toml::Deserializer::new(&contents))
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            _ => serde_path_to_error::deserialize(&mut serde_json::Deserializer::from_str(
                &contents,
            ))
            .with_context(|| format!("failed to parse config file {}", path.display()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants. Any failure here is fatal for the process.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(anyhow!("missing nodeName parameter in configuration"));
        }
        if self.store_connection_string.trim().is_empty() {
            return Err(anyhow!("missing store connection string in configuration"));
        }
        if self.store_database_name.trim().is_empty() {
            return Err(anyhow!("missing store database name in configuration"));
        }
        self.runtime.validate()?;
        for connection in &self.connections {
            if connection.name.trim().is_empty() {
                return Err(anyhow!(
                    "connection {} must have a name",
                    connection.protocol_connection_number
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for DriverConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: DriverConfig = serde_path_to_error::deserialize(
            &mut serde_json::Deserializer::from_str(content),
        )
        .with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Optional TLS material for the store connection. Passed through to the store backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub tls_ca_pem_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_client_pem_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_client_pfx_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_client_key_password: Option<String>,
    #[serde(default)]
    pub tls_allow_invalid_hostnames: bool,
    #[serde(default)]
    pub tls_allow_chain_errors: bool,
    #[serde(default)]
    pub tls_insecure: bool,
}

/// Tuning knobs for the redundancy, ingestion and command loops.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default = "default_redundancy_tick")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub redundancy_tick: Duration,
    /// Consecutive unchanged heartbeats before a remote active node is declared stale.
    #[serde(default = "default_stale_tick_threshold")]
    pub stale_tick_threshold: u32,
    #[serde(default = "default_demotion_jitter_min")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub demotion_jitter_min: Duration,
    #[serde(default = "default_demotion_jitter_max")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub demotion_jitter_max: Duration,
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_budget")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub batch_budget: Duration,
    #[serde(default = "default_idle_sleep")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_sleep: Duration,
    #[serde(default = "default_store_retry")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub store_retry: Duration,
    #[serde(default = "default_command_expiry")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub command_expiry: Duration,
    #[serde(default = "default_dispatcher_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub dispatcher_backoff: Duration,
    #[serde(default = "default_command_write_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub command_write_timeout: Duration,
    #[serde(default = "default_auto_key_multiplier")]
    pub auto_key_multiplier: i64,
    /// Resolve commands observed while standby as "not connected" instead of
    /// leaving them to the active instance.
    #[serde(default)]
    pub cancel_commands_while_standby: bool,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.redundancy_tick.is_zero() {
            return Err(anyhow!("runtime.redundancy_tick must be greater than zero"));
        }
        if self.stale_tick_threshold == 0 {
            return Err(anyhow!("runtime.stale_tick_threshold must be at least 1"));
        }
        if self.demotion_jitter_min > self.demotion_jitter_max {
            return Err(anyhow!(
                "runtime.demotion_jitter_min must not exceed runtime.demotion_jitter_max"
            ));
        }
        if self.batch_size == 0 || self.queue_bound == 0 {
            return Err(anyhow!(
                "runtime.batch_size and runtime.queue_bound must be greater than zero"
            ));
        }
        if self.auto_key_multiplier <= 0 {
            return Err(anyhow!("runtime.auto_key_multiplier must be positive"));
        }
        // The key range of the highest connection number must fit in an i64.
        let connections = i64::from(u32::MAX) + 1;
        if connections.checked_mul(self.auto_key_multiplier).is_none() {
            return Err(anyhow!(
                "runtime.auto_key_multiplier must not exceed {}",
                i64::MAX / connections
            ));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            redundancy_tick: default_redundancy_tick(),
            stale_tick_threshold: default_stale_tick_threshold(),
            demotion_jitter_min: default_demotion_jitter_min(),
            demotion_jitter_max: default_demotion_jitter_max(),
            queue_bound: default_queue_bound(),
            batch_size: default_batch_size(),
            batch_budget: default_batch_budget(),
            idle_sleep: default_idle_sleep(),
            store_retry: default_store_retry(),
            command_expiry: default_command_expiry(),
            dispatcher_backoff: default_dispatcher_backoff(),
            command_write_timeout: default_command_write_timeout(),
            auto_key_multiplier: default_auto_key_multiplier(),
            cancel_commands_while_standby: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
