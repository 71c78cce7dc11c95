//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Shared primitives and utilities for the driver runtime."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "FGW_LOG";

// Writers flush on drop; the guards live for the whole process.
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Available log formats for the driver process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Map the platform's numeric log level (0..=3) to a filter directive.
pub fn verbosity_directive(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Filter from `FGW_LOG`, then `RUST_LOG`, then the numeric verbosity.
fn env_filter(verbosity: u8) -> EnvFilter {
    let fallback = verbosity_directive(verbosity);
    if let Ok(directive) = std::env::var(LOG_ENV) {
        return EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("ignoring {LOG_ENV}={directive:?} ({err}); using {fallback}");
            EnvFilter::new(fallback)
        });
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Initialize the tracing subscriber.
///
/// * `FGW_LOG` overrides the filter (e.g. `info`, `debug,fgw_ingest=trace`).
///   When unset `RUST_LOG` is honoured, and finally the numeric `verbosity`
///   given on the command line.
/// * Stdout receives JSON or pretty output; a daily rolling JSON file is
///   written to `config.directory` unless `file_enabled` is false.
pub fn init_tracing(service_name: &str, config: &LoggingConfig, verbosity: u8) -> Result<()> {
    let (console, console_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(console_guard);
    let timer = fmt::time::UtcTime::rfc_3339();

    let console_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .with_target(false)
            .with_timer(timer.clone())
            .with_writer(console)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(timer.clone())
            .with_writer(console)
            .boxed(),
    };

    let mut file_layer = None;
    if config.file_enabled {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("unable to create log directory {}", config.directory.display())
        })?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (writer, guard) =
            tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
        let _ = FILE_GUARD.set(guard);
        file_layer = Some(fmt::layer().json().with_timer(timer).with_writer(writer).boxed());
    }

    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbosity))
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, verbosity, "tracing initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels_map_to_directives() {
        assert_eq!(verbosity_directive(0), "warn");
        assert_eq!(verbosity_directive(1), "info");
        assert_eq!(verbosity_directive(2), "debug");
        assert_eq!(verbosity_directive(3), "trace");
        assert_eq!(verbosity_directive(9), "trace");
    }
}
