//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "binary"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Binary entrypoint for the driver daemon."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fgw_adapters::{FieldAdapter, GeneratorSettings, SimulatedAdapter};
use fgw_common::config::DriverConfig;
use fgw_common::logging::init_tracing;
use fgw_common::DRIVER_VERSION;
use fgw_core::DriverRuntime;
use fgw_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use tokio::signal;
use tracing::{error, info, warn};

const SIMULATED_DRIVER: &str = "SIMULATED";

#[derive(Debug, Parser)]
#[command(
    author,
    version = DRIVER_VERSION,
    about = "Field gateway protocol driver",
    long_about = None
)]
struct Cli {
    /// Driver instance number served by this process.
    #[arg(long, env = "FGW_INSTANCE", default_value_t = 1)]
    instance: u32,

    /// 0 = errors only, 1 = basic, 2 = detailed, 3 = debug.
    #[arg(
        long,
        env = "FGW_LOG_LEVEL",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=3)
    )]
    log_level: u8,

    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, default_value = SIMULATED_DRIVER, help = "Protocol driver name")]
    driver: String,

    #[arg(long, help = "Number of simulated points per connection")]
    sim_points: Option<usize>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(error = %format!("{err:#}"), "driver terminated");
        eprintln!("fgw-driverd: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.extend(DriverConfig::default_candidates());
    let loaded = DriverConfig::load_with_source(&candidates)?;
    let config = loaded.config;

    init_tracing("fgw-driverd", &config.logging, cli.log_level)?;
    info!(
        version = DRIVER_VERSION,
        driver = %cli.driver,
        instance = cli.instance,
        node = %config.node_name,
        config = %loaded.source.display(),
        "configuration loaded"
    );

    let adapter = build_adapter(&cli)?;
    let store = fgw_store::connect(
        &config.store_connection_string,
        &config.store_database_name,
        &config.tls,
    )
    .await
    .context("unable to open document store")?;

    let mut runtime = DriverRuntime::new(config.clone(), cli.instance, store, adapter);
    let metrics_server = if config.metrics.enabled {
        let registry = new_registry();
        let daemon_metrics = DaemonMetrics::new(&registry)?;
        daemon_metrics.inc_start();
        daemon_metrics.set_build_info(DRIVER_VERSION, &cli.driver, cli.instance);
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        let server = spawn_http_server(registry.clone(), config.metrics.listen).await?;
        runtime = runtime.with_metrics(registry);
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let mut handle = runtime.start().await?;
    info!("driver running; waiting for termination signal");

    let outcome = tokio::select! {
        signal = signal::ctrl_c() => {
            signal.context("unable to listen for ctrl-c")?;
            info!("ctrl-c received; shutting down");
            Ok(())
        }
        result = handle.wait() => result,
    };

    let stopped = handle.shutdown().await;
    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics exporter did not stop cleanly");
        }
    }
    outcome?;
    stopped?;
    Ok(())
}

fn build_adapter(cli: &Cli) -> Result<Arc<dyn FieldAdapter>> {
    if !cli.driver.eq_ignore_ascii_case(SIMULATED_DRIVER) {
        bail!(
            "driver {} has no field adapter in this build; use --driver {}",
            cli.driver,
            SIMULATED_DRIVER
        );
    }
    let mut settings = GeneratorSettings::default();
    if let Some(points) = cli.sim_points {
        settings.points = points;
    }
    Ok(Arc::new(
        SimulatedAdapter::new(SIMULATED_DRIVER).with_generator(settings),
    ))
}
