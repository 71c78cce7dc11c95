//! ---
//! fgw_section: "06-observability"
//! fgw_subsection: "module"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Metrics collection and export utilities."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Registry shared by every metric bundle of the process.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Bind `addr` and serve the registry in the Prometheus text format at `/metrics`.
pub async fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind metrics exporter on {addr}"))?;
    let addr = listener.local_addr().context("metrics exporter has no local address")?;
    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(registry);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
            .context("metrics exporter failed")
    });
    info!(address = %addr, "metrics exporter listening");

    Ok(MetricsServer {
        addr,
        stop: Some(stop_tx),
        task,
    })
}

async fn render(State(registry): State<SharedRegistry>) -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut body) {
        error!(error = %err, "metrics could not be encoded");
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
        body,
    )
        .into_response()
}

/// Running `/metrics` exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address, which differs from the requested one for port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Metrics recorded by the driver process itself.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    build_info: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "fgw_driver_starts_total",
            "Total number of times the driver process has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new("fgw_driver_build_info", "Build metadata for the running driver"),
            &["version", "driver", "instance"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn set_build_info(&self, version: &str, driver: &str, instance: u32) {
        self.build_info
            .with_label_values(&[version, driver, &instance.to_string()])
            .set(1);
    }
}

/// Ingestion pipeline instrumentation.
#[derive(Clone, Debug)]
pub struct IngestMetrics {
    enqueued: IntCounter,
    dropped: IntCounter,
    queue_depth: IntGauge,
    batch_size: Histogram,
    batch_seconds: Histogram,
    matched: IntCounter,
    modified: IntCounter,
    write_failures: IntCounter,
    tags_created: IntCounterVec,
}

impl IngestMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let enqueued = IntCounter::with_opts(Opts::new(
            "fgw_ingest_enqueued_total",
            "Value updates accepted into the ingestion queue",
        ))?;
        registry.register(Box::new(enqueued.clone()))?;

        let dropped = IntCounter::with_opts(Opts::new(
            "fgw_ingest_dropped_total",
            "Oldest queued value updates discarded to honour the queue bound",
        ))?;
        registry.register(Box::new(dropped.clone()))?;

        let queue_depth = IntGauge::with_opts(Opts::new(
            "fgw_ingest_queue_depth",
            "Value updates waiting to be written to the store",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("fgw_ingest_batch_size", "Items per bulk write")
                .buckets(prometheus::exponential_buckets(1.0, 2.0, 12)?),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let batch_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "fgw_ingest_batch_seconds",
                "Time spent assembling and writing one batch",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 14)?),
        )?;
        registry.register(Box::new(batch_seconds.clone()))?;

        let matched = IntCounter::with_opts(Opts::new(
            "fgw_ingest_matched_total",
            "Point records matched by bulk updates",
        ))?;
        registry.register(Box::new(matched.clone()))?;

        let modified = IntCounter::with_opts(Opts::new(
            "fgw_ingest_modified_total",
            "Point records modified by bulk updates",
        ))?;
        registry.register(Box::new(modified.clone()))?;

        let write_failures = IntCounter::with_opts(Opts::new(
            "fgw_ingest_write_failures_total",
            "Bulk writes aborted by store errors",
        ))?;
        registry.register(Box::new(write_failures.clone()))?;

        let tags_created = IntCounterVec::new(
            Opts::new(
                "fgw_ingest_tags_created_total",
                "Point records auto-created per connection",
            ),
            &["connection"],
        )?;
        registry.register(Box::new(tags_created.clone()))?;

        Ok(Self {
            enqueued,
            dropped,
            queue_depth,
            batch_size,
            batch_seconds,
            matched,
            modified,
            write_failures,
            tags_created,
        })
    }

    pub fn record_enqueue(&self, dropped: u64) {
        self.enqueued.inc();
        if dropped > 0 {
            self.dropped.inc_by(dropped);
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn record_batch(&self, items: usize, matched: u64, modified: u64, elapsed: Duration) {
        self.batch_size.observe(items as f64);
        self.batch_seconds.observe(elapsed.as_secs_f64());
        self.matched.inc_by(matched);
        self.modified.inc_by(modified);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.inc();
    }

    pub fn record_tag_created(&self, connection: u32) {
        self.tags_created
            .with_label_values(&[&connection.to_string()])
            .inc();
    }
}

/// Command dispatcher instrumentation.
#[derive(Clone, Debug)]
pub struct CommandMetrics {
    outcomes: IntCounterVec,
    restarts: IntCounter,
}

impl CommandMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let outcomes = IntCounterVec::new(
            Opts::new(
                "fgw_command_outcomes_total",
                "Commands processed, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(outcomes.clone()))?;

        let restarts = IntCounter::with_opts(Opts::new(
            "fgw_command_feed_restarts_total",
            "Command subscription restarts after errors",
        ))?;
        registry.register(Box::new(restarts.clone()))?;

        Ok(Self { outcomes, restarts })
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn record_restart(&self) {
        self.restarts.inc();
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.get()
    }
}

/// Redundancy controller instrumentation.
#[derive(Clone, Debug)]
pub struct RedundancyMetrics {
    active: IntGauge,
    claims: IntCounter,
    demotions: IntCounter,
    tick_failures: IntCounter,
}

impl RedundancyMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let active = IntGauge::with_opts(Opts::new(
            "fgw_redundancy_active",
            "Indicator (0/1) whether this instance holds the active role",
        ))?;
        registry.register(Box::new(active.clone()))?;

        let claims = IntCounter::with_opts(Opts::new(
            "fgw_redundancy_claims_total",
            "Times this instance claimed the active role",
        ))?;
        registry.register(Box::new(claims.clone()))?;

        let demotions = IntCounter::with_opts(Opts::new(
            "fgw_redundancy_demotions_total",
            "Times this instance returned to standby",
        ))?;
        registry.register(Box::new(demotions.clone()))?;

        let tick_failures = IntCounter::with_opts(Opts::new(
            "fgw_redundancy_tick_failures_total",
            "Redundancy ticks that could not reach the store",
        ))?;
        registry.register(Box::new(tick_failures.clone()))?;

        Ok(Self {
            active,
            claims,
            demotions,
            tick_failures,
        })
    }

    pub fn set_active(&self, active: bool) {
        self.active.set(i64::from(active));
    }

    pub fn record_claim(&self) {
        self.claims.inc();
    }

    pub fn record_demotion(&self) {
        self.demotions.inc();
    }

    pub fn record_tick_failure(&self) {
        self.tick_failures.inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn bundles_register_on_one_registry() {
        let registry = new_registry();
        let ingest = IngestMetrics::new(&registry).unwrap();
        let commands = CommandMetrics::new(&registry).unwrap();
        let redundancy = RedundancyMetrics::new(&registry).unwrap();
        ingest.record_enqueue(2);
        ingest.record_tag_created(3);
        commands.record_outcome("expired");
        redundancy.set_active(true);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"fgw_ingest_dropped_total".to_owned()));
        assert!(names.contains(&"fgw_command_outcomes_total".to_owned()));
        assert!(names.contains(&"fgw_redundancy_active".to_owned()));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = new_registry();
        IngestMetrics::new(&registry).unwrap();
        assert!(IngestMetrics::new(&registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_text_format() {
        let registry = new_registry();
        let daemon = DaemonMetrics::new(&registry).unwrap();
        daemon.inc_start();
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let mut stream = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.contains("fgw_driver_starts_total 1"));

        server.shutdown().await.unwrap();
    }
}
