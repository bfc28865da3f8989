//! Prometheus metrics for the rippledb server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use rippledb_core::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0];

/// Prometheus metrics for the rippledb server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Total requests by request type.
    pub requests_total: CounterVec,
    /// Total error replies by error code.
    pub errors_total: CounterVec,
    /// Request duration histogram by request type.
    pub request_duration: HistogramVec,
    /// Relays currently streaming to replicas.
    pub relays_active: Gauge,
    /// Rows sent to replicas, snapshot rows included.
    pub rows_relayed_total: Counter,
    /// Rows received from a master and applied.
    pub rows_applied_total: Counter,
    /// Local vclock component per origin.
    pub vclock: GaugeVec,
    /// Applier state as a number, see `ApplierState::as_gauge`.
    pub applier_state: Gauge,
    pub tuples_total: Gauge,
    pub wal_segments: Gauge,
    pub wal_size_bytes: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "rippledb_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "rippledb_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let requests_total = CounterVec::new(
            Opts::new("rippledb_requests_total", "Total requests by type"),
            &["type"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("rippledb_errors_total", "Total error replies by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "rippledb_request_duration_seconds",
                "Request duration in seconds by type",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["type"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        // Replication
        let relays_active = Gauge::with_opts(Opts::new(
            "rippledb_relays_active",
            "Number of replicas currently subscribed",
        ))?;
        registry.register(Box::new(relays_active.clone()))?;

        let rows_relayed_total = Counter::with_opts(Opts::new(
            "rippledb_rows_relayed_total",
            "Total rows sent to replicas",
        ))?;
        registry.register(Box::new(rows_relayed_total.clone()))?;

        let rows_applied_total = Counter::with_opts(Opts::new(
            "rippledb_rows_applied_total",
            "Total replicated rows applied",
        ))?;
        registry.register(Box::new(rows_applied_total.clone()))?;

        let vclock = GaugeVec::new(
            Opts::new("rippledb_vclock", "Applied LSN per origin replica"),
            &["replica_id"],
        )?;
        registry.register(Box::new(vclock.clone()))?;

        let applier_state = Gauge::with_opts(Opts::new(
            "rippledb_applier_state",
            "Replica applier state (0 idle .. 5 closed)",
        ))?;
        registry.register(Box::new(applier_state.clone()))?;

        // Storage
        let tuples_total = Gauge::with_opts(Opts::new(
            "rippledb_tuples_total",
            "Number of tuples across all spaces",
        ))?;
        registry.register(Box::new(tuples_total.clone()))?;

        let wal_segments = Gauge::with_opts(Opts::new(
            "rippledb_wal_segments",
            "Number of WAL segment files",
        ))?;
        registry.register(Box::new(wal_segments.clone()))?;

        let wal_size_bytes = Gauge::with_opts(Opts::new(
            "rippledb_wal_size_bytes",
            "Total size of the WAL in bytes",
        ))?;
        registry.register(Box::new(wal_size_bytes.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            errors_total,
            request_duration,
            relays_active,
            rows_relayed_total,
            rows_applied_total,
            vclock,
            applier_state,
            tuples_total,
            wal_segments,
            wal_size_bytes,
        })
    }

    /// Refreshes the gauges derived from engine state.
    pub fn update_engine_gauges(&self, engine: &Engine) {
        for (replica_id, lsn) in engine.vclock().iter() {
            self.vclock
                .with_label_values(&[&replica_id.to_string()])
                .set(lsn as f64);
        }
        self.tuples_total.set(engine.tuple_count() as f64);
        self.wal_segments.set(engine.wal().segment_ids().len() as f64);
        self.wal_size_bytes.set(engine.wal().total_size() as f64);
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// Engine gauges are refreshed on every scrape.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    engine: Arc<Engine>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let engine = engine.clone();
                                async move { handle_request(req, metrics, engine).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn respond(status: StatusCode, content_type: Option<&'static str>, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    engine: Arc<Engine>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => {
            metrics.update_engine_gauges(&engine);
            match metrics.encode() {
                Ok(body) => respond(
                    StatusCode::OK,
                    Some("text/plain; version=0.0.4; charset=utf-8"),
                    body,
                ),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                    e.to_string().into_bytes(),
                ),
            }
        }
        "/health" | "/healthz" => respond(StatusCode::OK, None, b"OK".to_vec()),
        _ => respond(StatusCode::NOT_FOUND, None, b"Not Found".to_vec()),
    };

    Ok(response)
}
