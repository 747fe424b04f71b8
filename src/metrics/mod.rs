//! Prometheus metrics for the HA layer
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

mod database;

pub use database::{DatabaseMetrics, QueryKind, QueryStats};

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// HA metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Health check metrics
    /// Health check results by status
    pub health_check_total: IntCounterVec,
    /// Current instance health status counts
    pub health_instances: IntGaugeVec,

    // Connection metrics
    /// Failed connection handouts (ping failed)
    pub connection_errors_total: IntCounter,
    /// Pool connections by pool and state
    pub pool_connections: IntGaugeVec,

    // Query metrics
    /// Total queries executed through the service
    pub queries_total: IntCounterVec,
    /// Query latency histogram (in seconds)
    pub query_duration_seconds: HistogramVec,
    /// Query errors by kind
    pub query_errors_total: IntCounterVec,

    // Failover metrics
    /// Finished failover operations by result
    pub failovers_total: IntCounterVec,
    /// Failover step latency (in seconds)
    pub failover_step_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        // Health check metrics
        let health_check_total = IntCounterVec::new(
            Opts::new(
                "athena_ha_health_check_total",
                "Total number of health checks by result",
            ),
            &["result"], // success, failure, no_pool
        )
        .unwrap();

        let health_instances = IntGaugeVec::new(
            Opts::new(
                "athena_ha_health_instances",
                "Current number of instances by health status",
            ),
            &["status"], // healthy, unhealthy, unknown
        )
        .unwrap();

        // Connection metrics
        let connection_errors_total = IntCounter::new(
            "athena_ha_connection_errors_total",
            "Total number of failed connection handouts",
        )
        .unwrap();

        let pool_connections = IntGaugeVec::new(
            Opts::new(
                "athena_ha_pool_connections",
                "Pool connections by state",
            ),
            &["pool", "state"], // open, in_use, idle
        )
        .unwrap();

        // Query metrics
        let queries_total = IntCounterVec::new(
            Opts::new("athena_ha_queries_total", "Total number of queries executed"),
            &["kind"], // read, write, other
        )
        .unwrap();

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "athena_ha_query_duration_seconds",
                "Query latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                10.0,
            ]),
            &["kind"],
        )
        .unwrap();

        let query_errors_total = IntCounterVec::new(
            Opts::new("athena_ha_query_errors_total", "Total number of query errors"),
            &["kind"],
        )
        .unwrap();

        // Failover metrics
        let failovers_total = IntCounterVec::new(
            Opts::new(
                "athena_ha_failovers_total",
                "Total number of failover operations by result",
            ),
            &["result"], // completed, rolled_back
        )
        .unwrap();

        let failover_step_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "athena_ha_failover_step_duration_seconds",
                "Failover step latency in seconds",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["step", "status"],
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(health_check_total.clone()))
            .unwrap();
        registry
            .register(Box::new(health_instances.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_connections.clone()))
            .unwrap();
        registry
            .register(Box::new(queries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(query_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(failovers_total.clone()))
            .unwrap();
        registry
            .register(Box::new(failover_step_duration_seconds.clone()))
            .unwrap();

        Self {
            registry,
            health_check_total,
            health_instances,
            connection_errors_total,
            pool_connections,
            queries_total,
            query_duration_seconds,
            query_errors_total,
            failovers_total,
            failover_step_duration_seconds,
        }
    }

    /// Record a health check result
    pub fn record_health_check(&self, result: &str) {
        self.health_check_total.with_label_values(&[result]).inc();
    }

    /// Update health instance counts
    pub fn set_health_instances(&self, healthy: i64, unhealthy: i64, unknown: i64) {
        self.health_instances
            .with_label_values(&["healthy"])
            .set(healthy);
        self.health_instances
            .with_label_values(&["unhealthy"])
            .set(unhealthy);
        self.health_instances
            .with_label_values(&["unknown"])
            .set(unknown);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors_total.inc();
    }

    /// Publish pool connection counts
    pub fn set_pool_connections(&self, pool_id: &str, open: usize, in_use: usize, idle: usize) {
        self.pool_connections
            .with_label_values(&[pool_id, "open"])
            .set(open as i64);
        self.pool_connections
            .with_label_values(&[pool_id, "in_use"])
            .set(in_use as i64);
        self.pool_connections
            .with_label_values(&[pool_id, "idle"])
            .set(idle as i64);
    }

    /// Drop the gauges of a destroyed pool
    pub fn remove_pool(&self, pool_id: &str) {
        for state in ["open", "in_use", "idle"] {
            let _ = self.pool_connections.remove_label_values(&[pool_id, state]);
        }
    }

    /// Record a query execution
    pub fn record_query(&self, kind: QueryKind, duration_secs: f64, failed: bool) {
        self.queries_total.with_label_values(&[kind.as_str()]).inc();
        self.query_duration_seconds
            .with_label_values(&[kind.as_str()])
            .observe(duration_secs);
        if failed {
            self.query_errors_total
                .with_label_values(&[kind.as_str()])
                .inc();
        }
    }

    /// Record a finished failover operation
    pub fn record_failover(&self, result: &str) {
        self.failovers_total.with_label_values(&[result]).inc();
    }

    /// Record a finished failover step
    pub fn record_failover_step(&self, step: &str, status: &str, duration_secs: f64) {
        self.failover_step_duration_seconds
            .with_label_values(&[step, status])
            .observe(duration_secs);
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
            }
            "/health" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK"))),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found"))),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_families() {
        let m = Metrics::new();
        m.record_health_check("success");
        m.record_query(QueryKind::Read, 0.002, false);
        m.record_failover("completed");
        m.set_pool_connections("pool_test", 3, 1, 2);

        let text = m.gather();
        assert!(text.contains("athena_ha_health_check_total"));
        assert!(text.contains("athena_ha_queries_total"));
        assert!(text.contains("athena_ha_failovers_total"));
        assert!(text.contains("pool_test"));

        m.remove_pool("pool_test");
        assert!(!m.gather().contains("pool_test"));
    }
}
