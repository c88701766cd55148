//! Prometheus metrics for the operator.
//!
//! All collectors live in one [`Metrics`] value that owns its own
//! [`Registry`]; it is built once in `main` and shared by `Arc`.

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use shardkeeper::crd::ClusterState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

const STATES: [ClusterState; 4] = [
    ClusterState::Initializing,
    ClusterState::Bootstrap,
    ClusterState::Ready,
    ClusterState::Failed,
];

pub struct Metrics {
    registry: Registry,
    reconciliations: CounterVec,
    reconciliation_duration: HistogramVec,
    errors: CounterVec,
    cluster_state: GaugeVec,
}

impl Metrics {
    /// Create and register every collector. Registering the same collector
    /// twice in one registry is an error.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = CounterVec::new(
            Opts::new(
                "shardkeeper_reconciliations_total",
                "Total number of reconciliations",
            ),
            &["result"],
        )?;
        let reconciliation_duration = HistogramVec::new(
            HistogramOpts::new(
                "shardkeeper_reconciliation_duration_seconds",
                "Duration of reconciliations",
            ),
            &["cluster"],
        )?;
        let errors = CounterVec::new(
            Opts::new("shardkeeper_errors_total", "Total number of errors"),
            &["type"],
        )?;
        let cluster_state = GaugeVec::new(
            Opts::new(
                "shardkeeper_cluster_state",
                "Current state of each RedisCluster (1 for the active state)",
            ),
            &["namespace", "cluster", "state"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconciliation_duration.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(cluster_state.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconciliation_duration,
            errors,
            cluster_state,
        })
    }

    /// Record a successful reconciliation
    pub fn record_success(&self, cluster: &str, duration_secs: f64) {
        self.reconciliations.with_label_values(&["success"]).inc();
        self.reconciliation_duration
            .with_label_values(&[cluster])
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_failure(&self, cluster: &str, kind: &str, duration_secs: f64) {
        self.reconciliations.with_label_values(&["failure"]).inc();
        self.errors.with_label_values(&[kind]).inc();
        self.reconciliation_duration
            .with_label_values(&[cluster])
            .observe(duration_secs);
    }

    pub fn set_cluster_state(&self, namespace: &str, cluster: &str, state: ClusterState) {
        for candidate in STATES {
            let value = if candidate == state { 1.0 } else { 0.0 };
            self.cluster_state
                .with_label_values(&[namespace, cluster, candidate.as_str()])
                .set(value);
        }
    }

    /// Drop the state series of a deleted cluster.
    pub fn forget_cluster(&self, namespace: &str, cluster: &str) {
        for candidate in STATES {
            let _ = self
                .cluster_state
                .remove_label_values(&[namespace, cluster, candidate.as_str()]);
        }
    }

    /// Text exposition of everything in the registry.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Run the metrics server
pub async fn run_metrics_server(port: u16, metrics: Arc<Metrics>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Metrics server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let body = metrics.render();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_success("cache", 0.5);
        metrics.record_failure("cache", "exec", 0.1);
        metrics.set_cluster_state("default", "cache", ClusterState::Ready);

        let text = metrics.render();
        assert!(text.contains("shardkeeper_reconciliations_total{result=\"success\"} 1"));
        assert!(text.contains("shardkeeper_errors_total{type=\"exec\"} 1"));
        assert!(text.contains(
            "shardkeeper_cluster_state{cluster=\"cache\",namespace=\"default\",state=\"Ready\"} 1"
        ));
        assert!(text.contains(
            "shardkeeper_cluster_state{cluster=\"cache\",namespace=\"default\",state=\"Failed\"} 0"
        ));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_success("a", 1.0);
        assert!(!second.render().contains("result=\"success\""));
    }

    #[test]
    fn test_double_registration_fails() {
        let metrics = Metrics::new().unwrap();
        let duplicate = CounterVec::new(
            Opts::new("shardkeeper_reconciliations_total", "dup"),
            &["result"],
        )
        .unwrap();
        assert!(metrics.registry.register(Box::new(duplicate)).is_err());
    }
}
