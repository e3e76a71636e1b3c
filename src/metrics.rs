//! Metrics initialization for Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape, and describes the
/// counters the engine records.
///
/// When metrics are disabled, this is a no-op. The `metrics` crate
/// handles unregistered metrics gracefully (they become no-ops).
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| Error::Metrics(err.to_string()))?;

    metrics::describe_counter!(
        "sentinel_queries_total",
        "Intercepted DNS queries by outcome"
    );
    metrics::describe_counter!(
        "sentinel_upstream_attempts_total",
        "Upstream resolver attempts by result"
    );
    metrics::describe_counter!(
        "sentinel_frames_dropped_total",
        "Tunnel frames discarded without processing"
    );

    Ok(())
}
