//! Metrics export for the roomcast server.
//!
//! Recording happens in `roomcast_core::metrics`; this module installs the
//! Prometheus exporter and describes the series to it.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use roomcast_core::metrics::names;
use std::net::SocketAddr;
use tracing::{debug, info};

/// Describe every metric roomcast records to the installed recorder.
fn describe_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames by direction");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames by direction");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms with members");
    metrics::describe_counter!(names::JOINS_TOTAL, "Total number of room joins");
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Fan-out deliveries dropped because a member's queue was full"
    );
    metrics::describe_histogram!(
        names::PUBLISH_LATENCY_SECONDS,
        "Bus publish latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by kind");

    debug!("Metrics described");
}

/// Start the Prometheus metrics server.
///
/// Descriptions are only kept by a recorder that is already installed, so
/// they are sent after the exporter is in place.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {}", addr))?;
    describe_metrics();

    info!("Metrics server listening on {}", addr);
    Ok(())
}
