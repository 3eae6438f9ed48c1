//! Observability infrastructure: tracing and metrics.

use crate::config::Config;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize logging and, when configured, the Prometheus exporter.
///
/// `RUST_LOG` takes precedence over the configured log level. Must be called
/// once, from within a Tokio runtime when `metrics_port` is set.
pub fn init(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], port)).install()?;
        tracing::info!("Prometheus metrics exporter listening on port {}", port);
    }

    metrics::register_core_metrics();

    Ok(())
}
