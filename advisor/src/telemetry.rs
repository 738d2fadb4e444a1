//! Tracing and metrics bootstrap.

use crate::config::StatsdConfig;
use metrics_exporter_statsd::StatsdBuilder;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("could not build statsd recorder: {0}")]
    Statsd(String),

    #[error("a global metrics recorder is already installed")]
    RecorderInstalled,
}

/// Installs the fmt subscriber with `RUST_LOG`-style filtering. Safe to
/// call more than once; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Installs the StatsD metrics recorder and registers every metric
/// description the workspace exposes.
pub fn init_metrics(config: &StatsdConfig) -> Result<(), TelemetryError> {
    let recorder = StatsdBuilder::from(config.host.as_str(), config.port)
        .with_queue_size(5_000)
        .with_buffer_size(1_024)
        .build(Some(config.prefix.as_str()))
        .map_err(|err| TelemetryError::Statsd(err.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::RecorderInstalled)?;

    shared::register_metrics(dispatch::metrics_defs::ALL_METRICS);
    shared::register_metrics(crate::metrics_defs::ALL_METRICS);
    Ok(())
}
