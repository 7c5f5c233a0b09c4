//! Telemetry initialization
//!
//! JSON structured logging via tracing, with an env-filter that can be
//! overridden through `RUST_LOG`.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize the tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Initialize telemetry for a component.
///
/// Sets up JSON structured logging with the current span attached to each
/// line. The default filter keeps our own crates at debug and the noisier
/// dependencies at info/warn; `RUST_LOG` overrides it.
pub fn init(service_name: &str) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,spiffe_csi_driver=debug,spiffe_approver=debug,kube=info,tower=warn,hyper=warn")
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(service = service_name, "telemetry initialized");
    Ok(())
}
