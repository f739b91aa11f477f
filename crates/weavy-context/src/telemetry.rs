//! Metrics and logging for hosts embedding the context.
//!
//! The context emits `tracing` events and the counters named here whether or
//! not anything listens. With the `telemetry` feature, hosts that have no
//! subscriber or recorder of their own can install a console subscriber and a
//! Prometheus recorder.
//!
//! ```ignore
//! use weavy_context::telemetry::{self, TelemetryConfig};
//!
//! telemetry::init(TelemetryConfig::from_env("chat-widget"))?;
//!
//! // later, from a debug endpoint
//! let text = telemetry::render();
//! ```

/// Token factory calls, one per attempt including the refresh after an
/// unusable token.
pub const TOKEN_FETCHES: &str = "weavy_token_fetch_total";
/// HTTP responses from the environment, labelled with `status`.
pub const HTTP_REQUESTS: &str = "weavy_http_requests_total";
/// Websocket connection attempts to the realtime hub, reconnects included.
pub const REALTIME_CONNECT_ATTEMPTS: &str = "weavy_realtime_connect_attempts_total";

/// Registers descriptions for the context's counters with the installed
/// recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(TOKEN_FETCHES, "Token factory calls");
    metrics::describe_counter!(HTTP_REQUESTS, "HTTP responses by status code");
    metrics::describe_counter!(
        REALTIME_CONNECT_ATTEMPTS,
        "Realtime hub connection attempts"
    );
}

#[cfg(feature = "telemetry")]
pub use exporter::{TelemetryConfig, init, init_metrics, render};

#[cfg(feature = "telemetry")]
mod exporter {
    use std::sync::OnceLock;

    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer};

    static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

    #[derive(Debug, Clone)]
    pub struct TelemetryConfig {
        /// Name attached to the startup event.
        pub service_name: String,
        /// Console log level when `RUST_LOG` is unset.
        pub console_level: Level,
    }

    impl TelemetryConfig {
        /// DEBUG in debug builds, INFO otherwise. `RUST_LOG` overrides either.
        pub fn from_env(service_name: impl Into<String>) -> Self {
            let console_level = if cfg!(debug_assertions) {
                Level::DEBUG
            } else {
                Level::INFO
            };
            Self {
                service_name: service_name.into(),
                console_level,
            }
        }
    }

    /// Installs the Prometheus recorder and the console subscriber.
    ///
    /// A subscriber that is already installed is left in place.
    pub fn init(config: TelemetryConfig) -> Result<(), BuildError> {
        init_metrics()?;

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.as_str().to_lowercase()));
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_filter(env_filter);

        if tracing_subscriber::registry()
            .with(console_layer)
            .try_init()
            .is_ok()
        {
            tracing::debug!(service = %config.service_name, "telemetry initialized");
        }
        Ok(())
    }

    /// Installs the Prometheus recorder once and returns its handle.
    pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
        if let Some(handle) = PROMETHEUS_HANDLE.get() {
            return Ok(handle);
        }
        let handle = PrometheusBuilder::new().install_recorder()?;
        let handle = PROMETHEUS_HANDLE.get_or_init(|| handle);
        super::describe_metrics();
        Ok(handle)
    }

    /// Metrics in Prometheus text format, empty before [`init_metrics`].
    pub fn render() -> String {
        PROMETHEUS_HANDLE
            .get()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}
