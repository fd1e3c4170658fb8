//! Tracing bootstrap
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a console
//! layer. With the `otlp` feature, spans are also exported over OTLP when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

#[cfg(feature = "otlp")]
use opentelemetry::{trace::TracerProvider as _, KeyValue};
#[cfg(feature = "otlp")]
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
#[cfg(feature = "otlp")]
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_SERVICE_NAME: &str = "hackgpt";
const DEFAULT_LOG_FILTER: &str = "info";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to exported spans
    pub service_name: String,
    /// OTLP endpoint (e.g., "http://localhost:4317")
    pub otlp_endpoint: Option<String>,
    /// Log filter (e.g., "info", "hackgpt_orchestrator=debug")
    pub log_filter: Option<String>,
    pub enable_console: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            otlp_endpoint: None,
            log_filter: None,
            enable_console: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// - `OTEL_SERVICE_NAME`: service name (default: "hackgpt")
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint
    /// - `RUST_LOG` or `LOG_LEVEL`: log filter
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            enable_console: true,
        }
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Filter built from `log_filter`, falling back to `info`
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_deref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Flushes exported spans when dropped
///
/// Keep it alive for the lifetime of the process.
pub struct TelemetryGuard {
    #[cfg(feature = "otlp")]
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otlp")]
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {:?}", e);
            }
        }
    }
}

/// Install the global subscriber
///
/// A second call leaves the existing subscriber in place.
///
/// ```ignore
/// use hackgpt_orchestrator::telemetry::{init_telemetry, TelemetryConfig};
///
/// let _guard = init_telemetry(TelemetryConfig::from_env());
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let console_layer = config.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(config.env_filter())
    });

    #[cfg(feature = "otlp")]
    let guard = {
        let (provider, otel_layer, otel_status) = match &config.otlp_endpoint {
            Some(endpoint) => match build_otlp_tracer(endpoint, &config.service_name) {
                Ok((provider, tracer)) => {
                    let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                    (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
                }
                Err(e) => (None, None, Some(Err(e.to_string()))),
            },
            None => (None, None, None),
        };

        let installed = tracing_subscriber::registry()
            .with(console_layer)
            .with(otel_layer)
            .try_init()
            .is_ok();

        match otel_status {
            Some(Ok(endpoint)) if installed => {
                tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled");
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Failed to initialize OTLP tracer, continuing without export");
            }
            _ => {}
        }

        TelemetryGuard { provider }
    };

    #[cfg(not(feature = "otlp"))]
    let guard = {
        let installed = tracing_subscriber::registry()
            .with(console_layer)
            .try_init()
            .is_ok();
        if installed && config.otlp_endpoint.is_some() {
            tracing::warn!("OTEL_EXPORTER_OTLP_ENDPOINT is set but the otlp feature is disabled");
        }
        TelemetryGuard {}
    };

    guard
}

#[cfg(feature = "otlp")]
fn build_otlp_tracer(
    endpoint: &str,
    service_name: &str,
) -> Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer), opentelemetry_otlp::ExporterBuildError>
{
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(std::time::Duration::from_secs(10))
        .build()?;

    let resource = Resource::builder()
        .with_attributes([KeyValue::new("service.name", service_name.to_string())])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer(DEFAULT_SERVICE_NAME);
    Ok((provider, tracer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "hackgpt");
        assert!(config.otlp_endpoint.is_none());
        assert!(config.enable_console);
    }

    #[test]
    fn test_invalid_filter_falls_back_to_info() {
        let fallback = EnvFilter::new("info").to_string();

        let config = TelemetryConfig::default().with_log_filter("hackgpt=verbose");
        assert_eq!(config.env_filter().to_string(), fallback);

        let config = TelemetryConfig::default().with_log_filter("hackgpt_orchestrator=debug");
        assert_ne!(config.env_filter().to_string(), fallback);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let _first = init_telemetry(TelemetryConfig::default());
        let _second = init_telemetry(TelemetryConfig::default());
    }
}
