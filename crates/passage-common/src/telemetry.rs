//! Telemetry initialization for tracing and OTLP export
//!
//! Provides unified telemetry setup with:
//! - JSON structured logging with trace context
//! - OTLP export for traces when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//! - Kubernetes resource detection (pod, namespace, node)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize OpenTelemetry tracer
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces (e.g., "passage-gateway")
    pub service_name: String,

    /// OTLP endpoint for trace export. If None, spans are only logged locally.
    pub otlp_endpoint: Option<String>,

    /// Default log level when RUST_LOG is not set
    pub log_level: String,
}

impl TelemetryConfig {
    /// Create a config for the given service with the OTLP endpoint taken
    /// from the environment
    pub fn new(service_name: impl Into<String>, log_level: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_level: log_level.into(),
        }
    }
}

/// Environment variables the downward API populates, mapped to the OTel
/// resource attributes they carry
const DOWNWARD_API_ATTRIBUTES: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Initialize telemetry with the given configuration
///
/// Sets up the W3C TraceContext propagator, an optional OTLP span exporter,
/// and JSON structured logging filtered by `RUST_LOG` (falling back to the
/// configured level).
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;
            let provider = TracerProvider::builder()
                .with_batch_exporter(exporter, runtime::Tokio)
                .with_resource(service_resource(&config.service_name))
                .build();
            global::set_tracer_provider(provider.clone());
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let default_filter = format!(
        "{},passage=debug,kube=info,tower=warn,hyper=warn",
        config.log_level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(())
}

/// Resource attributes identifying this process: service name and version,
/// plus whatever the downward API exposes about the pod
fn service_resource(service_name: &str) -> Resource {
    let identity = [
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    let pod = DOWNWARD_API_ATTRIBUTES.iter().filter_map(|(var, attribute)| {
        std::env::var(var)
            .ok()
            .map(|value| KeyValue::new(*attribute, value))
    });

    Resource::new(identity.into_iter().chain(pod))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_new() {
        let config = TelemetryConfig {
            service_name: "passage-gateway".to_string(),
            otlp_endpoint: None,
            log_level: "info".to_string(),
        };
        assert_eq!(config.service_name, "passage-gateway");
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_service_resource_is_populated() {
        let resource = service_resource("test-service");
        assert!(!resource.is_empty());
    }
}
