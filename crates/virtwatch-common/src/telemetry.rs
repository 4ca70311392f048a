//! Log output and OTLP export setup
//!
//! Logs go to stdout as JSON (or plain text) filtered by `RUST_LOG`. When an
//! OTLP endpoint is configured, reconcile spans and the instruments in
//! [`crate::metrics`] are exported to it as well.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource as semconv;
use thiserror::Error;
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,virtwatch=debug,kube=info,tower=warn,hyper=warn";

/// Errors raised while setting up telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {reason}")]
    Exporter {
        /// "traces" or "metrics"
        signal: &'static str,
        /// Underlying error
        reason: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Telemetry settings of the operator binary
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported as `service.name`
    pub service_name: String,
    /// OTLP gRPC endpoint; spans and metrics stay local when unset
    pub otlp_endpoint: Option<String>,
    /// JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "virtwatch".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            json_logs: true,
        }
    }
}

/// Install the global subscriber, plus OTLP exporters when an endpoint is set
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let otel = match &config.otlp_endpoint {
        Some(endpoint) => Some(otlp_layer(endpoint, &config.service_name)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(log_filter())
        .with(log_layer(config.json_logs))
        .with(otel)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn log_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    }
}

/// Register the global meter provider and return a layer exporting spans
fn otlp_layer<S>(
    endpoint: &str,
    service_name: &str,
) -> Result<OpenTelemetryLayer<S, Tracer>, TelemetryError>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let resource = resource(service_name, |var| std::env::var(var).ok());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            reason: e.to_string(),
        })?;
    global::set_meter_provider(
        SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metric_exporter, runtime::Tokio).build())
            .with_resource(resource.clone())
            .build(),
    );

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            reason: e.to_string(),
        })?;
    let provider = TracerProvider::builder()
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    let tracer = provider.tracer(service_name.to_string());
    global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Service identity plus the pod identity injected by the downward API
fn resource(service_name: &str, env: impl Fn(&str) -> Option<String>) -> Resource {
    let mut attributes = vec![
        KeyValue::new(semconv::SERVICE_NAME, service_name.to_string()),
        KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    for (var, key) in [
        ("POD_NAME", semconv::K8S_POD_NAME),
        ("POD_NAMESPACE", semconv::K8S_NAMESPACE_NAME),
    ] {
        if let Some(value) = env(var) {
            attributes.push(KeyValue::new(key, value));
        }
    }
    Resource::new(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{Key, Value};

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn default_config_logs_json() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "virtwatch");
        assert!(config.json_logs);
    }

    #[test]
    fn resource_identifies_service() {
        let resource = resource("virtwatch-operator", |_| None);

        assert_eq!(
            resource.get(Key::new(semconv::SERVICE_NAME)),
            Some(Value::from("virtwatch-operator"))
        );
        assert!(resource.get(Key::new(semconv::SERVICE_VERSION)).is_some());
        assert!(resource.get(Key::new(semconv::K8S_POD_NAME)).is_none());
    }

    #[test]
    fn resource_includes_pod_identity_when_injected() {
        let resource = resource("virtwatch-operator", |var| match var {
            "POD_NAME" => Some("virtwatch-7d9f".to_string()),
            "POD_NAMESPACE" => Some("kubevirt".to_string()),
            _ => None,
        });

        assert_eq!(
            resource.get(Key::new(semconv::K8S_POD_NAME)),
            Some(Value::from("virtwatch-7d9f"))
        );
        assert_eq!(
            resource.get(Key::new(semconv::K8S_NAMESPACE_NAME)),
            Some(Value::from("kubevirt"))
        );
    }
}
