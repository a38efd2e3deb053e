//! Tracing and OpenTelemetry setup.
//!
//! Sets up the `tracing` subscriber (pretty or JSON console output per
//! config) and, when enabled, an OTLP span exporter so deliveries can
//! be followed across the engine in Jaeger or Tempo.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{RandomIdGenerator, TracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogSettings, OtelSettings};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
}

/// Keeps the tracer provider alive for the process lifetime; spans stop
/// exporting once this is dropped.
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.provider.take().is_some() {
            tracing::info!("OTLP span exporter shut down");
        }
    }
}

/// Install the subscriber stack. Call once at startup and hold the
/// returned guard until shutdown.
pub fn init_telemetry(
    log: &LogSettings,
    otel: &OtelSettings,
) -> Result<TelemetryGuard, TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level.clone()));

    let console: Box<dyn Layer<Registry> + Send + Sync> = if log.format == "json" {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let provider = if otel.enabled {
        Some(span_provider(otel)?)
    } else {
        None
    };

    // The boxed console layer is typed against Registry, so it goes on
    // first; EnvFilter layers onto any subscriber and still filters the
    // whole stack from the back.
    match &provider {
        Some(provider) => {
            let tracer = provider.tracer(otel.service_name.clone());
            tracing_subscriber::registry()
                .with(console)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .with(filter)
                .init();
            tracing::info!(
                endpoint = %otel.endpoint,
                service_name = %otel.service_name,
                "Tracing initialized with OTLP export"
            );
        }
        None => {
            tracing_subscriber::registry().with(console).with(filter).init();
            tracing::info!("Tracing initialized (OpenTelemetry disabled)");
        }
    }

    Ok(TelemetryGuard { provider })
}

fn span_provider(otel: &OtelSettings) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otel.endpoint)
        .build()
        .map_err(|e| TelemetryError::ExporterBuild(e.to_string()))?;

    let resource = Resource::new([
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            otel.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ]);

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build())
}
