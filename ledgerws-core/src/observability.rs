//! OpenTelemetry and log output setup
//!
//! Applications embedding the client call [`init_observability`] once at
//! startup. Depending on the configuration it installs an OTLP/gRPC span
//! exporter bridged into `tracing`, an OTLP/gRPC meter provider that
//! `ClientMetrics` in the client crate records into, and a `tracing-subscriber`
//! registry filtered by `RUST_LOG` or the configured directive.
//!
//! `OTEL_EXPORTER_OTLP_ENDPOINT` provides the default collector address.
//! [`shutdown_observability`] flushes whatever was installed.
//!
//! ```rust,no_run
//! use ledgerws_core::{LogFormat, ObservabilityConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ObservabilityConfig::new("ledger-watcher")
//!         .metrics(false)
//!         .with_log_format(LogFormat::Pretty)
//!         .with_log_filter("ledgerws_client=debug,info");
//!     ledgerws_core::init_observability(config).expect("observability");
//! }
//! ```

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_COLLECTOR: &str = "http://localhost:4317";

/// Providers installed by [`init_observability`], kept for shutdown.
static INSTALLED: Mutex<Option<Installed>> = Mutex::new(None);

struct Installed {
    tracer: Option<SdkTracerProvider>,
    meter: Option<SdkMeterProvider>,
}

/// Shape of log lines written by the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line, with target, thread id and line number
    #[default]
    Json,
    /// Human-readable single lines
    Pretty,
}

/// Observability configuration
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// `service.name` resource attribute, tracer and meter scope name
    pub service_name: String,
    /// `service.version` resource attribute
    pub service_version: String,
    /// OTLP/gRPC collector endpoint
    pub collector_endpoint: String,
    /// Export spans to the collector
    pub export_traces: bool,
    /// Export metrics to the collector
    pub export_metrics: bool,
    /// How often the metric reader pushes to the collector
    pub export_interval: Duration,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Log line shape
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self::new("ledgerws")
    }
}

impl ObservabilityConfig {
    /// Full export to the collector from the environment, JSON logs at `info`
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            collector_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_COLLECTOR.to_string()),
            export_traces: true,
            export_metrics: true,
            export_interval: Duration::from_secs(30),
            log_filter: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }

    /// Local logging only, nothing exported
    pub fn logs_only(service_name: impl Into<String>) -> Self {
        Self::new(service_name).traces(false).metrics(false)
    }

    pub fn with_collector(mut self, endpoint: impl Into<String>) -> Self {
        self.collector_endpoint = endpoint.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    pub fn with_export_interval(mut self, interval: Duration) -> Self {
        self.export_interval = interval;
        self
    }

    /// Enable or disable span export
    pub fn traces(mut self, enable: bool) -> Self {
        self.export_traces = enable;
        self
    }

    /// Enable or disable metrics export
    pub fn metrics(mut self, enable: bool) -> Self {
        self.export_metrics = enable;
        self
    }

    fn resource(&self) -> Resource {
        use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};

        Resource::builder_empty()
            .with_attributes([
                KeyValue::new(SERVICE_NAME, self.service_name.clone()),
                KeyValue::new(SERVICE_VERSION, self.service_version.clone()),
            ])
            .build()
    }
}

/// Install exporters and the global `tracing` subscriber.
///
/// Must run inside a tokio runtime when anything is exported (the exporters
/// use tonic). A second call fails because the global subscriber is taken.
pub fn init_observability(config: ObservabilityConfig) -> Result<(), BoxError> {
    let tracer_provider = config
        .export_traces
        .then(|| span_provider(&config))
        .transpose()?;
    let meter_provider = config
        .export_metrics
        .then(|| meter_provider(&config))
        .transpose()?;

    let tracer = tracer_provider.as_ref().map(|provider| {
        use opentelemetry::trace::TracerProvider as _;
        provider.tracer(config.service_name.clone())
    });
    install_subscriber(&config, tracer)?;

    if let Some(provider) = &tracer_provider {
        global::set_tracer_provider(provider.clone());
    }
    if let Some(provider) = &meter_provider {
        global::set_meter_provider(provider.clone());
    }
    *INSTALLED.lock().unwrap_or_else(PoisonError::into_inner) = Some(Installed {
        tracer: tracer_provider,
        meter: meter_provider,
    });

    tracing::info!(
        service_name = %config.service_name,
        collector = %config.collector_endpoint,
        traces = config.export_traces,
        metrics = config.export_metrics,
        "Observability initialized"
    );
    Ok(())
}

fn span_provider(config: &ObservabilityConfig) -> Result<SdkTracerProvider, BoxError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.collector_endpoint.clone())
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(config.resource())
        .build())
}

fn meter_provider(config: &ObservabilityConfig) -> Result<SdkMeterProvider, BoxError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.collector_endpoint.clone())
        .build()?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
        .with_interval(config.export_interval)
        .build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(config.resource())
        .build())
}

fn install_subscriber(
    config: &ObservabilityConfig,
    tracer: Option<opentelemetry_sdk::trace::Tracer>,
) -> Result<(), BoxError> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_filter))?;

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_line_number(true)
            .json()
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };
    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// Flush and shut down the providers installed by [`init_observability`].
///
/// Safe to call more than once, or without a prior init.
pub fn shutdown_observability() {
    let Some(installed) = INSTALLED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    else {
        return;
    };

    if let Some(provider) = installed.tracer {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Tracer provider shutdown failed");
        }
    }
    if let Some(provider) = installed.meter {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Meter provider shutdown failed");
        }
    }
    tracing::info!("Observability shut down");
}
