//! # Logging and OpenTelemetry helpers
//!
//! Every binary in the workspace calls [init_opentelemetry] once at startup.
//! Logs always go to stdout, OTLP export is opt-in.

use std::borrow::Cow;
use std::time::Duration;

use error_stack::{Result, ResultExt};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, InstrumentationScope};
use opentelemetry_otlp::{MetricExporter, SpanExporter};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use tracing::Subscriber;
use tracing_subscriber::{prelude::*, registry::LookupSpan, EnvFilter, Layer};

pub use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};
pub use opentelemetry::KeyValue;

const OTEL_SDK_DISABLED: &str = "OTEL_SDK_DISABLED";
const RUST_LOG_FORMAT: &str = "RUST_LOG_FORMAT";

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

#[derive(Debug)]
pub struct OpenTelemetryInitError;
impl error_stack::Context for OpenTelemetryInitError {}

impl std::fmt::Display for OpenTelemetryInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("failed to initialize opentelemetry")
    }
}

/// Returns a meter from the global meter provider.
///
/// Before [init_opentelemetry] runs (or when export is disabled) the meter is a no-op.
pub fn meter(name: &'static str) -> Meter {
    global::meter(name)
}

/// Initialize logging and OpenTelemetry.
///
/// The stdout layer honours `RUST_LOG` (default `info`) and switches to JSON lines when
/// `RUST_LOG_FORMAT=json`. Traces and metrics are exported over OTLP only when
/// `OTEL_SDK_DISABLED=false`.
///
/// ```rs
/// use inscription_observability::init_opentelemetry;
///
/// init_opentelemetry(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")).unwrap();
/// ```
pub fn init_opentelemetry(
    package_name: impl Into<Cow<'static, str>>,
    package_version: impl Into<Cow<'static, str>>,
) -> Result<(), OpenTelemetryInitError> {
    // The otel sdk doesn't read the disabled flag itself, and we default to disabled.
    let sdk_disabled = std::env::var(OTEL_SDK_DISABLED)
        .map(|v| v == "true")
        .unwrap_or(true);

    let mut layers = vec![stdout()];

    if !sdk_disabled {
        layers.push(otel(package_name, package_version)?);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .change_context(OpenTelemetryInitError)
        .attach_printable("failed to install global subscriber")?;

    Ok(())
}

fn otel<S>(
    package_name: impl Into<Cow<'static, str>>,
    version: impl Into<Cow<'static, str>>,
) -> Result<BoxedLayer<S>, OpenTelemetryInitError>
where
    S: Subscriber + Send + Sync,
    for<'a> S: LookupSpan<'a>,
{
    let package_name = package_name.into();
    let version = version.into();

    let otel_env_filter = default_env_filter();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", package_name.to_string()),
        KeyValue::new("service.version", version.to_string()),
    ]));

    let scope = InstrumentationScope::builder(package_name)
        .with_version(version)
        .build();

    let span_exporter = SpanExporter::builder()
        .with_tonic()
        .build()
        .change_context(OpenTelemetryInitError)
        .attach_printable("failed to create span exporter")?;

    let trace_provider = TracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .build();

    let tracer = trace_provider.tracer_with_scope(scope);
    global::set_tracer_provider(trace_provider);

    let metrics_exporter = MetricExporter::builder()
        .with_tonic()
        .build()
        .change_context(OpenTelemetryInitError)
        .attach_printable("failed to create metrics exporter")?;

    let metrics_reader = PeriodicReader::builder(metrics_exporter, runtime::Tokio)
        .with_interval(Duration::from_secs(10))
        .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(metrics_reader)
        .build();

    global::set_meter_provider(meter_provider);

    let otel_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer)
        .with_filter(otel_env_filter)
        .boxed();

    Ok(otel_layer)
}

fn stdout<S>() -> BoxedLayer<S>
where
    S: Subscriber,
    for<'a> S: LookupSpan<'a>,
{
    let log_env_filter = default_env_filter();

    let json_fmt = std::env::var(RUST_LOG_FORMAT)
        .map(|val| val == "json")
        .unwrap_or(false);

    if json_fmt {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(log_env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(false)
            .compact()
            .with_filter(log_env_filter)
            .boxed()
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
