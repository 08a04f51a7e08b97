use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tokio::runtime::Runtime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const OTLP_ENDPOINT_OVERRIDE_ENV: &str = "POLICYD_OTEL_EXPORTER_OTLP_ENDPOINT";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const DEFAULT_SERVICE_NAME: &str = "policyd-verify";
const DEFAULT_METRIC_EXPORT_INTERVAL_SECS: u64 = 15;

static POLL_ATTEMPTS_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static POLL_WAIT_SECONDS_HISTOGRAM: OnceLock<Histogram<f64>> = OnceLock::new();
static PROBE_OUTCOMES_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();

pub struct ObservabilityGuard {
    _tracer_provider: Option<SdkTracerProvider>,
    _meter_provider: Option<SdkMeterProvider>,
    _tokio_runtime: Option<Runtime>,
}

impl ObservabilityGuard {
    /// Installs the fmt subscriber on stderr. OTLP export is added only when
    /// an exporter endpoint is configured.
    pub fn init() -> Self {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);

        let Some(endpoint) = otlp_endpoint() else {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init();
            return Self::disabled();
        };

        match setup_otel_pipeline(endpoint) {
            Ok(pipeline) => {
                let tracer = pipeline.tracer_provider.tracer("policyd-verify");
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(otel_layer)
                    .try_init();

                init_instruments();

                eprintln!(
                    "{{\"event\":\"observability_init\",\"status\":\"ok\",\"otlp_endpoint\":\"{}\"}}",
                    pipeline.endpoint
                );

                Self {
                    _tracer_provider: Some(pipeline.tracer_provider),
                    _meter_provider: Some(pipeline.meter_provider),
                    _tokio_runtime: Some(pipeline.runtime),
                }
            }
            Err(err) => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .try_init();
                eprintln!(
                    "{{\"event\":\"observability_init\",\"status\":\"degraded\",\"message\":{}}}",
                    serde_json::to_string(&format!("{:#}", err))
                        .unwrap_or_else(|_| "\"failed to encode observability error\"".to_string())
                );
                Self::disabled()
            }
        }
    }

    fn disabled() -> Self {
        Self {
            _tracer_provider: None,
            _meter_provider: None,
            _tokio_runtime: None,
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self._meter_provider.as_ref() {
            if let Err(err) = meter_provider.force_flush() {
                report_shutdown_error("metrics", "flush_error", &err.to_string());
            }
            if let Err(err) = meter_provider.shutdown() {
                report_shutdown_error("metrics", "shutdown_error", &err.to_string());
            }
        }

        if let Some(tracer_provider) = self._tracer_provider.as_ref() {
            let flush_errors = tracer_provider
                .force_flush()
                .into_iter()
                .filter_map(|result| result.err().map(|err| err.to_string()))
                .collect::<Vec<_>>();
            if !flush_errors.is_empty() {
                report_shutdown_error("traces", "flush_error", &flush_errors.join("; "));
            }
            if let Err(err) = tracer_provider.shutdown() {
                report_shutdown_error("traces", "shutdown_error", &err.to_string());
            }
        }
    }
}

/// The subscriber may already be gone at shutdown, so this writes straight
/// to stderr.
fn report_shutdown_error(component: &str, status: &str, message: &str) {
    eprintln!("{}", shutdown_event(component, status, message));
}

fn shutdown_event(component: &str, status: &str, message: &str) -> String {
    serde_json::json!({
        "event": "observability_shutdown",
        "component": component,
        "status": status,
        "message": message,
    })
    .to_string()
}

struct PipelineState {
    runtime: Runtime,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    endpoint: String,
}

/// Configured OTLP collector endpoint, if any.
pub fn otlp_endpoint() -> Option<String> {
    [OTLP_ENDPOINT_OVERRIDE_ENV, OTLP_ENDPOINT_ENV]
        .into_iter()
        .find_map(|key| {
            env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
}

fn setup_otel_pipeline(endpoint: String) -> Result<PipelineState> {
    let service_name = env::var("OTEL_SERVICE_NAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let export_interval_secs = env::var("OTEL_METRIC_EXPORT_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_METRIC_EXPORT_INTERVAL_SECS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("policyd-otel")
        .build()
        .context("failed building tokio runtime for OpenTelemetry")?;
    let _runtime_guard = runtime.enter();

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP metric exporter")?;

    let periodic_reader =
        PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(export_interval_secs))
            .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(periodic_reader)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(PipelineState {
        runtime,
        tracer_provider,
        meter_provider,
        endpoint,
    })
}

fn init_instruments() {
    let meter = global::meter("policyd-verify");

    let _ = POLL_ATTEMPTS_COUNTER.get_or_init(|| {
        meter
            .u64_counter("policyd_poll_attempts_total")
            .with_description("Predicate evaluations made by the poller.")
            .build()
    });
    let _ = POLL_WAIT_SECONDS_HISTOGRAM.get_or_init(|| {
        meter
            .f64_histogram("policyd_poll_wait_seconds")
            .with_description("Time spent waiting for a predicate to settle.")
            .build()
    });
    let _ = PROBE_OUTCOMES_COUNTER.get_or_init(|| {
        meter
            .u64_counter("policyd_probe_outcomes_total")
            .with_description("Verification probe outcomes by operation.")
            .build()
    });
}

/// Records one finished poll. `predicate` keeps only the leading word of the
/// description so file paths and prefixes do not explode cardinality.
pub fn record_poll(predicate: &str, result: &str, attempts: u32, elapsed: Duration) {
    let attrs = vec![
        KeyValue::new("predicate", predicate_kind(predicate)),
        KeyValue::new("result", result.to_string()),
    ];

    if let Some(counter) = POLL_ATTEMPTS_COUNTER.get() {
        counter.add(u64::from(attempts), &attrs);
    }
    if let Some(histogram) = POLL_WAIT_SECONDS_HISTOGRAM.get() {
        histogram.record(elapsed.as_secs_f64(), &attrs);
    }
}

pub fn record_probe_outcome(operation: &str, outcome: &str) {
    let operation = operation.trim();
    if operation.is_empty() {
        return;
    }

    let attrs = vec![
        KeyValue::new("operation", operation.to_string()),
        KeyValue::new("outcome", outcome.to_string()),
    ];
    if let Some(counter) = PROBE_OUTCOMES_COUNTER.get() {
        counter.add(1, &attrs);
    }
}

fn predicate_kind(description: &str) -> String {
    description
        .split_whitespace()
        .next()
        .unwrap_or("unknown")
        .to_ascii_lowercase()
}
