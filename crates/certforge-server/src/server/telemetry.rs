//! # Telemetry
//!
//! Human-readable logs are always on: a `tracing-subscriber` registry with an
//! `EnvFilter` (default `info`, override with `RUST_LOG`) and a pretty `fmt`
//! layer.
//!
//! ## Feature matrix
//!
//! - `traces`: exports `tracing` spans through OpenTelemetry.
//! - `metrics`: records OpenTelemetry counters and histograms.
//! - `stdout`: attaches the `opentelemetry-stdout` exporter to whichever of the
//!   above is enabled.
//!
//! Events outside a span only reach the log output, never an exporter.
//!
//! ## Metrics
//!
//! | name                  | kind           | recorded when                          |
//! |-----------------------|----------------|----------------------------------------|
//! | `requests`            | counter        | a complete request is parsed           |
//! | `cache_hits`          | counter        | a request joins an existing issuance   |
//! | `protocol_errors`     | counter        | a request is rejected                  |
//! | `generations`         | counter        | a worker starts an issuance            |
//! | `generation_errors`   | counter        | an issuance fails                      |
//! | `generation_duration` | histogram (ms) | an issuance finishes                   |
//! | `connections_open`    | up/down        | a connection is accepted or closed     |
//!
//! Without `metrics` the recording helpers compile to no-ops.
//!
//! ```bash
//! cargo run --features traces,metrics,stdout -- 8443 4 ca.key "CN=Example CA"
//! ```

// Disallow using `stdout` without `traces` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "traces", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'traces' or 'metrics' to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "traces")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "traces")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "traces")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "certforge";

pub struct TelemetryProviders {
    #[cfg(feature = "traces")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down the exporters. Called once, after the server
    /// has stopped.
    pub fn shutdown(self) {
        #[cfg(feature = "traces")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "traces")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "traces")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "traces"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "traces")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "traces")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "traces"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let reader =
            sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
                .with_interval(std::time::Duration::from_secs(5))
                .build();
        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "traces")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let batch =
            sdktrace::BatchSpanProcessor::builder(opentelemetry_stdout::SpanExporter::default())
                .with_batch_config(
                    sdktrace::BatchConfigBuilder::default()
                        .with_scheduled_delay(std::time::Duration::from_secs(5))
                        .with_max_queue_size(2048)
                        .build(),
                )
                .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}

#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CACHE_HITS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static PROTOCOL_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static GENERATIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static GENERATION_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static GENERATION_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CONNECTIONS_OPEN: OnceLock<UpDownCounter<i64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("requests")
            .with_description("Complete issuance requests received")
            .build(),
    );
    let _ = CACHE_HITS.set(
        meter
            .u64_counter("cache_hits")
            .with_description("Requests served by an existing issuance")
            .build(),
    );
    let _ = PROTOCOL_ERRORS.set(
        meter
            .u64_counter("protocol_errors")
            .with_description("Malformed or oversized requests")
            .build(),
    );
    let _ = GENERATIONS.set(
        meter
            .u64_counter("generations")
            .with_description("Key generation jobs started")
            .build(),
    );
    let _ = GENERATION_ERRORS.set(
        meter
            .u64_counter("generation_errors")
            .with_description("Key generation jobs that failed")
            .build(),
    );
    let _ = GENERATION_DURATION_MS.set(
        meter
            .f64_histogram("generation_duration")
            .with_unit("ms")
            .with_description("Key generation and signing time")
            .build(),
    );
    let _ = CONNECTIONS_OPEN.set(
        meter
            .i64_up_down_counter("connections_open")
            .with_description("Connections owned by the reactor")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn increment_requests() {
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests() {}

#[cfg(feature = "metrics")]
pub fn increment_cache_hits() {
    if let Some(counter) = CACHE_HITS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_cache_hits() {}

#[cfg(feature = "metrics")]
pub fn increment_protocol_errors() {
    if let Some(counter) = PROTOCOL_ERRORS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_protocol_errors() {}

#[cfg(feature = "metrics")]
pub fn increment_generations() {
    if let Some(counter) = GENERATIONS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_generations() {}

#[cfg(feature = "metrics")]
pub fn increment_generation_errors() {
    if let Some(counter) = GENERATION_ERRORS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_generation_errors() {}

#[cfg(feature = "metrics")]
pub fn record_generation_duration(duration_ms: f64) {
    if let Some(histogram) = GENERATION_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_generation_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_connections_open() {
    if let Some(counter) = CONNECTIONS_OPEN.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_connections_open() {}

#[cfg(feature = "metrics")]
pub fn decrement_connections_open() {
    if let Some(counter) = CONNECTIONS_OPEN.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_connections_open() {}
