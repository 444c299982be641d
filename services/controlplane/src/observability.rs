//! Logging, tracing, and metrics wiring for the authorization service.
//!
//! # Purpose
//! Installs the `tracing` subscriber (env filter + fmt, plus OTLP span export
//! when an endpoint is configured), W3C trace-context extraction for incoming
//! requests, and the Prometheus recorder that backs the `/metrics` listener.
//!
//! # Notes
//! Initialization is guarded by `OnceLock`, so tests and `main` can call it
//! repeatedly.
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();
static PROPAGATOR_INIT: OnceLock<()> = OnceLock::new();

const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

pub fn init_observability(service_name: &str) -> PrometheusHandle {
    TRACING_INIT.get_or_init(|| {
        install_propagator();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());
        match otlp_tracer_provider(service_name) {
            Some(provider) => {
                let tracer = provider.tracer(service_name.to_string());
                global::set_tracer_provider(provider);
                let _ = registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init();
            }
            None => {
                let _ = registry.try_init();
            }
        }
    });
    install_metrics_recorder()
}

fn install_propagator() {
    PROPAGATOR_INIT.get_or_init(|| {
        global::set_text_map_propagator(TraceContextPropagator::new());
    });
}

/// Span export is opt-in: without an OTLP endpoint only local logs are kept.
fn otlp_tracer_provider(service_name: &str) -> Option<SdkTracerProvider> {
    std::env::var(OTLP_ENDPOINT_ENV).ok()?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
    {
        Ok(exporter) => exporter,
        Err(err) => {
            eprintln!("otlp exporter disabled: {err}");
            return None;
        }
    };
    let resource = Resource::builder_empty()
        .with_attributes(resource_attributes(service_name))
        .build();
    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("service.name", service_name.to_string())];
    let optional = [
        ("service.instance.id", "GEMS_SERVICE_INSTANCE_ID"),
        ("k8s.namespace.name", "K8S_NAMESPACE_NAME"),
        ("k8s.pod.name", "K8S_POD_NAME"),
        ("deployment.environment", "DEPLOYMENT_ENVIRONMENT"),
    ];
    for (key, var) in optional {
        let value = std::env::var(var).ok().or_else(|| {
            (key == "service.instance.id")
                .then(|| std::env::var("HOSTNAME").ok())
                .flatten()
        });
        if let Some(value) = value {
            attrs.push(KeyValue::new(key, value));
        }
    }
    attrs
}

pub fn trace_context_from_headers(headers: &axum::http::HeaderMap) -> opentelemetry::Context {
    install_propagator();
    global::get_text_map_propagator(|prop| prop.extract(&HeaderMapExtractor(headers)))
}

struct HeaderMapExtractor<'a>(&'a axum::http::HeaderMap);

impl Extractor for HeaderMapExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics listening");
    serve_metrics_with_listener(handle, listener, std::future::pending()).await
}

async fn serve_metrics_with_listener<F>(
    handle: PrometheusHandle,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    );
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

fn install_metrics_recorder() -> PrometheusHandle {
    if let Some(handle) = METRICS_HANDLE.get() {
        return handle.clone();
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install metrics recorder");
    describe_metrics();
    let _ = METRICS_HANDLE.set(handle.clone());
    handle
}

fn describe_metrics() {
    describe_counter!(
        "authz_decisions_total",
        "Permission decisions by target kind and outcome"
    );
    describe_counter!(
        "model_cache_writes_total",
        "Resource-tree cache writes that changed stored state"
    );
    describe_gauge!("model_cache_entities", "Entities held by the resource-tree cache");
    describe_counter!(
        "authority_rebuilds_total",
        "User authority snapshots rebuilt from the system of record"
    );
    describe_histogram!(
        "model_cache_lock_wait_seconds",
        Unit::Seconds,
        "Time spent acquiring the shared resource-tree lock"
    );
}
