use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::{routing::get, Json, Router};
use serde_json::{json, Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{self as tsfmt, FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Registry};

mod metrics;

pub use metrics::{
    build_info, default_buckets, encode_prometheus as encode_prometheus_metrics,
    handler_latency_seconds, http_requests_total, process_uptime_seconds, register_counter,
    register_gauge, register_histogram, Counter, CounterVec, Gauge, GaugeVec, Histogram,
    HistogramVec, PROMETHEUS_CONTENT_TYPE,
};

#[derive(Debug, thiserror::Error)]
pub enum ObsInitError {
    #[error("tracing subscriber already initialized")]
    AlreadyInitialized,
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Initialize observability for a service.
pub struct ObsInit;

impl ObsInit {
    /// Install the global subscriber writing JSON lines to stderr and register
    /// the process level metrics for `service`.
    pub fn init(service: &str) -> Result<(), ObsInitError> {
        let subscriber = Self::subscriber_with_writer(service, io::stderr);
        tracing::subscriber::set_global_default(subscriber).map_err(|err| {
            if tracing::dispatcher::has_been_set() {
                ObsInitError::AlreadyInitialized
            } else {
                ObsInitError::Install(err)
            }
        })
    }

    /// Build the subscriber without installing it. Tests use this with a buffer writer.
    pub fn subscriber_with_writer<W>(service: &str, writer: W) -> impl tracing::Subscriber
    where
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        metrics::init(service);
        let fallback = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(fallback))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = tsfmt::layer()
            .with_ansi(false)
            .event_format(JsonLines {
                service: Arc::from(service),
            })
            .with_writer(writer);

        Registry::default()
            .with(env_filter)
            .with(TraceLayer::default())
            .with(fmt_layer)
    }
}

/// `/health` and `/info` routes (plus their `/v1` aliases) for a service.
pub fn health_router(service: &'static str, version: &'static str) -> Router {
    let health = get(move || async move { Json(json!({ "status": "ok", "service": service })) });
    let info =
        get(move || async move { Json(json!({ "service": service, "version": version })) });

    Router::new()
        .route("/health", health.clone())
        .route("/v1/health", health)
        .route("/info", info.clone())
        .route("/v1/info", info)
}

/// Helper trait for request scoped metadata.
pub trait SpanExt {
    /// Attach a request identifier to the span's trace so every event inside it carries it.
    fn with_req(&self, request_id: &str);

    /// The trace identifier assigned to this span, if it is being traced.
    fn trace_id(&self) -> Option<String>;
}

impl SpanExt for tracing::Span {
    fn with_req(&self, request_id: &str) {
        if let Some(ctx) = trace_context(self) {
            ctx.set_request_id(request_id);
        }
    }

    fn trace_id(&self) -> Option<String> {
        trace_context(self).map(|ctx| ctx.trace_id.clone())
    }
}

/// Look the span's trace context up in the registry of the subscriber that owns the span.
fn trace_context(span: &tracing::Span) -> Option<Arc<TraceContext>> {
    span.with_subscriber(|(id, dispatch)| {
        let registry = dispatch.downcast_ref::<Registry>()?;
        let span = registry.span(id)?;
        let ctx = span.extensions().get::<Arc<TraceContext>>().cloned();
        ctx
    })
    .flatten()
}

/// Trace context shared by a root span and all of its descendants.
struct TraceContext {
    trace_id: String,
    request_id: Mutex<Option<String>>,
}

impl TraceContext {
    fn request_id(&self) -> Option<String> {
        self.request_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_request_id(&self, value: &str) {
        if let Ok(mut guard) = self.request_id.lock() {
            *guard = Some(value.to_string());
        }
    }
}

/// Assigns a trace context to every root span and hands it down to children.
#[derive(Default)]
struct TraceLayer {
    next_trace: AtomicU64,
}

impl TraceLayer {
    fn fresh(&self) -> Arc<TraceContext> {
        let id = self.next_trace.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(TraceContext {
            trace_id: format!("{id:016x}"),
            request_id: Mutex::new(None),
        })
    }
}

impl<S> Layer<S> for TraceLayer
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let inherited = span
            .parent()
            .and_then(|parent| parent.extensions().get::<Arc<TraceContext>>().cloned());
        let trace = inherited.unwrap_or_else(|| self.fresh());

        span.extensions_mut().insert(trace);
    }
}

/// One JSON object per event:
/// `{"level","target","service","trace_id","request_id","fields":{..}}`.
struct JsonLines {
    service: Arc<str>,
}

impl<S, N> FormatEvent<S, N> for JsonLines
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let trace = ctx.lookup_current().and_then(|current| {
            current
                .scope()
                .from_root()
                .find_map(|span| span.extensions().get::<Arc<TraceContext>>().cloned())
        });

        let line = json!({
            "level": metadata.level().as_str().to_ascii_lowercase(),
            "target": metadata.target(),
            "service": &*self.service,
            "trace_id": trace.as_ref().map(|t| t.trace_id.clone()),
            "request_id": trace.as_ref().and_then(|t| t.request_id()),
            "fields": Value::Object(fields.0),
        });
        writeln!(writer, "{line}")
    }
}

#[derive(Default)]
struct FieldCollector(Map<String, Value>);

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::from(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }
}

pub fn service_name() -> Option<&'static str> {
    metrics::service_name()
}

/// Record one handled HTTP request against the shared request metrics.
#[macro_export]
macro_rules! http_request_observe {
    ($route:expr, $code:expr, $value:expr) => {{
        if let Some(service) = $crate::service_name() {
            $crate::http_requests_total().inc(&[service, $route, $code], 1);
            $crate::handler_latency_seconds().observe(&[service, $route], $value);
        }
    }};
}
