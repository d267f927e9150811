//! Minimal Prometheus style metrics registry.
//!
//! A metric family is a name, help text, label names and a map from label
//! values to a cell. Cells are counters, gauges or histograms.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};

const DEFAULT_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const BUILD_SHA: &str = match option_env!("BUILD_SHA") {
    Some(value) => value,
    None => "dev",
};
const BUILD_TIME: &str = match option_env!("BUILD_TIME") {
    Some(value) => value,
    None => "1970-01-01T00:00:00Z",
};

static SERVICE_NAME: OnceCell<&'static str> = OnceCell::new();
static PROCESS_START: OnceCell<Instant> = OnceCell::new();
static REGISTRY: Lazy<RwLock<Vec<Arc<dyn Encode>>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Bind the registry to a service name. Only the first call has any effect.
pub fn init(service: &str) {
    let service: &'static str = match SERVICE_NAME.get() {
        Some(_) => return,
        None => Box::leak(service.to_string().into_boxed_str()),
    };
    if SERVICE_NAME.set(service).is_err() {
        return;
    }
    PROCESS_START.get_or_init(Instant::now);

    build_info().set(
        &[service, env!("CARGO_PKG_VERSION"), BUILD_SHA, BUILD_TIME],
        1.0,
    );
    process_uptime_seconds().ensure(&[service]);
    http_requests_total().ensure(&[service, "/metrics", "200"]);
    handler_latency_seconds().ensure(&[service, "/metrics"]);
}

pub fn service_name() -> Option<&'static str> {
    SERVICE_NAME.get().copied()
}

pub fn default_buckets() -> &'static [f64] {
    DEFAULT_BUCKETS
}

/// Render every registered family in the Prometheus text exposition format.
pub fn encode_prometheus() -> String {
    if let (Some(service), Some(start)) = (service_name(), PROCESS_START.get()) {
        process_uptime_seconds().set(&[service], start.elapsed().as_secs_f64());
    }

    let mut output = String::new();
    if let Ok(families) = REGISTRY.read() {
        for family in families.iter() {
            family.encode(&mut output);
        }
    }
    output
}

trait Encode: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, out: &mut String);
}

/// Static description of a metric family.
pub struct Meta {
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    buckets: &'static [f64],
}

/// Storage behind one label combination.
pub trait Cell: Send + Sync + 'static {
    const KIND: &'static str;

    fn create(buckets: &'static [f64]) -> Self;

    fn encode(&self, meta: &Meta, labels: &[String], out: &mut String);
}

struct Family<C> {
    meta: Meta,
    cells: Mutex<BTreeMap<Vec<String>, Arc<C>>>,
}

impl<C: Cell> Family<C> {
    fn cell(&self, label_values: &[&str]) -> Arc<C> {
        assert_eq!(
            self.meta.label_names.len(),
            label_values.len(),
            "label value count mismatch for {}",
            self.meta.name
        );
        let key: Vec<String> = label_values.iter().map(|value| value.to_string()).collect();
        let mut cells = self.cells.lock().unwrap_or_else(|poison| poison.into_inner());
        cells
            .entry(key)
            .or_insert_with(|| Arc::new(C::create(self.meta.buckets)))
            .clone()
    }
}

impl<C: Cell> Encode for Family<C> {
    fn name(&self) -> &'static str {
        self.meta.name
    }

    fn encode(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.meta.name, self.meta.help);
        let _ = writeln!(out, "# TYPE {} {}", self.meta.name, C::KIND);
        let cells = self.cells.lock().unwrap_or_else(|poison| poison.into_inner());
        for (labels, cell) in cells.iter() {
            cell.encode(&self.meta, labels, out);
        }
    }
}

/// Handle to a registered metric family.
pub struct MetricVec<C> {
    family: Arc<Family<C>>,
}

impl<C> Clone for MetricVec<C> {
    fn clone(&self) -> Self {
        Self {
            family: Arc::clone(&self.family),
        }
    }
}

impl<C: Cell> MetricVec<C> {
    fn register(
        name: &'static str,
        help: &'static str,
        label_names: &'static [&'static str],
        buckets: &'static [f64],
    ) -> Self {
        let family = Arc::new(Family {
            meta: Meta {
                name,
                help,
                label_names,
                buckets,
            },
            cells: Mutex::new(BTreeMap::new()),
        });
        let mut registry = REGISTRY.write().unwrap_or_else(|poison| poison.into_inner());
        if registry.iter().any(|existing| existing.name() == name) {
            tracing::warn!(metric = name, "metric already registered; new handle is not exported");
        } else {
            registry.push(family.clone());
        }
        Self { family }
    }

    /// Make a label combination visible in the export before it is first updated.
    pub fn ensure(&self, labels: &[&str]) {
        let _ = self.family.cell(labels);
    }
}

pub type CounterVec = MetricVec<CounterCell>;
pub type GaugeVec = MetricVec<GaugeCell>;
pub type HistogramVec = MetricVec<HistogramCell>;

#[derive(Default)]
pub struct CounterCell(AtomicU64);

impl Cell for CounterCell {
    const KIND: &'static str = "counter";

    fn create(_buckets: &'static [f64]) -> Self {
        Self::default()
    }

    fn encode(&self, meta: &Meta, labels: &[String], out: &mut String) {
        out.push_str(meta.name);
        write_labels(out, meta.label_names, labels, None);
        let _ = writeln!(out, " {}", self.0.load(Ordering::Relaxed));
    }
}

#[derive(Clone)]
pub struct Counter(Arc<CounterCell>);

impl Counter {
    pub fn inc(&self, amount: u64) {
        self.0 .0.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0 .0.load(Ordering::Relaxed)
    }
}

impl CounterVec {
    pub fn with_label_values(&self, labels: &[&str]) -> Counter {
        Counter(self.family.cell(labels))
    }

    pub fn inc(&self, labels: &[&str], amount: u64) {
        self.with_label_values(labels).inc(amount);
    }
}

/// f64 stored as raw bits.
#[derive(Default)]
pub struct GaugeCell(AtomicU64);

impl Cell for GaugeCell {
    const KIND: &'static str = "gauge";

    fn create(_buckets: &'static [f64]) -> Self {
        Self::default()
    }

    fn encode(&self, meta: &Meta, labels: &[String], out: &mut String) {
        out.push_str(meta.name);
        write_labels(out, meta.label_names, labels, None);
        let value = f64::from_bits(self.0.load(Ordering::Relaxed));
        let _ = writeln!(out, " {}", format_float(value));
    }
}

#[derive(Clone)]
pub struct Gauge(Arc<GaugeCell>);

impl Gauge {
    pub fn set(&self, value: f64) {
        self.0 .0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0 .0.load(Ordering::Relaxed))
    }
}

impl GaugeVec {
    pub fn with_label_values(&self, labels: &[&str]) -> Gauge {
        Gauge(self.family.cell(labels))
    }

    pub fn set(&self, labels: &[&str], value: f64) {
        self.with_label_values(labels).set(value);
    }
}

pub struct HistogramCell {
    buckets: &'static [f64],
    state: Mutex<HistogramState>,
}

struct HistogramState {
    // One slot per bucket plus the +Inf overflow slot; not cumulative.
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Cell for HistogramCell {
    const KIND: &'static str = "histogram";

    fn create(buckets: &'static [f64]) -> Self {
        Self {
            buckets,
            state: Mutex::new(HistogramState {
                counts: vec![0; buckets.len() + 1],
                sum: 0.0,
                count: 0,
            }),
        }
    }

    fn encode(&self, meta: &Meta, labels: &[String], out: &mut String) {
        let state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        let bounds = self
            .buckets
            .iter()
            .map(|bound| format_float(*bound))
            .chain(std::iter::once("+Inf".to_string()));

        let mut cumulative = 0;
        for (count, bound) in state.counts.iter().zip(bounds) {
            cumulative += count;
            let _ = write!(out, "{}_bucket", meta.name);
            write_labels(out, meta.label_names, labels, Some(("le", bound.as_str())));
            let _ = writeln!(out, " {cumulative}");
        }

        let _ = write!(out, "{}_sum", meta.name);
        write_labels(out, meta.label_names, labels, None);
        let _ = writeln!(out, " {}", format_float(state.sum));

        let _ = write!(out, "{}_count", meta.name);
        write_labels(out, meta.label_names, labels, None);
        let _ = writeln!(out, " {}", state.count);
    }
}

#[derive(Clone)]
pub struct Histogram(Arc<HistogramCell>);

impl Histogram {
    pub fn observe(&self, value: f64) {
        let cell = &self.0;
        let slot = cell
            .buckets
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(cell.buckets.len());
        let mut state = cell.state.lock().unwrap_or_else(|poison| poison.into_inner());
        state.count += 1;
        state.sum += value;
        state.counts[slot] += 1;
    }
}

impl HistogramVec {
    pub fn with_label_values(&self, labels: &[&str]) -> Histogram {
        Histogram(self.family.cell(labels))
    }

    pub fn observe(&self, labels: &[&str], value: f64) {
        self.with_label_values(labels).observe(value);
    }
}

fn write_labels(out: &mut String, names: &[&str], values: &[String], extra: Option<(&str, &str)>) {
    let pairs = names
        .iter()
        .copied()
        .zip(values.iter().map(String::as_str))
        .chain(extra);
    let mut first = true;
    for (name, value) in pairs {
        out.push(if first { '{' } else { ',' });
        first = false;
        let _ = write!(out, "{name}=\"{}\"", escape_label_value(value));
    }
    if !first {
        out.push('}');
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_float(value: f64) -> String {
    if value.is_infinite() {
        return if value > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    let mut formatted = format!("{value:.6}");
    while formatted.ends_with('0') {
        formatted.pop();
    }
    if formatted.ends_with('.') {
        formatted.push('0');
    }
    if formatted == "-0.0" {
        formatted = "0.0".to_string();
    }
    formatted
}

pub fn register_counter(
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
) -> CounterVec {
    MetricVec::register(name, help, label_names, &[])
}

pub fn register_gauge(
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
) -> GaugeVec {
    MetricVec::register(name, help, label_names, &[])
}

pub fn register_histogram(
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    buckets: &'static [f64],
) -> HistogramVec {
    MetricVec::register(name, help, label_names, buckets)
}

static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter(
        "http_requests_total",
        "Total HTTP requests received",
        &["service", "route", "code"],
    )
});

static HANDLER_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram(
        "handler_latency_seconds",
        "HTTP handler latency in seconds",
        &["service", "route"],
        DEFAULT_BUCKETS,
    )
});

static PROCESS_UPTIME_SECONDS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge(
        "process_uptime_seconds",
        "Process uptime in seconds",
        &["service"],
    )
});

static BUILD_INFO: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge(
        "build_info",
        "Build information for the running service",
        &["service", "version", "build_sha", "build_time"],
    )
});

pub fn http_requests_total() -> &'static CounterVec {
    &HTTP_REQUESTS_TOTAL
}

pub fn handler_latency_seconds() -> &'static HistogramVec {
    &HANDLER_LATENCY_SECONDS
}

pub fn process_uptime_seconds() -> &'static GaugeVec {
    &PROCESS_UPTIME_SECONDS
}

pub fn build_info() -> &'static GaugeVec {
    &BUILD_INFO
}
