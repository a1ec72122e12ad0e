//! Metrics emitted by the migration router.
//!
//! [`MetricsEmitter`] assembles tags (`operation` and `entity`) and hands
//! emissions to a [`MetricsSink`]. Sinks:
//!
//! - [`OtelMetricsSink`] — OpenTelemetry counters and gauges
//! - [`InMemoryMetrics`] — keeps every emission, for tests and tooling
//! - [`NoopMetrics`] — drops everything

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

pub const DUAL_READ_MATCH: &str = "store.dual_read.match";
pub const DUAL_READ_MISSING_TARGET: &str = "store.dual_read.mismatch.missing_target";
pub const DUAL_READ_MISSING_LEGACY: &str = "store.dual_read.mismatch.missing_legacy";
pub const DUAL_READ_CONTENT_MISMATCH: &str = "store.dual_read.mismatch.content";
pub const DUAL_READ_LIST_COUNT_MISMATCH: &str = "store.dual_read.list_count_mismatch";
/// Gauge: absolute difference between legacy and target list lengths.
pub const DUAL_READ_LIST_COUNT_DIFF: &str = "store.dual_read.list_count_diff";
/// The target read failed or timed out; nothing was compared.
pub const DUAL_READ_TARGET_UNAVAILABLE: &str = "store.dual_read.target_unavailable";
pub const SECONDARY_WRITE_FAILURE: &str = "store.dual_write.secondary_failure";

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Router operation, used as the `operation` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Get,
    GetByKey,
    Update,
    Delete,
    List,
    BatchCreate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Get => "get",
            Self::GetByKey => "get_by_key",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
            Self::BatchCreate => "batch_create",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for counters and gauges.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn increment(&self, name: &str, tags: &[(&str, &str)]);

    fn gauge(&self, name: &str, value: u64, tags: &[(&str, &str)]);
}

/// Discards every emission.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _tags: &[(&str, &str)]) {}

    fn gauge(&self, _name: &str, _value: u64, _tags: &[(&str, &str)]) {}
}

/// OpenTelemetry-backed sink.
///
/// Instruments are created on first use and cached by name.
pub struct OtelMetricsSink {
    meter: Meter,
    counters: DashMap<String, Counter<u64>>,
    gauges: DashMap<String, Gauge<u64>>,
}

impl OtelMetricsSink {
    /// Sink on the global meter provider.
    pub fn new() -> Self {
        Self::with_meter(opentelemetry::global::meter("agent_control_plane"))
    }

    pub fn with_meter(meter: Meter) -> Self {
        Self {
            meter,
            counters: DashMap::new(),
            gauges: DashMap::new(),
        }
    }

    fn attributes(tags: &[(&str, &str)]) -> Vec<KeyValue> {
        tags.iter()
            .map(|(key, value)| KeyValue::new(key.to_string(), value.to_string()))
            .collect()
    }
}

impl Default for OtelMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OtelMetricsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelMetricsSink")
            .field("counters", &self.counters.len())
            .field("gauges", &self.gauges.len())
            .finish()
    }
}

impl MetricsSink for OtelMetricsSink {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        let counter = self
            .counters
            .entry(name.to_string())
            .or_insert_with(|| self.meter.u64_counter(name.to_string()).build())
            .clone();
        counter.add(1, &Self::attributes(tags));
    }

    fn gauge(&self, name: &str, value: u64, tags: &[(&str, &str)]) {
        let gauge = self
            .gauges
            .entry(name.to_string())
            .or_insert_with(|| self.meter.u64_gauge(name.to_string()).build())
            .clone();
        gauge.record(value, &Self::attributes(tags));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// One recorded emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: String,
    pub kind: MetricKind,
    pub value: u64,
    pub tags: BTreeMap<String, String>,
}

/// Sink that remembers everything it receives.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Sum of all increments of a counter.
    pub fn count(&self, name: &str) -> u64 {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == MetricKind::Counter && e.name == name)
            .map(|e| e.value)
            .sum()
    }

    /// Sum of increments of a counter carrying a given tag value.
    pub fn count_tagged(&self, name: &str, tag: &str, value: &str) -> u64 {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == MetricKind::Counter && e.name == name)
            .filter(|e| e.tags.get(tag).map(String::as_str) == Some(value))
            .map(|e| e.value)
            .sum()
    }

    /// Most recent value recorded for a gauge.
    pub fn last_gauge(&self, name: &str) -> Option<u64> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|e| e.kind == MetricKind::Gauge && e.name == name)
            .map(|e| e.value)
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, name: &str, kind: MetricKind, value: u64, tags: &[(&str, &str)]) {
        self.events.lock().push(MetricEvent {
            name: name.to_string(),
            kind,
            value,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        self.record(name, MetricKind::Counter, 1, tags);
    }

    fn gauge(&self, name: &str, value: u64, tags: &[(&str, &str)]) {
        self.record(name, MetricKind::Gauge, value, tags);
    }
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Tag-assembling front of a [`MetricsSink`], bound to one entity kind.
#[derive(Debug, Clone)]
pub struct MetricsEmitter {
    sink: Arc<dyn MetricsSink>,
    entity: &'static str,
}

impl MetricsEmitter {
    pub fn new(sink: Arc<dyn MetricsSink>, entity: &'static str) -> Self {
        Self { sink, entity }
    }

    pub fn noop(entity: &'static str) -> Self {
        Self::new(Arc::new(NoopMetrics), entity)
    }

    pub fn count(&self, name: &str, operation: Operation) {
        self.sink.increment(name, &self.tags(operation));
    }

    pub fn gauge(&self, name: &str, value: u64, operation: Operation) {
        self.sink.gauge(name, value, &self.tags(operation));
    }

    fn tags(&self, operation: Operation) -> [(&'static str, &'static str); 2] {
        [("operation", operation.as_str()), ("entity", self.entity)]
    }
}
