//! Telemetry setup.
//!
//! Installs an OpenTelemetry meter provider for the router's metrics and
//! hands out the matching [`MetricsSink`]. The provider's reader is kept so
//! the server can collect on demand (`GET /metrics`). Setting
//! `OTEL_SDK_DISABLED` or `TASK_STORE_TELEMETRY_OPT_OUT` to `true`/`1` turns
//! metrics off.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use opentelemetry::metrics::MeterProvider;
use opentelemetry_sdk::metrics::data::{Gauge, ResourceMetrics, Sum};
use opentelemetry_sdk::metrics::reader::MetricReader;
use opentelemetry_sdk::metrics::{
    InstrumentKind, ManualReader, MetricError, MetricResult, Pipeline, SdkMeterProvider,
    Temporality,
};
use opentelemetry_sdk::Resource;
use serde::Serialize;

use crate::migration::{MetricsSink, NoopMetrics, OtelMetricsSink};

const METER_NAME: &str = "agent_control_plane";

// ---------------------------------------------------------------------------
// Opt-out
// ---------------------------------------------------------------------------

/// Whether telemetry is disabled via environment variables.
pub fn is_telemetry_disabled() -> bool {
    is_disabled_with(|key| std::env::var(key).ok())
}

fn is_disabled_with<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    ["TASK_STORE_TELEMETRY_OPT_OUT", "OTEL_SDK_DISABLED"]
        .into_iter()
        .filter_map(|key| lookup(key))
        .any(|value| matches!(value.trim().to_lowercase().as_str(), "true" | "1"))
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Manual reader shared between the meter provider and [`Telemetry`].
#[derive(Debug, Clone)]
struct SharedReader(Arc<ManualReader>);

impl MetricReader for SharedReader {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.0.register_pipeline(pipeline)
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> MetricResult<()> {
        self.0.collect(rm)
    }

    fn force_flush(&self) -> MetricResult<()> {
        self.0.force_flush()
    }

    fn shutdown(&self) -> MetricResult<()> {
        self.0.shutdown()
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.0.temporality(kind)
    }
}

/// One collected time series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub name: String,
    /// `counter` or `gauge`.
    pub kind: &'static str,
    pub attributes: BTreeMap<String, String>,
    pub value: u64,
}

fn flatten(rm: &ResourceMetrics) -> Vec<MetricPoint> {
    let mut points = Vec::new();
    for metric in rm.scope_metrics.iter().flat_map(|scope| scope.metrics.iter()) {
        let data = metric.data.as_any();
        let (kind, data_points) = if let Some(sum) = data.downcast_ref::<Sum<u64>>() {
            ("counter", &sum.data_points)
        } else if let Some(gauge) = data.downcast_ref::<Gauge<u64>>() {
            ("gauge", &gauge.data_points)
        } else {
            continue;
        };
        points.extend(data_points.iter().map(|point| MetricPoint {
            name: metric.name.to_string(),
            kind,
            attributes: point
                .attributes
                .iter()
                .map(|kv| (kv.key.as_str().to_string(), kv.value.to_string()))
                .collect(),
            value: point.value,
        }));
    }
    points.sort_by(|a, b| (&a.name, &a.attributes).cmp(&(&b.name, &b.attributes)));
    points
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Handle on the installed meter provider.
#[derive(Debug)]
pub struct Telemetry {
    provider: Option<(SdkMeterProvider, SharedReader)>,
}

impl Telemetry {
    /// Install the global meter provider unless telemetry is disabled.
    pub fn init() -> Self {
        if is_telemetry_disabled() {
            log::info!("telemetry disabled; store metrics are dropped");
            return Self::disabled();
        }

        let telemetry = Self::enabled();
        if let Some((provider, _)) = &telemetry.provider {
            opentelemetry::global::set_meter_provider(provider.clone());
            log::debug!("OpenTelemetry meter provider installed");
        }
        telemetry
    }

    /// A private meter provider, not installed globally.
    pub fn enabled() -> Self {
        let reader = SharedReader(Arc::new(ManualReader::builder().build()));
        let provider = SdkMeterProvider::builder()
            .with_reader(reader.clone())
            .build();
        Self {
            provider: Some((provider, reader)),
        }
    }

    pub fn disabled() -> Self {
        Self { provider: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Sink for [`MigrationRouter`](crate::migration::MigrationRouter) metrics.
    pub fn metrics_sink(&self) -> Arc<dyn MetricsSink> {
        match &self.provider {
            Some((provider, _)) => {
                Arc::new(OtelMetricsSink::with_meter(provider.meter(METER_NAME)))
            }
            None => Arc::new(NoopMetrics),
        }
    }

    /// Current value of every counter and gauge. Empty when disabled.
    pub fn collect(&self) -> Result<Vec<MetricPoint>, MetricError> {
        let Some((_, reader)) = &self.provider else {
            return Ok(Vec::new());
        };
        let mut rm = ResourceMetrics {
            resource: Resource::empty(),
            scope_metrics: Vec::new(),
        };
        reader.collect(&mut rm)?;
        Ok(flatten(&rm))
    }

    /// Flush and stop the meter provider.
    pub fn shutdown(&self) {
        if let Some((provider, _)) = &self.provider {
            if let Err(err) = provider.shutdown() {
                log::warn!("meter provider shutdown failed: {}", err);
            }
        }
    }
}
