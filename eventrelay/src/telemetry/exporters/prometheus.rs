//! Prometheus pull exporter.
//!
//! Metric snapshots pushed by the pipeline are mirrored into a Prometheus
//! [`Registry`]; the host serves [`PrometheusExporter::gather`] on its scrape
//! endpoint. Counters become `_total` counters. Histograms become `_bucket`
//! (explicit aggregation only), `_sum` and `_count` series.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

use super::MetricExporter;
use crate::errors::{ExportError, ExportResult};
use crate::telemetry::options::ExporterKind;
use crate::telemetry::records::{HistogramBuckets, HistogramData, MetricData, MetricPoint};
use crate::telemetry::resource::ResourceDescriptor;

const RESOURCE_LABELS: [&str; 2] = ["service_name", "service_instance_id"];

/// Mirrors metric snapshots into a Prometheus registry.
pub struct PrometheusExporter {
    registry: Registry,
    counters: RwLock<HashMap<String, IntCounterVec>>,
    gauges: RwLock<HashMap<String, GaugeVec>>,
}

impl PrometheusExporter {
    /// Creates an exporter with its own registry.
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Creates an exporter that registers into `registry`.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
        }
    }

    /// Current metrics in the Prometheus text exposition format.
    pub fn gather(&self) -> ExportResult<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(export_failed)?;
        String::from_utf8(buffer).map_err(export_failed)
    }

    /// The underlying registry.
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    fn counter(&self, name: &str, label_keys: &[String]) -> ExportResult<IntCounterVec> {
        if let Some(existing) = self.counters.read().get(name) {
            return Ok(existing.clone());
        }
        let mut counters = self.counters.write();
        if let Some(existing) = counters.get(name) {
            return Ok(existing.clone());
        }
        let keys: Vec<&str> = label_keys.iter().map(String::as_str).collect();
        let counter = IntCounterVec::new(Opts::new(name, format!("Counter {name}")), &keys)
            .map_err(export_failed)?;
        self.registry
            .register(Box::new(counter.clone()))
            .map_err(export_failed)?;
        counters.insert(name.to_string(), counter.clone());
        Ok(counter)
    }

    fn gauge(&self, name: &str, label_keys: &[String]) -> ExportResult<GaugeVec> {
        if let Some(existing) = self.gauges.read().get(name) {
            return Ok(existing.clone());
        }
        let mut gauges = self.gauges.write();
        if let Some(existing) = gauges.get(name) {
            return Ok(existing.clone());
        }
        let keys: Vec<&str> = label_keys.iter().map(String::as_str).collect();
        let gauge = GaugeVec::new(Opts::new(name, format!("Histogram series {name}")), &keys)
            .map_err(export_failed)?;
        self.registry
            .register(Box::new(gauge.clone()))
            .map_err(export_failed)?;
        gauges.insert(name.to_string(), gauge.clone());
        Ok(gauge)
    }

    fn mirror(&self, resource: &ResourceDescriptor, point: &MetricPoint) -> ExportResult<()> {
        let base = metric_name(point);
        let mut keys: Vec<String> = RESOURCE_LABELS.iter().map(ToString::to_string).collect();
        keys.extend(point.labels.iter().map(|(key, _)| sanitize(key)));
        let mut values: Vec<&str> = vec![resource.service_name(), resource.instance_id()];
        values.extend(point.labels.iter().map(|(_, value)| value.as_str()));

        match &point.data {
            MetricData::Sum(total) => {
                let counter = self
                    .counter(&format!("{base}_total"), &keys)?
                    .get_metric_with_label_values(&values)
                    .map_err(export_failed)?;
                let seen = counter.get();
                if *total > seen {
                    counter.inc_by(total - seen);
                }
                Ok(())
            }
            MetricData::Histogram(data) => self.mirror_histogram(&base, &keys, &values, data),
        }
    }

    fn mirror_histogram(
        &self,
        base: &str,
        keys: &[String],
        values: &[&str],
        data: &HistogramData,
    ) -> ExportResult<()> {
        let set = |name: String, value: f64| -> ExportResult<()> {
            self.gauge(&name, keys)?
                .get_metric_with_label_values(values)
                .map_err(export_failed)?
                .set(value);
            Ok(())
        };
        set(format!("{base}_sum"), data.sum)?;
        set(format!("{base}_count"), data.count as f64)?;

        if let HistogramBuckets::Explicit { bounds, counts } = &data.buckets {
            let mut bucket_keys = keys.to_vec();
            bucket_keys.push("le".to_string());
            let buckets = self.gauge(&format!("{base}_bucket"), &bucket_keys)?;

            let upper_bounds = bounds
                .iter()
                .map(ToString::to_string)
                .chain(std::iter::once("+Inf".to_string()));
            let mut cumulative = 0u64;
            for (le, count) in upper_bounds.zip(counts) {
                cumulative += count;
                let mut bucket_values = values.to_vec();
                bucket_values.push(&le);
                buckets
                    .get_metric_with_label_values(&bucket_values)
                    .map_err(export_failed)?
                    .set(cumulative as f64);
            }
        }
        Ok(())
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter")
            .field("counters", &self.counters.read().len())
            .field("gauges", &self.gauges.read().len())
            .finish()
    }
}

fn export_failed(error: impl std::fmt::Display) -> ExportError {
    ExportError::Export {
        kind: ExporterKind::Prometheus,
        reason: error.to_string(),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn metric_name(point: &MetricPoint) -> String {
    let name = sanitize(&point.name);
    if point.unit.is_empty() || point.unit == "1" {
        name
    } else {
        format!("{name}_{}", sanitize(&point.unit))
    }
}

#[async_trait]
impl MetricExporter for PrometheusExporter {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    async fn export_metrics(
        &self,
        resource: &ResourceDescriptor,
        points: &[MetricPoint],
    ) -> ExportResult<()> {
        let mut first_error = None;
        for point in points {
            if let Err(error) = self.mirror(resource, point) {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
