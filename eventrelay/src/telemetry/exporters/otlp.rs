//! OTLP exporters backed by the OpenTelemetry SDK.
//!
//! Finished records are replayed into SDK providers that batch and ship them
//! over gRPC. Spans keep their original trace id, span id, parent and
//! timestamps. Counters are replayed as deltas of their cumulative totals.
//! Explicit histograms are replayed bucket by bucket at each bucket's upper
//! bound, so bucket counts stay exact; exponential histograms are replayed at
//! the mean of the new observations.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use opentelemetry::logs::{AnyValue, LogRecord as _, Logger as _, LoggerProvider as _, Severity};
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider as _};
use opentelemetry::trace::{
    Span as _, SpanContext, SpanId as OtelSpanId, SpanKind as OtelSpanKind, Status,
    TraceContextExt as _, TraceFlags, TraceId as OtelTraceId, TraceState, Tracer as _,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use parking_lot::Mutex;

use super::{LogExporter, MetricExporter, SpanExporter};
use crate::errors::{ExportError, ExportResult};
use crate::telemetry::metrics::DEFAULT_BOUNDARIES;
use crate::telemetry::options::ExporterKind;
use crate::telemetry::records::{
    Attributes, HistogramBuckets, HistogramData, LogLevel, LogRecord, MetricData, MetricPoint,
    SpanKind, SpanRecord, SpanStatus,
};
use crate::telemetry::resource::ResourceDescriptor;

const METRIC_INTERVAL: Duration = Duration::from_secs(10);

fn otel_resource(resource: &ResourceDescriptor) -> Resource {
    Resource::builder()
        .with_service_name(resource.service_name().to_string())
        .with_attributes(
            resource
                .attributes()
                .into_iter()
                .skip(1)
                .map(|(key, value)| KeyValue::new(key, value.to_string())),
        )
        .build()
}

fn construction(error: impl std::fmt::Display) -> ExportError {
    ExportError::Construction {
        kind: ExporterKind::Otlp,
        reason: error.to_string(),
    }
}

fn export_failed(error: impl std::fmt::Display) -> ExportError {
    ExportError::Export {
        kind: ExporterKind::Otlp,
        reason: error.to_string(),
    }
}

fn key_values(pairs: &Attributes) -> Vec<KeyValue> {
    pairs
        .iter()
        .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
        .collect()
}

async fn blocking<F>(work: F) -> ExportResult<()>
where
    F: FnOnce() -> Result<(), String> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(export_failed)?
        .map_err(export_failed)
}

/// Ships spans to an OTLP collector.
pub struct OtlpSpanExporter {
    provider: SdkTracerProvider,
}

impl OtlpSpanExporter {
    /// Connects lazily to `endpoint`.
    pub fn new(endpoint: &str, resource: &ResourceDescriptor) -> ExportResult<Self> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(construction)?;
        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(otel_resource(resource))
            .build();
        Ok(Self { provider })
    }

    fn replay(&self, span: &SpanRecord) {
        let tracer = self.provider.tracer(span.source.clone());
        let trace_id = OtelTraceId::from_bytes(span.context.trace_id().to_bytes());
        let parent = span.parent_span_id.map_or_else(Context::new, |parent| {
            Context::new().with_remote_span_context(SpanContext::new(
                trace_id,
                OtelSpanId::from_bytes(parent.to_bytes()),
                TraceFlags::SAMPLED,
                true,
                TraceState::default(),
            ))
        });

        let kind = match span.kind {
            SpanKind::Internal => OtelSpanKind::Internal,
            SpanKind::Producer => OtelSpanKind::Producer,
            SpanKind::Consumer => OtelSpanKind::Consumer,
        };
        let mut otel_span = tracer
            .span_builder(span.name.clone())
            .with_kind(kind)
            .with_trace_id(trace_id)
            .with_span_id(OtelSpanId::from_bytes(span.context.span_id().to_bytes()))
            .with_start_time(SystemTime::from(span.start.into_datetime()))
            .with_attributes(key_values(&span.attributes))
            .start_with_context(&tracer, &parent);

        match &span.status {
            SpanStatus::Unset => {}
            SpanStatus::Ok => otel_span.set_status(Status::Ok),
            SpanStatus::Error(description) => otel_span.set_status(Status::error(description.clone())),
        }
        otel_span.end_with_timestamp(SystemTime::from(span.end.into_datetime()));
    }
}

#[async_trait]
impl SpanExporter for OtlpSpanExporter {
    fn name(&self) -> &'static str {
        "otlp"
    }

    async fn export_spans(
        &self,
        _resource: &ResourceDescriptor,
        spans: &[SpanRecord],
    ) -> ExportResult<()> {
        for span in spans {
            self.replay(span);
        }
        Ok(())
    }

    async fn shutdown(&self) -> ExportResult<()> {
        let provider = self.provider.clone();
        blocking(move || provider.shutdown().map_err(|e| e.to_string())).await
    }
}

#[derive(Debug, Clone)]
enum Previous {
    Sum(u64),
    Buckets(Vec<u64>),
    Totals { count: u64, sum: f64 },
}

#[derive(Default)]
struct Instruments {
    counters: HashMap<String, Counter<u64>>,
    histograms: HashMap<String, Histogram<f64>>,
    previous: HashMap<(String, Attributes), Previous>,
}

/// Ships metric snapshots to an OTLP collector.
pub struct OtlpMetricExporter {
    provider: SdkMeterProvider,
    meter: Meter,
    instruments: Mutex<Instruments>,
}

impl OtlpMetricExporter {
    /// Connects lazily to `endpoint`.
    pub fn new(endpoint: &str, resource: &ResourceDescriptor) -> ExportResult<Self> {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(construction)?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(METRIC_INTERVAL)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(otel_resource(resource))
            .build();
        let meter = provider.meter("eventrelay");
        Ok(Self {
            provider,
            meter,
            instruments: Mutex::new(Instruments::default()),
        })
    }

    fn replay(&self, point: &MetricPoint) {
        let attributes = key_values(&point.labels);
        let key = (point.name.clone(), point.labels.clone());
        let mut instruments = self.instruments.lock();

        match &point.data {
            MetricData::Sum(total) => {
                let seen = match instruments.previous.get(&key) {
                    Some(Previous::Sum(seen)) => *seen,
                    _ => 0,
                };
                let counter = instruments
                    .counters
                    .entry(point.name.clone())
                    .or_insert_with(|| self.meter.u64_counter(point.name.clone()).build());
                if *total > seen {
                    counter.add(total - seen, &attributes);
                }
                instruments.previous.insert(key, Previous::Sum(*total));
            }
            MetricData::Histogram(data) => {
                let previous = instruments.previous.get(&key).cloned();
                let histogram = instruments
                    .histograms
                    .entry(point.name.clone())
                    .or_insert_with(|| {
                        self.meter
                            .f64_histogram(point.name.clone())
                            .with_unit(point.unit.clone())
                            .with_boundaries(DEFAULT_BOUNDARIES.to_vec())
                            .build()
                    })
                    .clone();
                let next = replay_histogram(&histogram, data, previous.as_ref(), &attributes);
                instruments.previous.insert(key, next);
            }
        }
    }
}

fn replay_histogram(
    histogram: &Histogram<f64>,
    data: &HistogramData,
    previous: Option<&Previous>,
    attributes: &[KeyValue],
) -> Previous {
    match &data.buckets {
        HistogramBuckets::Explicit { bounds, counts } => {
            let seen = match previous {
                Some(Previous::Buckets(seen)) => seen.clone(),
                _ => vec![0; counts.len()],
            };
            for (index, count) in counts.iter().enumerate() {
                let value = bounds.get(index).copied().unwrap_or(data.max);
                let fresh = count.saturating_sub(seen.get(index).copied().unwrap_or(0));
                for _ in 0..fresh {
                    histogram.record(value, attributes);
                }
            }
            Previous::Buckets(counts.clone())
        }
        HistogramBuckets::Exponential { .. } => {
            let (seen_count, seen_sum) = match previous {
                Some(Previous::Totals { count, sum }) => (*count, *sum),
                _ => (0, 0.0),
            };
            let fresh = data.count.saturating_sub(seen_count);
            if fresh > 0 {
                let mean = (data.sum - seen_sum) / fresh as f64;
                for _ in 0..fresh {
                    histogram.record(mean, attributes);
                }
            }
            Previous::Totals {
                count: data.count,
                sum: data.sum,
            }
        }
    }
}

#[async_trait]
impl MetricExporter for OtlpMetricExporter {
    fn name(&self) -> &'static str {
        "otlp"
    }

    async fn export_metrics(
        &self,
        _resource: &ResourceDescriptor,
        points: &[MetricPoint],
    ) -> ExportResult<()> {
        for point in points {
            self.replay(point);
        }
        Ok(())
    }

    async fn shutdown(&self) -> ExportResult<()> {
        let provider = self.provider.clone();
        blocking(move || provider.shutdown().map_err(|e| e.to_string())).await
    }
}

/// Ships log records to an OTLP collector.
pub struct OtlpLogExporter {
    provider: SdkLoggerProvider,
}

impl OtlpLogExporter {
    /// Connects lazily to `endpoint`.
    pub fn new(endpoint: &str, resource: &ResourceDescriptor) -> ExportResult<Self> {
        let exporter = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(construction)?;
        let provider = SdkLoggerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(otel_resource(resource))
            .build();
        Ok(Self { provider })
    }
}

const fn severity(level: LogLevel) -> (Severity, &'static str) {
    match level {
        LogLevel::Trace => (Severity::Trace, "TRACE"),
        LogLevel::Debug => (Severity::Debug, "DEBUG"),
        LogLevel::Info => (Severity::Info, "INFO"),
        LogLevel::Warn => (Severity::Warn, "WARN"),
        LogLevel::Error => (Severity::Error, "ERROR"),
    }
}

#[async_trait]
impl LogExporter for OtlpLogExporter {
    fn name(&self) -> &'static str {
        "otlp"
    }

    async fn export_logs(
        &self,
        _resource: &ResourceDescriptor,
        records: &[LogRecord],
    ) -> ExportResult<()> {
        let logger = self.provider.logger("eventrelay");
        for record in records {
            let (number, text) = severity(record.level);
            let mut otel = logger.create_log_record();
            otel.set_timestamp(SystemTime::from(record.timestamp.into_datetime()));
            otel.set_severity_number(number);
            otel.set_severity_text(text);
            otel.set_target(record.target.clone());
            otel.set_body(AnyValue::from(record.message.clone()));
            for (key, value) in &record.fields {
                otel.add_attribute(key.clone(), value.clone());
            }
            if let (Some(trace_id), Some(span_id)) = (record.trace_id, record.span_id) {
                otel.set_trace_context(
                    OtelTraceId::from_bytes(trace_id.to_bytes()),
                    OtelSpanId::from_bytes(span_id.to_bytes()),
                    Some(TraceFlags::SAMPLED),
                );
            }
            logger.emit(otel);
        }
        Ok(())
    }

    async fn shutdown(&self) -> ExportResult<()> {
        let provider = self.provider.clone();
        blocking(move || provider.shutdown().map_err(|e| e.to_string())).await
    }
}
