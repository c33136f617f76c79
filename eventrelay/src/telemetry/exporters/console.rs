//! Human-readable exporter writing one line per record.
//!
//! This is the fallback every signal is guaranteed to have, so it never fails
//! for any reason other than the writer itself failing.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LogExporter, MetricExporter, SpanExporter};
use crate::errors::{ExportError, ExportResult};
use crate::telemetry::options::ExporterKind;
use crate::telemetry::records::{
    HistogramBuckets, LogRecord, MetricData, MetricPoint, SpanRecord, SpanStatus,
};
use crate::telemetry::resource::ResourceDescriptor;

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes spans, metrics and logs as text lines.
#[derive(Clone)]
pub struct ConsoleExporter {
    writer: SharedWriter,
}

impl ConsoleExporter {
    /// Exporter writing to standard output.
    pub fn stdout() -> Self {
        Self::with_writer(io::stdout())
    }

    /// Exporter writing to `writer`.
    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    fn write_lines(&self, lines: &[String]) -> ExportResult<()> {
        let mut writer = self.writer.lock();
        for line in lines {
            writeln!(writer, "{line}").map_err(write_failed)?;
        }
        writer.flush().map_err(write_failed)
    }
}

impl std::fmt::Debug for ConsoleExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleExporter").finish_non_exhaustive()
    }
}

fn write_failed(error: io::Error) -> ExportError {
    ExportError::Export {
        kind: ExporterKind::Console,
        reason: error.to_string(),
    }
}

fn format_pairs(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        let _ = write!(out, " {key}={value}");
    }
    out
}

fn format_span(resource: &ResourceDescriptor, span: &SpanRecord) -> String {
    let parent = span
        .parent_span_id
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    let status = match &span.status {
        SpanStatus::Unset => "unset".to_string(),
        SpanStatus::Ok => "ok".to_string(),
        SpanStatus::Error(description) => format!("error({description})"),
    };
    format!(
        "[span] service={} name=\"{}\" kind={} trace_id={} span_id={} parent_id={} duration_us={} status={}{}",
        resource.service_name(),
        span.name,
        span.kind.as_str(),
        span.context.trace_id(),
        span.context.span_id(),
        parent,
        span.duration().as_micros(),
        status,
        format_pairs(&span.attributes),
    )
}

fn format_metric(resource: &ResourceDescriptor, point: &MetricPoint) -> String {
    let value = match &point.data {
        MetricData::Sum(total) => format!("sum={total}"),
        MetricData::Histogram(data) => {
            let buckets = match &data.buckets {
                HistogramBuckets::Explicit { counts, .. } => {
                    format!("explicit[{}]", counts.len())
                }
                HistogramBuckets::Exponential { scale, counts, .. } => {
                    format!("exponential[scale={scale}, {}]", counts.len())
                }
            };
            format!(
                "count={} sum={} min={} max={} buckets={buckets}",
                data.count, data.sum, data.min, data.max
            )
        }
    };
    format!(
        "[metric] service={} name={} unit={} {value}{}",
        resource.service_name(),
        point.name,
        if point.unit.is_empty() { "1" } else { &point.unit },
        format_pairs(&point.labels),
    )
}

fn format_log(resource: &ResourceDescriptor, record: &LogRecord) -> String {
    let mut line = format!(
        "[log] {} {} service={} {}: {}",
        record.timestamp,
        record.level,
        resource.service_name(),
        record.target,
        record.message,
    );
    if let (Some(trace_id), Some(span_id)) = (record.trace_id, record.span_id) {
        let _ = write!(line, " trace_id={trace_id} span_id={span_id}");
    }
    line.push_str(&format_pairs(&record.fields));
    line
}

#[async_trait]
impl SpanExporter for ConsoleExporter {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn export_spans(
        &self,
        resource: &ResourceDescriptor,
        spans: &[SpanRecord],
    ) -> ExportResult<()> {
        let lines: Vec<_> = spans.iter().map(|s| format_span(resource, s)).collect();
        self.write_lines(&lines)
    }
}

#[async_trait]
impl MetricExporter for ConsoleExporter {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn export_metrics(
        &self,
        resource: &ResourceDescriptor,
        points: &[MetricPoint],
    ) -> ExportResult<()> {
        let lines: Vec<_> = points.iter().map(|p| format_metric(resource, p)).collect();
        self.write_lines(&lines)
    }
}

#[async_trait]
impl LogExporter for ConsoleExporter {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn export_logs(
        &self,
        resource: &ResourceDescriptor,
        records: &[LogRecord],
    ) -> ExportResult<()> {
        let lines: Vec<_> = records.iter().map(|r| format_log(resource, r)).collect();
        self.write_lines(&lines)
    }
}
