//! Exporter that keeps everything in memory for assertions.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LogExporter, MetricExporter, SpanExporter};
use crate::errors::ExportResult;
use crate::telemetry::records::{LogRecord, MetricPoint, SpanRecord};
use crate::telemetry::resource::ResourceDescriptor;

#[derive(Debug, Default)]
struct Captured {
    spans: Vec<SpanRecord>,
    metrics: Vec<MetricPoint>,
    logs: Vec<LogRecord>,
    shutdowns: usize,
}

/// Captures exported spans, metric snapshots and log records.
///
/// Clones share storage, so a test can keep one clone and hand another to the
/// pipeline builder.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    captured: Arc<Mutex<Captured>>,
}

impl InMemoryExporter {
    /// Creates an empty exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every span exported so far.
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.captured.lock().spans.clone()
    }

    /// Spans with the given name.
    pub fn spans_named(&self, name: &str) -> Vec<SpanRecord> {
        self.captured
            .lock()
            .spans
            .iter()
            .filter(|span| span.name == name)
            .cloned()
            .collect()
    }

    /// Every metric point exported so far, across all snapshots.
    pub fn metrics(&self) -> Vec<MetricPoint> {
        self.captured.lock().metrics.clone()
    }

    /// The most recent snapshot of the series `name` matching `labels`.
    pub fn latest_metric(&self, name: &str, labels: &[(&str, &str)]) -> Option<MetricPoint> {
        self.captured
            .lock()
            .metrics
            .iter()
            .rev()
            .find(|point| {
                point.name == name
                    && labels
                        .iter()
                        .all(|(key, value)| point.label(key) == Some(*value))
            })
            .cloned()
    }

    /// Every log record exported so far.
    pub fn logs(&self) -> Vec<LogRecord> {
        self.captured.lock().logs.clone()
    }

    /// How many times `shutdown` was called, summed over all signals.
    pub fn shutdown_calls(&self) -> usize {
        self.captured.lock().shutdowns
    }

    /// Forgets everything captured so far.
    pub fn clear(&self) {
        let mut captured = self.captured.lock();
        captured.spans.clear();
        captured.metrics.clear();
        captured.logs.clear();
    }
}

#[async_trait]
impl SpanExporter for InMemoryExporter {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn export_spans(
        &self,
        _resource: &ResourceDescriptor,
        spans: &[SpanRecord],
    ) -> ExportResult<()> {
        self.captured.lock().spans.extend_from_slice(spans);
        Ok(())
    }

    async fn shutdown(&self) -> ExportResult<()> {
        self.captured.lock().shutdowns += 1;
        Ok(())
    }
}

#[async_trait]
impl MetricExporter for InMemoryExporter {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn export_metrics(
        &self,
        _resource: &ResourceDescriptor,
        points: &[MetricPoint],
    ) -> ExportResult<()> {
        self.captured.lock().metrics.extend_from_slice(points);
        Ok(())
    }

    async fn shutdown(&self) -> ExportResult<()> {
        self.captured.lock().shutdowns += 1;
        Ok(())
    }
}

#[async_trait]
impl LogExporter for InMemoryExporter {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn export_logs(
        &self,
        _resource: &ResourceDescriptor,
        records: &[LogRecord],
    ) -> ExportResult<()> {
        self.captured.lock().logs.extend_from_slice(records);
        Ok(())
    }

    async fn shutdown(&self) -> ExportResult<()> {
        self.captured.lock().shutdowns += 1;
        Ok(())
    }
}
