//! Export interfaces for shipping finished telemetry to backends.
//!
//! Each signal has its own exporter trait so a backend can implement only the
//! signals it understands. The [`ExporterSelector`] resolves an
//! [`ExporterConfig`] to a concrete exporter through a plain table keyed by
//! [`ExporterKind`]; there is no dynamic type lookup.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::options::{ExporterConfig, ExporterKind, SignalKind};
use super::records::{LogRecord, MetricPoint, SpanRecord};
use super::resource::ResourceDescriptor;
use crate::errors::{ExportError, ExportResult};

pub mod console;
pub mod memory;

#[cfg(feature = "opentelemetry")]
pub mod otlp;

#[cfg(feature = "prometheus")]
pub mod prometheus;

#[cfg(feature = "zipkin")]
pub mod zipkin;

pub use console::ConsoleExporter;
pub use memory::InMemoryExporter;

/// Ships finished spans.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Exports one batch.
    async fn export_spans(
        &self,
        resource: &ResourceDescriptor,
        spans: &[SpanRecord],
    ) -> ExportResult<()>;

    /// Flushes and releases network resources. Called once.
    async fn shutdown(&self) -> ExportResult<()> {
        Ok(())
    }
}

/// Ships cumulative metric snapshots.
#[async_trait]
pub trait MetricExporter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Exports one snapshot of every series.
    async fn export_metrics(
        &self,
        resource: &ResourceDescriptor,
        points: &[MetricPoint],
    ) -> ExportResult<()>;

    /// Flushes and releases network resources. Called once.
    async fn shutdown(&self) -> ExportResult<()> {
        Ok(())
    }
}

/// Ships log records.
#[async_trait]
pub trait LogExporter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Exports one batch.
    async fn export_logs(
        &self,
        resource: &ResourceDescriptor,
        records: &[LogRecord],
    ) -> ExportResult<()>;

    /// Flushes and releases network resources. Called once.
    async fn shutdown(&self) -> ExportResult<()> {
        Ok(())
    }
}

/// Builds exporters for [`ExporterKind::VendorManaged`].
///
/// The host registers one factory on the pipeline builder, for example a
/// driver for a cloud monitoring service. Signals a vendor does not support
/// keep the default `Unsupported` implementation.
pub trait VendorExporterFactory: Send + Sync {
    /// Span exporter for the vendor backend.
    fn span_exporter(
        &self,
        _resource: &Arc<ResourceDescriptor>,
    ) -> ExportResult<Arc<dyn SpanExporter>> {
        Err(unsupported(SignalKind::Trace))
    }

    /// Metric exporter for the vendor backend.
    fn metric_exporter(
        &self,
        _resource: &Arc<ResourceDescriptor>,
    ) -> ExportResult<Arc<dyn MetricExporter>> {
        Err(unsupported(SignalKind::Metric))
    }

    /// Log exporter for the vendor backend.
    fn log_exporter(
        &self,
        _resource: &Arc<ResourceDescriptor>,
    ) -> ExportResult<Arc<dyn LogExporter>> {
        Err(unsupported(SignalKind::Log))
    }
}

const fn unsupported(signal: SignalKind) -> ExportError {
    ExportError::Unsupported {
        kind: ExporterKind::VendorManaged,
        signal,
    }
}

/// Resolves exporter configurations to exporters.
pub struct ExporterSelector<'a> {
    resource: &'a Arc<ResourceDescriptor>,
    vendor: Option<&'a dyn VendorExporterFactory>,
    #[cfg(feature = "prometheus")]
    prometheus: Option<Arc<self::prometheus::PrometheusExporter>>,
}

impl<'a> ExporterSelector<'a> {
    /// Selector for `resource`, optionally able to build vendor exporters.
    pub fn new(
        resource: &'a Arc<ResourceDescriptor>,
        vendor: Option<&'a dyn VendorExporterFactory>,
    ) -> Self {
        Self {
            resource,
            vendor,
            #[cfg(feature = "prometheus")]
            prometheus: None,
        }
    }

    /// Span exporter for `config`.
    pub fn span_exporter(&self, config: &ExporterConfig) -> ExportResult<Arc<dyn SpanExporter>> {
        check_signal(config, SignalKind::Trace)?;
        match config.kind {
            ExporterKind::Console => Ok(Arc::new(ConsoleExporter::stdout())),
            ExporterKind::Otlp => self.otlp_spans(config),
            ExporterKind::Zipkin => Self::zipkin_spans(config),
            ExporterKind::VendorManaged => self.vendor()?.span_exporter(self.resource),
            ExporterKind::Prometheus => Err(ExportError::Unsupported {
                kind: config.kind,
                signal: SignalKind::Trace,
            }),
        }
    }

    /// Metric exporter for `config`.
    pub fn metric_exporter(
        &mut self,
        config: &ExporterConfig,
    ) -> ExportResult<Arc<dyn MetricExporter>> {
        check_signal(config, SignalKind::Metric)?;
        match config.kind {
            ExporterKind::Console => Ok(Arc::new(ConsoleExporter::stdout())),
            ExporterKind::Otlp => self.otlp_metrics(config),
            ExporterKind::Prometheus => self.prometheus_metrics(),
            ExporterKind::VendorManaged => self.vendor()?.metric_exporter(self.resource),
            ExporterKind::Zipkin => Err(ExportError::Unsupported {
                kind: config.kind,
                signal: SignalKind::Metric,
            }),
        }
    }

    /// Log exporter for `config`.
    pub fn log_exporter(&self, config: &ExporterConfig) -> ExportResult<Arc<dyn LogExporter>> {
        check_signal(config, SignalKind::Log)?;
        match config.kind {
            ExporterKind::Console => Ok(Arc::new(ConsoleExporter::stdout())),
            ExporterKind::Otlp => self.otlp_logs(config),
            ExporterKind::VendorManaged => self.vendor()?.log_exporter(self.resource),
            ExporterKind::Zipkin | ExporterKind::Prometheus => Err(ExportError::Unsupported {
                kind: config.kind,
                signal: SignalKind::Log,
            }),
        }
    }

    /// The Prometheus exporter built by this selector, if any.
    #[cfg(feature = "prometheus")]
    pub fn take_prometheus(&mut self) -> Option<Arc<self::prometheus::PrometheusExporter>> {
        self.prometheus.take()
    }

    fn vendor(&self) -> ExportResult<&'a dyn VendorExporterFactory> {
        self.vendor.ok_or(ExportError::NoVendorFactory)
    }

    #[cfg(feature = "opentelemetry")]
    fn otlp_spans(&self, config: &ExporterConfig) -> ExportResult<Arc<dyn SpanExporter>> {
        Ok(Arc::new(otlp::OtlpSpanExporter::new(
            otlp_endpoint(config),
            self.resource,
        )?))
    }

    #[cfg(not(feature = "opentelemetry"))]
    fn otlp_spans(&self, _config: &ExporterConfig) -> ExportResult<Arc<dyn SpanExporter>> {
        Err(not_compiled(ExporterKind::Otlp, "opentelemetry"))
    }

    #[cfg(feature = "opentelemetry")]
    fn otlp_metrics(&self, config: &ExporterConfig) -> ExportResult<Arc<dyn MetricExporter>> {
        Ok(Arc::new(otlp::OtlpMetricExporter::new(
            otlp_endpoint(config),
            self.resource,
        )?))
    }

    #[cfg(not(feature = "opentelemetry"))]
    fn otlp_metrics(&self, _config: &ExporterConfig) -> ExportResult<Arc<dyn MetricExporter>> {
        Err(not_compiled(ExporterKind::Otlp, "opentelemetry"))
    }

    #[cfg(feature = "opentelemetry")]
    fn otlp_logs(&self, config: &ExporterConfig) -> ExportResult<Arc<dyn LogExporter>> {
        Ok(Arc::new(otlp::OtlpLogExporter::new(
            otlp_endpoint(config),
            self.resource,
        )?))
    }

    #[cfg(not(feature = "opentelemetry"))]
    fn otlp_logs(&self, _config: &ExporterConfig) -> ExportResult<Arc<dyn LogExporter>> {
        Err(not_compiled(ExporterKind::Otlp, "opentelemetry"))
    }

    #[cfg(feature = "zipkin")]
    fn zipkin_spans(config: &ExporterConfig) -> ExportResult<Arc<dyn SpanExporter>> {
        let endpoint = config.endpoint.as_ref().map_or(
            super::options::DEFAULT_ZIPKIN_ENDPOINT,
            AsRef::as_ref,
        );
        Ok(Arc::new(zipkin::ZipkinExporter::new(endpoint)?))
    }

    #[cfg(not(feature = "zipkin"))]
    fn zipkin_spans(_config: &ExporterConfig) -> ExportResult<Arc<dyn SpanExporter>> {
        Err(not_compiled(ExporterKind::Zipkin, "zipkin"))
    }

    #[cfg(feature = "prometheus")]
    fn prometheus_metrics(&mut self) -> ExportResult<Arc<dyn MetricExporter>> {
        let exporter = match &self.prometheus {
            Some(existing) => Arc::clone(existing),
            None => Arc::new(self::prometheus::PrometheusExporter::new()),
        };
        self.prometheus = Some(Arc::clone(&exporter));
        Ok(exporter)
    }

    #[cfg(not(feature = "prometheus"))]
    fn prometheus_metrics(&mut self) -> ExportResult<Arc<dyn MetricExporter>> {
        Err(not_compiled(ExporterKind::Prometheus, "prometheus"))
    }
}

fn check_signal(config: &ExporterConfig, expected: SignalKind) -> ExportResult<()> {
    if config.signal == expected && config.kind.supports(expected) {
        Ok(())
    } else {
        Err(ExportError::Unsupported {
            kind: config.kind,
            signal: config.signal,
        })
    }
}

#[cfg(feature = "opentelemetry")]
fn otlp_endpoint(config: &ExporterConfig) -> &str {
    config
        .endpoint
        .as_ref()
        .map_or(super::options::DEFAULT_OTLP_ENDPOINT, AsRef::as_ref)
}

#[cfg(any(
    not(feature = "opentelemetry"),
    not(feature = "zipkin"),
    not(feature = "prometheus")
))]
const fn not_compiled(kind: ExporterKind, feature: &'static str) -> ExportError {
    ExportError::NotCompiled { kind, feature }
}

/// The active exporters of a pipeline, grouped by signal.
///
/// Export failures are logged per exporter; one failing backend never keeps
/// the others from receiving a batch.
#[derive(Default)]
pub struct ExporterRegistry {
    spans: Vec<Arc<dyn SpanExporter>>,
    metrics: Vec<Arc<dyn MetricExporter>>,
    logs: Vec<Arc<dyn LogExporter>>,
}

impl ExporterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a span exporter.
    pub fn register_span_exporter(&mut self, exporter: Arc<dyn SpanExporter>) {
        self.spans.push(exporter);
    }

    /// Registers a metric exporter.
    pub fn register_metric_exporter(&mut self, exporter: Arc<dyn MetricExporter>) {
        self.metrics.push(exporter);
    }

    /// Registers a log exporter.
    pub fn register_log_exporter(&mut self, exporter: Arc<dyn LogExporter>) {
        self.logs.push(exporter);
    }

    /// Number of exporters for `signal`.
    pub fn len(&self, signal: SignalKind) -> usize {
        match signal {
            SignalKind::Trace => self.spans.len(),
            SignalKind::Metric => self.metrics.len(),
            SignalKind::Log => self.logs.len(),
        }
    }

    /// Names of the exporters for `signal`, in registration order.
    pub fn names(&self, signal: SignalKind) -> Vec<&'static str> {
        match signal {
            SignalKind::Trace => self.spans.iter().map(|e| e.name()).collect(),
            SignalKind::Metric => self.metrics.iter().map(|e| e.name()).collect(),
            SignalKind::Log => self.logs.iter().map(|e| e.name()).collect(),
        }
    }

    /// Sends spans to every span exporter.
    pub async fn export_spans(&self, resource: &ResourceDescriptor, spans: &[SpanRecord]) {
        if spans.is_empty() {
            return;
        }
        for exporter in &self.spans {
            if let Err(error) = exporter.export_spans(resource, spans).await {
                warn!(exporter = exporter.name(), %error, dropped = spans.len(), "span export failed");
            }
        }
    }

    /// Sends a metric snapshot to every metric exporter.
    pub async fn export_metrics(&self, resource: &ResourceDescriptor, points: &[MetricPoint]) {
        if points.is_empty() {
            return;
        }
        for exporter in &self.metrics {
            if let Err(error) = exporter.export_metrics(resource, points).await {
                warn!(exporter = exporter.name(), %error, "metric export failed");
            }
        }
    }

    /// Sends log records to every log exporter.
    pub async fn export_logs(&self, resource: &ResourceDescriptor, records: &[LogRecord]) {
        if records.is_empty() {
            return;
        }
        for exporter in &self.logs {
            if let Err(error) = exporter.export_logs(resource, records).await {
                warn!(exporter = exporter.name(), %error, dropped = records.len(), "log export failed");
            }
        }
    }

    /// Shuts every exporter down.
    pub async fn shutdown(&self) {
        for exporter in &self.spans {
            if let Err(error) = exporter.shutdown().await {
                warn!(exporter = exporter.name(), %error, "span exporter shutdown failed");
            }
        }
        for exporter in &self.metrics {
            if let Err(error) = exporter.shutdown().await {
                warn!(exporter = exporter.name(), %error, "metric exporter shutdown failed");
            }
        }
        for exporter in &self.logs {
            if let Err(error) = exporter.shutdown().await {
                warn!(exporter = exporter.name(), %error, "log exporter shutdown failed");
            }
        }
    }
}

impl fmt::Debug for ExporterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterRegistry")
            .field("spans", &self.names(SignalKind::Trace))
            .field("metrics", &self.names(SignalKind::Metric))
            .field("logs", &self.names(SignalKind::Log))
            .finish()
    }
}
