//! The telemetry pipeline: resource, sources, sampler, instruments and exporters.
//!
//! A pipeline is assembled once at startup by [`TelemetryPipelineBuilder`].
//! Construction never fails: exporters that cannot be built are logged and
//! dropped, and any signal left without an exporter falls back to the console.
//!
//! Finished spans and log records are buffered and shipped on
//! [`TelemetryPipeline::flush`]; metric series are snapshotted at the same
//! time. [`TelemetryPipeline::shutdown`] performs a final flush and releases
//! every exporter, exactly once.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::exporters::{
    ConsoleExporter, ExporterRegistry, ExporterSelector, LogExporter, MetricExporter,
    SpanExporter, VendorExporterFactory,
};
use super::metrics::{Meter, MetricStore};
use super::options::{ExporterConfig, HistogramAggregation, SignalKind, TelemetrySettings};
use super::records::{LogRecord, SpanRecord};
use super::resource::ResourceDescriptor;
use super::sampler::SamplerPolicy;
use super::tracer::Tracer;

/// Instrumentation source used by this library's own spans and metrics.
pub const LIBRARY_SOURCE: &str = "eventrelay";

/// Default number of spans, and separately log records, held between flushes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;

static GLOBAL: OnceLock<TelemetryPipeline> = OnceLock::new();

#[derive(Debug)]
struct Buffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(item);
    }

    fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }
}

/// Shared state behind every clone of a [`TelemetryPipeline`].
pub(crate) struct PipelineCore {
    resource: Arc<ResourceDescriptor>,
    sources: BTreeSet<String>,
    sampler: SamplerPolicy,
    aggregation: HistogramAggregation,
    metrics: Arc<MetricStore>,
    spans: Mutex<Buffer<SpanRecord>>,
    logs: Mutex<Buffer<LogRecord>>,
    exporters: ExporterRegistry,
    flushing: tokio::sync::Mutex<()>,
    shut_down: AtomicBool,
    #[cfg(feature = "prometheus")]
    prometheus: Option<Arc<super::exporters::prometheus::PrometheusExporter>>,
}

impl PipelineCore {
    pub(crate) const fn sampler(&self) -> &SamplerPolicy {
        &self.sampler
    }

    pub(crate) fn record_span(&self, span: SpanRecord) {
        if !self.shut_down.load(Ordering::Acquire) {
            self.spans.lock().push(span);
        }
    }

    pub(crate) fn record_log(&self, record: LogRecord) {
        if !self.shut_down.load(Ordering::Acquire) {
            self.logs.lock().push(record);
        }
    }
}

/// Assembles a [`TelemetryPipeline`].
pub struct TelemetryPipelineBuilder {
    resource: Arc<ResourceDescriptor>,
    sources: BTreeSet<String>,
    sampler: SamplerPolicy,
    aggregation: HistogramAggregation,
    configs: Vec<ExporterConfig>,
    vendor: Option<Box<dyn VendorExporterFactory>>,
    span_exporters: Vec<Arc<dyn SpanExporter>>,
    metric_exporters: Vec<Arc<dyn MetricExporter>>,
    log_exporters: Vec<Arc<dyn LogExporter>>,
    buffer_capacity: usize,
}

impl TelemetryPipelineBuilder {
    /// Starts a builder for `resource` with always-on sampling and explicit
    /// histogram buckets.
    pub fn new(resource: Arc<ResourceDescriptor>) -> Self {
        Self {
            resource,
            sources: BTreeSet::from([LIBRARY_SOURCE.to_string()]),
            sampler: SamplerPolicy::AlwaysOn,
            aggregation: HistogramAggregation::Explicit,
            configs: Vec::new(),
            vendor: None,
            span_exporters: Vec::new(),
            metric_exporters: Vec::new(),
            log_exporters: Vec::new(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Starts a builder from loaded settings.
    pub fn from_settings(settings: &TelemetrySettings) -> Self {
        Self::new(settings.resource().shared())
            .with_sampler(settings.sampler.clone())
            .with_histogram_aggregation(settings.histogram_aggregation)
            .with_exporters(settings.exporters.iter().cloned())
    }

    /// Subscribes to spans and metrics from an instrumentation source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.insert(source.into());
        self
    }

    /// Sets the process-wide trace sampler.
    #[must_use]
    pub fn with_sampler(mut self, sampler: SamplerPolicy) -> Self {
        self.sampler = sampler;
        self
    }

    /// Sets the aggregation used by every histogram.
    #[must_use]
    pub const fn with_histogram_aggregation(mut self, aggregation: HistogramAggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Adds one exporter route.
    #[must_use]
    pub fn with_exporter(mut self, config: ExporterConfig) -> Self {
        self.configs.push(config);
        self
    }

    /// Adds several exporter routes.
    #[must_use]
    pub fn with_exporters(mut self, configs: impl IntoIterator<Item = ExporterConfig>) -> Self {
        self.configs.extend(configs);
        self
    }

    /// Registers the factory used for [`super::ExporterKind::VendorManaged`] routes.
    #[must_use]
    pub fn with_vendor_factory(mut self, factory: impl VendorExporterFactory + 'static) -> Self {
        self.vendor = Some(Box::new(factory));
        self
    }

    /// Adds an already-built span exporter.
    #[must_use]
    pub fn with_span_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.span_exporters.push(exporter);
        self
    }

    /// Adds an already-built metric exporter.
    #[must_use]
    pub fn with_metric_exporter(mut self, exporter: Arc<dyn MetricExporter>) -> Self {
        self.metric_exporters.push(exporter);
        self
    }

    /// Adds an already-built log exporter.
    #[must_use]
    pub fn with_log_exporter(mut self, exporter: Arc<dyn LogExporter>) -> Self {
        self.log_exporters.push(exporter);
        self
    }

    /// Caps the number of buffered spans and of buffered log records.
    #[must_use]
    pub const fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Builds an independent pipeline.
    pub fn build(self) -> TelemetryPipeline {
        let mut seen = BTreeSet::new();
        let configs: Vec<ExporterConfig> = self
            .configs
            .into_iter()
            .filter(|config| {
                let fresh = seen.insert((config.signal, config.kind));
                if !fresh {
                    debug!(signal = %config.signal, exporter = %config.kind, "ignoring duplicate exporter route");
                }
                fresh
            })
            .collect();

        let mut selector = ExporterSelector::new(&self.resource, self.vendor.as_deref());
        let mut registry = ExporterRegistry::new();

        for config in &configs {
            let outcome = match config.signal {
                SignalKind::Trace => selector
                    .span_exporter(config)
                    .map(|exporter| registry.register_span_exporter(exporter)),
                SignalKind::Metric => selector
                    .metric_exporter(config)
                    .map(|exporter| registry.register_metric_exporter(exporter)),
                SignalKind::Log => selector
                    .log_exporter(config)
                    .map(|exporter| registry.register_log_exporter(exporter)),
            };
            if let Err(error) = outcome {
                warn!(signal = %config.signal, exporter = %config.kind, %error, "dropping exporter");
            }
        }

        #[cfg(feature = "prometheus")]
        let prometheus = selector.take_prometheus();

        self.span_exporters
            .into_iter()
            .for_each(|exporter| registry.register_span_exporter(exporter));
        self.metric_exporters
            .into_iter()
            .for_each(|exporter| registry.register_metric_exporter(exporter));
        self.log_exporters
            .into_iter()
            .for_each(|exporter| registry.register_log_exporter(exporter));

        for signal in SignalKind::ALL {
            if registry.len(signal) == 0 {
                if configs.iter().any(|config| config.signal == signal) {
                    warn!(%signal, "no exporter could be built, falling back to console");
                }
                let console = ConsoleExporter::stdout();
                match signal {
                    SignalKind::Trace => registry.register_span_exporter(Arc::new(console)),
                    SignalKind::Metric => registry.register_metric_exporter(Arc::new(console)),
                    SignalKind::Log => registry.register_log_exporter(Arc::new(console)),
                }
            }
        }

        info!(
            service = self.resource.service_name(),
            instance = self.resource.instance_id(),
            exporters = ?registry,
            sampler = ?self.sampler,
            histograms = ?self.aggregation,
            "telemetry pipeline built"
        );

        TelemetryPipeline {
            core: Arc::new(PipelineCore {
                resource: self.resource,
                sources: self.sources,
                sampler: self.sampler,
                aggregation: self.aggregation,
                metrics: Arc::new(MetricStore::new(self.aggregation)),
                spans: Mutex::new(Buffer::new(self.buffer_capacity)),
                logs: Mutex::new(Buffer::new(self.buffer_capacity)),
                exporters: registry,
                flushing: tokio::sync::Mutex::new(()),
                shut_down: AtomicBool::new(false),
                #[cfg(feature = "prometheus")]
                prometheus,
            }),
        }
    }

    /// Builds the pipeline and registers it as the process-wide pipeline.
    ///
    /// Only the first call builds anything. Later calls log a warning and
    /// return the pipeline that is already installed.
    pub fn install(self) -> TelemetryPipeline {
        let mut built_now = false;
        let pipeline = GLOBAL.get_or_init(|| {
            built_now = true;
            self.build()
        });
        if !built_now {
            warn!("telemetry pipeline already installed; keeping the existing one");
        }
        pipeline.clone()
    }
}

/// Handle to a running telemetry pipeline. Cheap to clone.
#[derive(Clone)]
pub struct TelemetryPipeline {
    core: Arc<PipelineCore>,
}

impl TelemetryPipeline {
    /// Starts a builder for `resource`.
    pub fn builder(resource: Arc<ResourceDescriptor>) -> TelemetryPipelineBuilder {
        TelemetryPipelineBuilder::new(resource)
    }

    /// The process-wide pipeline, if one was installed.
    pub fn global() -> Option<Self> {
        GLOBAL.get().cloned()
    }

    /// Identity stamped on every signal.
    pub fn resource(&self) -> &Arc<ResourceDescriptor> {
        &self.core.resource
    }

    /// Active trace sampler.
    pub fn sampler(&self) -> &SamplerPolicy {
        &self.core.sampler
    }

    /// Active histogram aggregation.
    pub fn histogram_aggregation(&self) -> HistogramAggregation {
        self.core.aggregation
    }

    /// Whether `source` is subscribed.
    pub fn has_source(&self, source: &str) -> bool {
        self.core.sources.contains(source)
    }

    /// Names of the active exporters for `signal`.
    pub fn exporter_names(&self, signal: SignalKind) -> Vec<&'static str> {
        self.core.exporters.names(signal)
    }

    /// Tracer for `source`; inert unless the source is subscribed.
    pub fn tracer(&self, source: &str) -> Tracer {
        let core = self.has_source(source).then(|| Arc::clone(&self.core));
        Tracer::new(source, core)
    }

    /// Meter for `source`; inert unless the source is subscribed.
    pub fn meter(&self, source: &str) -> Meter {
        let store = self
            .has_source(source)
            .then(|| Arc::clone(&self.core.metrics));
        Meter::new(source, store)
    }

    /// Buffers a log record for the next flush.
    pub fn emit_log(&self, record: LogRecord) {
        self.core.record_log(record);
    }

    /// Spans discarded because the buffer was full.
    pub fn dropped_spans(&self) -> u64 {
        self.core.spans.lock().dropped
    }

    /// Log records discarded because the buffer was full.
    pub fn dropped_logs(&self) -> u64 {
        self.core.logs.lock().dropped
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.core.shut_down.load(Ordering::Acquire)
    }

    /// The Prometheus exporter, when one was configured.
    #[cfg(feature = "prometheus")]
    pub fn prometheus(&self) -> Option<Arc<super::exporters::prometheus::PrometheusExporter>> {
        self.core.prometheus.clone()
    }

    /// Ships everything buffered so far and a snapshot of every metric series.
    pub async fn flush(&self) {
        let _guard = self.core.flushing.lock().await;
        let spans = self.core.spans.lock().drain();
        let logs = self.core.logs.lock().drain();
        let metrics = self.core.metrics.collect();
        let resource = &self.core.resource;

        self.core.exporters.export_spans(resource, &spans).await;
        self.core.exporters.export_metrics(resource, &metrics).await;
        self.core.exporters.export_logs(resource, &logs).await;
    }

    /// Flushes every `interval` until `token` is cancelled.
    pub fn spawn_periodic_flush(
        &self,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => pipeline.flush().await,
                }
            }
            debug!("periodic telemetry flush stopped");
        })
    }

    /// Final flush, then shuts every exporter down. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::AcqRel) {
            debug!("telemetry pipeline already shut down");
            return;
        }
        self.flush().await;
        self.core.exporters.shutdown().await;
        info!(
            dropped_spans = self.dropped_spans(),
            dropped_logs = self.dropped_logs(),
            "telemetry pipeline shut down"
        );
    }
}

impl std::fmt::Debug for TelemetryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPipeline")
            .field("resource", &self.core.resource)
            .field("sources", &self.core.sources)
            .field("sampler", &self.core.sampler)
            .field("exporters", &self.core.exporters)
            .finish()
    }
}
