//! Configuration-driven telemetry: traces, metrics and logs.
//!
//! A service describes itself with a [`ResourceDescriptor`], loads
//! [`TelemetrySettings`] from its configuration source and builds one
//! [`TelemetryPipeline`] at startup:
//!
//! ```no_run
//! use eventrelay::config::EnvSource;
//! use eventrelay::telemetry::{TelemetryPipelineBuilder, TelemetrySettings};
//!
//! # async fn run() {
//! let settings = TelemetrySettings::load(&EnvSource, "product-service");
//! let pipeline = TelemetryPipelineBuilder::from_settings(&settings)
//!     .with_source("product-service")
//!     .install();
//! // ... run the service ...
//! pipeline.shutdown().await;
//! # }
//! ```

pub mod exporters;
pub mod layer;
pub mod metrics;
pub mod options;
pub mod pipeline;
pub mod records;
pub mod resource;
pub mod sampler;
pub mod tracer;

pub use exporters::{
    ConsoleExporter, ExporterRegistry, ExporterSelector, InMemoryExporter, LogExporter,
    MetricExporter, SpanExporter, VendorExporterFactory,
};
pub use layer::TelemetryLayer;
pub use metrics::{Counter, Histogram, Meter};
pub use options::{
    Endpoint, ExporterConfig, ExporterKind, HistogramAggregation, SignalKind, TelemetrySettings,
    UnknownExporter,
};
pub use pipeline::{TelemetryPipeline, TelemetryPipelineBuilder, LIBRARY_SOURCE};
pub use records::{
    Attributes, HistogramBuckets, HistogramData, LogLevel, LogRecord, MetricData, MetricPoint,
    SpanKind, SpanRecord, SpanStatus,
};
pub use resource::ResourceDescriptor;
pub use sampler::SamplerPolicy;
pub use tracer::{ActiveSpan, Tracer};
