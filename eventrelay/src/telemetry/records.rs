//! Finished telemetry records handed to exporters.

use std::fmt;
use std::time::Duration;

use crate::correlation::{CorrelationContext, SpanId, TraceId};
use crate::types::Timestamp;

/// Key/value pairs attached to a span, log record or metric series.
pub type Attributes = Vec<(String, String)>;

/// Role of a span in a message flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// Work inside the process
    Internal,
    /// Sends a message to a broker
    Producer,
    /// Processes a message received from a broker
    Consumer,
}

impl SpanKind {
    /// Upper-case name used by Zipkin and OTLP.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "INTERNAL",
            Self::Producer => "PRODUCER",
            Self::Consumer => "CONSUMER",
        }
    }
}

/// Final status of a span.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SpanStatus {
    /// Ended without an explicit status
    #[default]
    Unset,
    /// Explicitly successful
    Ok,
    /// Failed, with a description
    Error(String),
}

/// A span that has ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanRecord {
    /// Operation name, for example `process ProductCreated`
    pub name: String,
    /// Instrumentation source that produced the span
    pub source: String,
    /// Role in the message flow
    pub kind: SpanKind,
    /// This span's position in its trace
    pub context: CorrelationContext,
    /// Span this one is a child of, if any
    pub parent_span_id: Option<SpanId>,
    /// Start time
    pub start: Timestamp,
    /// End time
    pub end: Timestamp,
    /// Attributes recorded while the span was active
    pub attributes: Attributes,
    /// Final status
    pub status: SpanStatus,
}

impl SpanRecord {
    /// Wall-clock duration, zero if the clock went backwards.
    pub fn duration(&self) -> Duration {
        (*self.end.as_datetime() - *self.start.as_datetime())
            .to_std()
            .unwrap_or_default()
    }

    /// Looks up an attribute by key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        lookup(&self.attributes, key)
    }
}

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Very verbose diagnostics
    Trace,
    /// Diagnostics
    Debug,
    /// Normal operation
    Info,
    /// Something unexpected that was handled
    Warn,
    /// A failure
    Error,
}

impl LogLevel {
    /// OpenTelemetry severity number for the level.
    pub const fn severity_number(self) -> u8 {
        match self {
            Self::Trace => 1,
            Self::Debug => 5,
            Self::Info => 9,
            Self::Warn => 13,
            Self::Error => 17,
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// One log event, stamped with the correlation that was current when it fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// When the event fired
    pub timestamp: Timestamp,
    /// Severity
    pub level: LogLevel,
    /// Module path or explicit target
    pub target: String,
    /// Rendered message
    pub message: String,
    /// Structured fields other than the message
    pub fields: Attributes,
    /// Trace the event belongs to
    pub trace_id: Option<TraceId>,
    /// Span the event was emitted under
    pub span_id: Option<SpanId>,
}

impl LogRecord {
    /// Looks up a structured field by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        lookup(&self.fields, key)
    }
}

/// Bucket layout of a histogram snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum HistogramBuckets {
    /// Fixed upper bounds; `counts` has one more entry than `bounds`, the last
    /// one counting values above the largest bound.
    Explicit {
        /// Inclusive upper bounds, ascending
        bounds: Vec<f64>,
        /// Count per bucket
        counts: Vec<u64>,
    },
    /// Base-2 exponential buckets: bucket `offset + i` covers
    /// `(base^(offset+i), base^(offset+i+1)]` with `base = 2^(2^-scale)`.
    Exponential {
        /// Resolution; higher is finer
        scale: i32,
        /// Count of values that were zero or negative
        zero_count: u64,
        /// Index of the first bucket in `counts`
        offset: i32,
        /// Count per bucket
        counts: Vec<u64>,
    },
}

/// Cumulative histogram state.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramData {
    /// Number of recorded values
    pub count: u64,
    /// Sum of recorded values
    pub sum: f64,
    /// Smallest recorded value
    pub min: f64,
    /// Largest recorded value
    pub max: f64,
    /// Bucket counts
    pub buckets: HistogramBuckets,
}

/// The value of a metric series.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricData {
    /// Monotonic cumulative sum
    Sum(u64),
    /// Distribution of recorded values
    Histogram(HistogramData),
}

/// Cumulative snapshot of one metric series.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    /// Instrument name
    pub name: String,
    /// Unit, for example `ms`
    pub unit: String,
    /// Instrumentation source that owns the instrument
    pub source: String,
    /// Series labels, sorted by key
    pub labels: Attributes,
    /// When the snapshot was taken
    pub timestamp: Timestamp,
    /// Series value
    pub data: MetricData,
}

impl MetricPoint {
    /// Looks up a label by key.
    pub fn label(&self, key: &str) -> Option<&str> {
        lookup(&self.labels, key)
    }

    /// The cumulative sum, if this is a counter.
    pub const fn as_sum(&self) -> Option<u64> {
        match self.data {
            MetricData::Sum(value) => Some(value),
            MetricData::Histogram(_) => None,
        }
    }

    /// The histogram state, if this is a histogram.
    pub const fn as_histogram(&self) -> Option<&HistogramData> {
        match &self.data {
            MetricData::Histogram(data) => Some(data),
            MetricData::Sum(_) => None,
        }
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(candidate, _)| candidate == key)
        .map(|(_, value)| value.as_str())
}
