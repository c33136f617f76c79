//! Bridges `tracing` events into the pipeline's log signal.

use std::fmt::Write as _;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::pipeline::TelemetryPipeline;
use super::records::{Attributes, LogLevel, LogRecord};
use crate::correlation::CorrelationContext;
use crate::types::Timestamp;

/// Events from the pipeline itself are not fed back into it.
const SELF_TARGET: &str = "eventrelay::telemetry";

/// A [`Layer`] that turns every `tracing` event into a [`LogRecord`].
///
/// Records are stamped with the ambient [`CorrelationContext`], so log lines
/// written inside a handler carry the trace of the message being processed.
#[derive(Debug, Clone)]
pub struct TelemetryLayer {
    pipeline: Option<TelemetryPipeline>,
}

impl TelemetryLayer {
    /// Layer feeding `pipeline`.
    pub const fn new(pipeline: TelemetryPipeline) -> Self {
        Self {
            pipeline: Some(pipeline),
        }
    }

    /// Layer feeding the installed pipeline, or doing nothing when none is.
    pub fn global() -> Self {
        Self {
            pipeline: TelemetryPipeline::global(),
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Attributes,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

impl<S: Subscriber> Layer<S> for TelemetryLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };
        let metadata = event.metadata();
        if metadata.target().starts_with(SELF_TARGET) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let correlation = CorrelationContext::current();

        pipeline.emit_log(LogRecord {
            timestamp: Timestamp::now(),
            level: LogLevel::from(metadata.level()),
            target: metadata.target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
            trace_id: correlation.as_ref().map(CorrelationContext::trace_id),
            span_id: correlation.as_ref().map(CorrelationContext::span_id),
        });
    }
}
