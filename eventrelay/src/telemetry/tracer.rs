//! Span creation.

use std::sync::Arc;

use super::pipeline::PipelineCore;
use super::records::{Attributes, SpanKind, SpanRecord, SpanStatus};
use crate::correlation::CorrelationContext;
use crate::types::Timestamp;

/// Starts spans for one instrumentation source.
///
/// A tracer for a source the pipeline does not subscribe to still hands out
/// spans with valid correlation contexts, so propagation keeps working, but
/// those spans are never recorded.
#[derive(Clone)]
pub struct Tracer {
    source: Arc<str>,
    core: Option<Arc<PipelineCore>>,
}

impl Tracer {
    pub(crate) fn new(source: &str, core: Option<Arc<PipelineCore>>) -> Self {
        Self {
            source: Arc::from(source),
            core,
        }
    }

    /// A tracer that records nothing.
    pub fn noop(source: &str) -> Self {
        Self::new(source, None)
    }

    /// Whether spans from this tracer can reach an exporter.
    pub const fn is_enabled(&self) -> bool {
        self.core.is_some()
    }

    /// Starts a span under the ambient correlation context, or a new trace
    /// when there is none.
    pub fn start(&self, name: impl Into<String>, kind: SpanKind) -> ActiveSpan {
        self.start_with_parent(name, kind, CorrelationContext::current().as_ref())
    }

    /// Starts a span under an explicit parent.
    pub fn start_with_parent(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&CorrelationContext>,
    ) -> ActiveSpan {
        let context = match (parent, &self.core) {
            (Some(parent), Some(core)) => {
                let sampled = core.sampler().should_sample(Some(parent), parent.trace_id());
                parent.child().with_sampled(sampled)
            }
            (Some(parent), None) => parent.child(),
            (None, Some(core)) => {
                let root = CorrelationContext::new_root(true);
                let sampled = core.sampler().should_sample(None, root.trace_id());
                root.with_sampled(sampled)
            }
            (None, None) => CorrelationContext::new_root(false),
        };

        ActiveSpan {
            state: Some(SpanState {
                name: name.into(),
                kind,
                parent_span_id: parent.map(CorrelationContext::span_id),
                start: Timestamp::now(),
                attributes: Vec::new(),
                status: SpanStatus::Unset,
            }),
            context,
            source: Arc::clone(&self.source),
            core: self.core.clone(),
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

struct SpanState {
    name: String,
    kind: SpanKind,
    parent_span_id: Option<crate::correlation::SpanId>,
    start: Timestamp,
    attributes: Attributes,
    status: SpanStatus,
}

/// A span in progress. Ends when [`end`](Self::end) is called or on drop.
pub struct ActiveSpan {
    state: Option<SpanState>,
    context: CorrelationContext,
    source: Arc<str>,
    core: Option<Arc<PipelineCore>>,
}

impl ActiveSpan {
    /// Correlation context identifying this span; pass it to
    /// [`CorrelationContext::scope`] or inject it into outgoing headers.
    pub const fn context(&self) -> &CorrelationContext {
        &self.context
    }

    /// Whether this span will be exported.
    pub fn is_recording(&self) -> bool {
        self.core.is_some() && self.context.is_sampled()
    }

    /// Records an attribute, replacing an earlier value for the same key.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl ToString) {
        if let Some(state) = &mut self.state {
            let key = key.into();
            let value = value.to_string();
            match state.attributes.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => state.attributes.push((key, value)),
            }
        }
    }

    /// Sets the final status.
    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(state) = &mut self.state {
            state.status = status;
        }
    }

    /// Ends the span successfully unless an error status was set.
    pub fn end(mut self) {
        self.finish();
    }

    /// Ends the span with an error status.
    pub fn end_with_error(mut self, description: impl Into<String>) {
        self.set_status(SpanStatus::Error(description.into()));
        self.finish();
    }

    fn finish(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let Some(core) = &self.core else {
            return;
        };
        if !self.context.is_sampled() {
            return;
        }
        core.record_span(SpanRecord {
            name: state.name,
            source: self.source.to_string(),
            kind: state.kind,
            context: self.context.clone(),
            parent_span_id: state.parent_span_id,
            start: state.start,
            end: Timestamp::now(),
            attributes: state.attributes,
            status: state.status,
        });
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for ActiveSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSpan")
            .field("context", &self.context)
            .field("recording", &self.is_recording())
            .finish_non_exhaustive()
    }
}
