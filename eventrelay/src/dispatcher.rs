//! Turns a received message body into a [`DeliveryOutcome`].
//!
//! The dispatcher knows nothing about brokers. The adapter hands it the raw
//! body plus a [`DispatchContext`] (attempt number, extracted correlation)
//! and settles the message according to the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::correlation::CorrelationContext;
use crate::envelope::EventEnvelope;
use crate::errors::HandlerError;
use crate::outcome::{DeadLetterReason, DeliveryOutcome, RetryReason};
use crate::registry::{ConsumerRegistry, Registration};
use crate::telemetry::{
    ActiveSpan, Counter, Histogram, Meter, SpanKind, SpanStatus, TelemetryPipeline, Tracer,
    LIBRARY_SOURCE,
};

/// Counter of dispatched messages, labelled `event_type` and `outcome`.
pub const DISPATCHED_METRIC: &str = "eventrelay.messages.dispatched";
/// Histogram of dispatch latency in milliseconds.
pub const DURATION_METRIC: &str = "eventrelay.dispatch.duration";

/// `event_type` label for messages whose type has no registered consumer.
pub const UNREGISTERED_EVENT_TYPE: &str = "unregistered";

/// `event_type` label for bodies that are not envelopes.
pub const UNDECODABLE_EVENT_TYPE: &str = "unknown";

/// Transport-neutral facts about one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    /// Destination the message was received from, for logs and spans
    pub destination: String,
    /// Broker-level message id
    pub message_id: String,
    /// 1-based delivery attempt
    pub attempt: u32,
    /// Correlation extracted from the transport headers
    pub correlation: Option<CorrelationContext>,
}

impl DispatchContext {
    /// Context for a first delivery without correlation.
    pub fn new(destination: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            message_id: message_id.into(),
            attempt: 1,
            correlation: None,
        }
    }

    /// Sets the delivery attempt.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Sets the upstream correlation.
    #[must_use]
    pub fn with_correlation(mut self, correlation: Option<CorrelationContext>) -> Self {
        self.correlation = correlation;
        self
    }
}

/// Invokes registered handlers for received messages. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    registry: Arc<ConsumerRegistry>,
    tracer: Tracer,
    dispatched: Counter,
    duration: Histogram,
}

impl EventDispatcher {
    /// Dispatcher over `registry`, which is sealed against further
    /// registrations. Telemetry is inert until
    /// [`with_telemetry`](Self::with_telemetry) is called.
    pub fn new(registry: Arc<ConsumerRegistry>) -> Self {
        registry.seal();
        Self::instrumented(
            registry,
            Tracer::noop(LIBRARY_SOURCE),
            &Meter::noop(LIBRARY_SOURCE),
        )
    }

    /// Emits spans and metrics through `pipeline`.
    #[must_use]
    pub fn with_telemetry(self, pipeline: &TelemetryPipeline) -> Self {
        Self::instrumented(
            self.registry,
            pipeline.tracer(LIBRARY_SOURCE),
            &pipeline.meter(LIBRARY_SOURCE),
        )
    }

    fn instrumented(registry: Arc<ConsumerRegistry>, tracer: Tracer, meter: &Meter) -> Self {
        Self {
            registry,
            tracer,
            dispatched: meter.counter(DISPATCHED_METRIC),
            duration: meter.histogram(DURATION_METRIC, "ms"),
        }
    }

    /// The registry handlers are resolved from.
    pub const fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Dispatches one message body.
    ///
    /// Never fails: every problem is expressed as an outcome.
    pub async fn dispatch(&self, body: &[u8], context: &DispatchContext) -> DeliveryOutcome {
        let started = Instant::now();

        let envelope = match EventEnvelope::from_bytes(body) {
            Ok(envelope) => envelope,
            Err(error) => {
                let span = self.start_span("process", context);
                error!(
                    destination = %context.destination,
                    message_id = %context.message_id,
                    %error,
                    "dead-lettering malformed message"
                );
                let outcome =
                    DeliveryOutcome::dead_lettered(DeadLetterReason::Serialization, error.to_string());
                self.finish(span, &outcome, UNDECODABLE_EVENT_TYPE, started);
                return outcome;
            }
        };

        let event_type = envelope.event_type().to_string();
        let mut span = self.start_span(&format!("process {event_type}"), context);
        span.set_attribute("messaging.message.id", &context.message_id);
        span.set_attribute("eventrelay.event_id", envelope.event_id());
        span.set_attribute("eventrelay.event_type", &event_type);
        let envelope = match &context.correlation {
            Some(upstream) => envelope.with_correlation(upstream.clone()),
            None => envelope,
        };

        let registrations = self.registry.resolve(envelope.event_type());
        let label = match registrations {
            Some(_) => event_type.as_str(),
            None => UNREGISTERED_EVENT_TYPE,
        };
        let outcome = match registrations {
            None => {
                error!(
                    event_type = %event_type,
                    event_id = %envelope.event_id(),
                    "dead-lettering message without a registered consumer"
                );
                DeliveryOutcome::dead_lettered(
                    DeadLetterReason::NoHandler,
                    format!("no consumer registered for {event_type}"),
                )
            }
            Some(registrations) => {
                let invocations = registrations
                    .iter()
                    .map(|registration| invoke(registration, &envelope, context.attempt));
                let outcomes = span.context().clone().scope(join_all(invocations)).await;
                DeliveryOutcome::least_successful(outcomes)
            }
        };

        self.finish(span, &outcome, label, started);
        outcome
    }

    fn start_span(&self, name: &str, context: &DispatchContext) -> ActiveSpan {
        let mut span =
            self.tracer
                .start_with_parent(name, SpanKind::Consumer, context.correlation.as_ref());
        span.set_attribute("messaging.destination.name", &context.destination);
        span.set_attribute("messaging.message.delivery_attempt", context.attempt);
        span
    }

    fn finish(
        &self,
        mut span: ActiveSpan,
        outcome: &DeliveryOutcome,
        event_type: &str,
        started: Instant,
    ) {
        let labels = [("event_type", event_type), ("outcome", outcome.label())];
        self.dispatched.add(1, &labels);
        self.duration
            .record(started.elapsed().as_secs_f64() * 1000.0, &labels);

        span.set_attribute("eventrelay.outcome", outcome);
        match outcome {
            DeliveryOutcome::Acknowledged => span.set_status(SpanStatus::Ok),
            DeliveryOutcome::Retry { description, .. }
            | DeliveryOutcome::DeadLettered { description, .. } => {
                span.set_status(SpanStatus::Error(description.clone()));
            }
        }
        span.end();
    }
}

async fn invoke(registration: &Registration, envelope: &EventEnvelope, attempt: u32) -> DeliveryOutcome {
    let policy = registration.policy();
    let execution = AssertUnwindSafe(registration.handler().handle(envelope)).catch_unwind();

    let outcome = match tokio::time::timeout(policy.timeout, execution).await {
        Ok(Ok(Ok(()))) => DeliveryOutcome::Acknowledged,
        Ok(Ok(Err(HandlerError::Rejected(reason)))) => {
            DeliveryOutcome::dead_lettered(DeadLetterReason::HandlerRejected, reason)
        }
        Ok(Ok(Err(HandlerError::Fault(reason)))) => {
            retry_or_exhaust(registration, RetryReason::HandlerFault, reason, attempt)
        }
        Ok(Err(panic)) => retry_or_exhaust(
            registration,
            RetryReason::HandlerFault,
            format!("handler panicked: {}", panic_message(panic.as_ref())),
            attempt,
        ),
        Err(_elapsed) => retry_or_exhaust(
            registration,
            RetryReason::Timeout,
            format!("handler exceeded {:?}", policy.timeout),
            attempt,
        ),
    };

    match &outcome {
        DeliveryOutcome::Acknowledged => debug!(
            handler = registration.name(),
            event_id = %envelope.event_id(),
            attempt,
            "handler succeeded"
        ),
        DeliveryOutcome::Retry { reason, description } => warn!(
            handler = registration.name(),
            event_id = %envelope.event_id(),
            attempt,
            %reason,
            %description,
            "handler failed, message will be redelivered"
        ),
        DeliveryOutcome::DeadLettered { reason, description } => error!(
            handler = registration.name(),
            event_id = %envelope.event_id(),
            attempt,
            %reason,
            %description,
            "handler failed permanently, message will be dead-lettered"
        ),
    }
    outcome
}

fn retry_or_exhaust(
    registration: &Registration,
    reason: RetryReason,
    description: String,
    attempt: u32,
) -> DeliveryOutcome {
    if registration.policy().is_exhausted(attempt) {
        DeliveryOutcome::dead_lettered(
            DeadLetterReason::MaxRetriesExceeded,
            format!("{reason} on attempt {attempt}: {description}"),
        )
    } else {
        DeliveryOutcome::retry(reason, description)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
