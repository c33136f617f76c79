//! Uniform publish and consume on top of any [`Transport`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Destination, InboundMessage, OutboundMessage, PublishAck, Settlement, Transport};
use crate::config::ConsumerSettings;
use crate::correlation::{CorrelationContext, MessageHeaders};
use crate::dispatcher::{DispatchContext, EventDispatcher};
use crate::envelope::{EventEnvelope, CONTENT_TYPE};
use crate::errors::{PublishError, PublishResult, TransportError};
use crate::telemetry::{Counter, Meter, SpanKind, SpanStatus, TelemetryPipeline, Tracer, LIBRARY_SOURCE};
use crate::types::DestinationName;

/// Counter of publish attempts, labelled `event_type` and `result`.
pub const PUBLISHED_METRIC: &str = "eventrelay.messages.published";

/// Header carrying the envelope's event type, for routing and inspection.
pub const EVENT_TYPE_HEADER: &str = "event-type";

const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

/// Backoff for [`BrokerAdapter::publish_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if seconds.is_finite() && seconds < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(seconds)
        } else {
            self.max_delay
        }
    }

    /// [`delay_for`](Self::delay_for) scaled by a random factor in `[0.5, 1.0]`.
    fn jittered_delay(&self, attempt: u32) -> Duration {
        self.delay_for(attempt)
            .mul_f64(rand::rng().random_range(0.5..=1.0))
    }
}

/// Counts deliveries per destination and message id for brokers that do not.
#[derive(Debug, Default)]
struct AttemptTracker {
    counts: Mutex<HashMap<(String, String), u32>>,
}

impl AttemptTracker {
    fn next(&self, destination: &Destination, message_id: &str) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts
            .entry((destination.to_string(), message_id.to_string()))
            .or_insert(0);
        *count += 1;
        *count
    }

    fn clear(&self, destination: &Destination, message_id: &str) {
        self.counts
            .lock()
            .remove(&(destination.to_string(), message_id.to_string()));
    }
}

/// Publishes envelopes and runs consumer loops over one [`Transport`].
#[derive(Clone)]
pub struct BrokerAdapter {
    transport: Arc<dyn Transport>,
    tracer: Tracer,
    published: Counter,
    attempts: Arc<AttemptTracker>,
}

impl BrokerAdapter {
    /// Adapter over `transport` with inert telemetry.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            tracer: Tracer::noop(LIBRARY_SOURCE),
            published: Meter::noop(LIBRARY_SOURCE).counter(PUBLISHED_METRIC),
            attempts: Arc::new(AttemptTracker::default()),
        }
    }

    /// Emits producer spans and publish metrics through `pipeline`.
    #[must_use]
    pub fn with_telemetry(mut self, pipeline: &TelemetryPipeline) -> Self {
        self.tracer = pipeline.tracer(LIBRARY_SOURCE);
        self.published = pipeline.meter(LIBRARY_SOURCE).counter(PUBLISHED_METRIC);
        self
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Publishes `envelope` to a queue or topic.
    ///
    /// The producer span becomes a child of the envelope's correlation, or of
    /// the ambient one when the envelope carries none, and its context is
    /// injected into the message headers.
    pub async fn publish(
        &self,
        envelope: &EventEnvelope,
        entity: &DestinationName,
    ) -> PublishResult<PublishAck> {
        let parent = envelope
            .correlation()
            .cloned()
            .or_else(CorrelationContext::current);
        let event_type = envelope.event_type().to_string();
        let mut span = self.tracer.start_with_parent(
            format!("publish {event_type}"),
            SpanKind::Producer,
            parent.as_ref(),
        );
        let message_id = Uuid::now_v7().to_string();
        span.set_attribute("messaging.system", self.transport.name());
        span.set_attribute("messaging.destination.name", entity);
        span.set_attribute("messaging.message.id", &message_id);

        let result = match envelope.to_bytes() {
            Ok(body) => {
                let mut headers = MessageHeaders::new();
                span.context()
                    .inject(&mut headers, self.transport.propagation_style());
                headers.insert(EVENT_TYPE_HEADER, event_type.clone());
                let message = OutboundMessage {
                    message_id,
                    body,
                    headers,
                    content_type: CONTENT_TYPE.to_string(),
                };
                self.transport.send(entity, message).await
            }
            Err(error) => Err(PublishError::from(error)),
        };

        let label = match &result {
            Ok(_) => "ok",
            Err(error) => error.kind(),
        };
        self.published
            .add(1, &[("event_type", &event_type), ("result", label)]);
        match &result {
            Ok(ack) => {
                debug!(
                    event_type = %event_type,
                    event_id = %envelope.event_id(),
                    destination = %entity,
                    sequence = ?ack.sequence_number,
                    "published"
                );
                span.set_status(SpanStatus::Ok);
            }
            Err(error) => {
                warn!(
                    event_type = %event_type,
                    event_id = %envelope.event_id(),
                    destination = %entity,
                    %error,
                    "publish failed"
                );
                span.set_status(SpanStatus::Error(error.to_string()));
            }
        }
        span.end();
        result
    }

    /// Publishes, retrying `Unreachable` and `Throttled` failures with
    /// exponential backoff. `Serialization` failures are returned at once.
    pub async fn publish_with_retry(
        &self,
        envelope: &EventEnvelope,
        entity: &DestinationName,
        retry: &RetryConfig,
    ) -> PublishResult<PublishAck> {
        let mut attempt = 1;
        loop {
            match self.publish(envelope, entity).await {
                Err(error) if error.is_transient() && attempt < retry.max_attempts => {
                    let delay = match &error {
                        PublishError::Throttled {
                            retry_after: Some(after),
                        } => (*after).min(retry.max_delay),
                        _ => retry.jittered_delay(attempt),
                    };
                    warn!(attempt, ?delay, %error, "retrying publish");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Starts a consumer loop for `destination`.
    ///
    /// Up to `settings.max_in_flight` messages are dispatched concurrently;
    /// the loop stops pulling while that many are in flight. Cancelling
    /// `shutdown` (or the returned handle) stops intake, gives in-flight
    /// handlers `settings.shutdown_grace` to finish and abandons the rest,
    /// leaving them to the broker for redelivery.
    pub fn subscribe(
        &self,
        destination: Destination,
        dispatcher: EventDispatcher,
        settings: &ConsumerSettings,
        shutdown: &CancellationToken,
    ) -> SubscriptionHandle {
        let token = shutdown.child_token();
        let consumer = Arc::new(Consumer {
            transport: Arc::clone(&self.transport),
            destination: destination.clone(),
            dispatcher,
            attempts: Arc::clone(&self.attempts),
            limit: Arc::new(Semaphore::new(usize::from(settings.max_in_flight))),
            grace: settings.shutdown_grace,
        });
        let task = tokio::spawn(consumer.run(token.clone()));
        SubscriptionHandle {
            destination,
            token,
            task,
        }
    }
}

impl std::fmt::Debug for BrokerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerAdapter")
            .field("transport", &self.transport.name())
            .field("tracer", &self.tracer)
            .finish_non_exhaustive()
    }
}

struct Consumer {
    transport: Arc<dyn Transport>,
    destination: Destination,
    dispatcher: EventDispatcher,
    attempts: Arc<AttemptTracker>,
    limit: Arc<Semaphore>,
    grace: Duration,
}

impl Consumer {
    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(destination = %self.destination, transport = self.transport.name(), "subscription started");
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                () = token.cancelled() => break,
                permit = Arc::clone(&self.limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let received = tokio::select! {
                () = token.cancelled() => break,
                received = self.transport.receive(&self.destination) => received,
            };

            match received {
                Ok(message) => {
                    let consumer = Arc::clone(&self);
                    in_flight.spawn(async move {
                        consumer.deliver(message).await;
                        drop(permit);
                    });
                }
                Err(TransportError::Closed) => {
                    info!(destination = %self.destination, "transport closed");
                    break;
                }
                Err(error) => {
                    warn!(destination = %self.destination, %error, "receive failed");
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }

            while let Some(finished) = in_flight.try_join_next() {
                if let Err(error) = finished {
                    warn!(destination = %self.destination, %error, "delivery task failed");
                }
            }
        }

        self.drain(in_flight).await;
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        let pending = in_flight.len();
        if pending > 0 {
            debug!(destination = %self.destination, pending, "waiting for in-flight deliveries");
        }
        let drained = tokio::time::timeout(self.grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                destination = %self.destination,
                abandoned = in_flight.len(),
                grace = ?self.grace,
                "grace period elapsed; unsettled messages are left for redelivery"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
        info!(destination = %self.destination, "subscription closed");
    }

    async fn deliver(&self, message: InboundMessage) {
        let attempt = message
            .delivery_count
            .unwrap_or_else(|| self.attempts.next(&self.destination, &message.message_id));
        let context = DispatchContext::new(self.destination.to_string(), message.message_id.clone())
            .with_attempt(attempt)
            .with_correlation(CorrelationContext::extract(&message.headers));

        let outcome = self.dispatcher.dispatch(&message.body, &context).await;
        if outcome.is_terminal() {
            self.attempts.clear(&self.destination, &message.message_id);
        }

        let settlement = Settlement::from(&outcome);
        if let Err(error) = self
            .transport
            .settle(&self.destination, message.lease, settlement)
            .await
        {
            warn!(
                destination = %self.destination,
                message_id = %message.message_id,
                %outcome,
                %error,
                "settlement failed; the broker will redeliver"
            );
        }
    }
}

/// A running consumer loop.
#[derive(Debug)]
pub struct SubscriptionHandle {
    destination: Destination,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Destination being consumed.
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Stops intake. In-flight deliveries keep their grace period.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit.
    pub async fn closed(self) {
        if let Err(error) = self.task.await {
            warn!(destination = %self.destination, %error, "subscription task failed");
        }
    }

    /// Cancels and waits for the drain to finish.
    pub async fn shutdown(self) {
        self.cancel();
        self.closed().await;
    }
}
