//! End-to-end delivery tests over the in-memory broker.
//!
//! Each test publishes through a [`BrokerAdapter`], consumes through a
//! subscription and checks how the broker ended up settling the message.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventrelay::broker::Transport;
use eventrelay::{
    handler_fn, BrokerAdapter, ConsumerRegistry, ConsumerSettings, CorrelationContext,
    Destination, DestinationName, EventDispatcher, EventEnvelope, EventId, EventType,
    HandlerError, HandlerResult, MaxDeliveryAttempts, MaxInFlight, OutboundMessage,
    RegistrationError, RetryPolicy, SubscriptionHandle,
};
use eventrelay_memory::{BrokerOptions, InMemoryBroker};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

fn products() -> Destination {
    "products".parse().unwrap()
}

fn product_created() -> EventType {
    EventType::try_new("ProductCreated").unwrap()
}

fn widget() -> EventEnvelope {
    EventEnvelope::new(
        product_created(),
        json!({"name": "Widget", "price": 9.99, "stock": 5}),
    )
}

fn entity() -> DestinationName {
    DestinationName::try_new("products").unwrap()
}

/// Polls `condition` until it holds, failing the test after five seconds.
async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

struct Harness {
    broker: InMemoryBroker,
    adapter: BrokerAdapter,
    registry: Arc<ConsumerRegistry>,
    shutdown: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        Self::with_broker(InMemoryBroker::new())
    }

    fn with_broker(broker: InMemoryBroker) -> Self {
        broker.declare(&products());
        Self {
            adapter: BrokerAdapter::new(Arc::new(broker.clone())),
            broker,
            registry: Arc::new(ConsumerRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn subscribe(&self, settings: &ConsumerSettings) -> SubscriptionHandle {
        self.adapter.subscribe(
            products(),
            EventDispatcher::new(Arc::clone(&self.registry)),
            settings,
            &self.shutdown,
        )
    }

    fn settled(&self) -> bool {
        self.broker.depth(&products()) == 0 && self.broker.in_flight(&products()) == 0
    }
}

fn recording(seen: &Arc<Mutex<Vec<EventId>>>) -> impl eventrelay::EventHandler {
    let seen = Arc::clone(seen);
    handler_fn(move |envelope: EventEnvelope| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(envelope.event_id());
            Ok(())
        }
    })
}

async fn faulty(_envelope: EventEnvelope) -> HandlerResult {
    Err(HandlerError::fault("inventory service unavailable"))
}

#[tokio::test]
async fn published_event_is_handled_and_completed() {
    // Given: a consumer for ProductCreated
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    harness
        .registry
        .register(product_created(), recording(&seen), RetryPolicy::default())
        .unwrap();
    let subscription = harness.subscribe(&ConsumerSettings::default());

    // When: an envelope is published
    let envelope = widget();
    harness.adapter.publish(&envelope, &entity()).await.unwrap();

    // Then: the handler sees it once and the broker has nothing left
    eventually(|| seen.lock().len() == 1).await;
    eventually(|| harness.settled()).await;
    assert_eq!(seen.lock()[0], envelope.event_id());
    assert!(harness.broker.dead_letters(&products()).is_empty());

    subscription.shutdown().await;
}

#[tokio::test]
async fn event_without_a_consumer_is_dead_lettered() {
    // Given: consumers for ProductCreated only
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    harness
        .registry
        .register(product_created(), recording(&seen), RetryPolicy::default())
        .unwrap();
    let subscription = harness.subscribe(&ConsumerSettings::default());

    // When: an OrderPlaced envelope arrives
    let order = EventEnvelope::new(EventType::try_new("OrderPlaced").unwrap(), json!({"id": 7}));
    harness.adapter.publish(&order, &entity()).await.unwrap();

    // Then: it is dead-lettered unchanged with reason NoHandler
    eventually(|| harness.broker.dead_letters(&products()).len() == 1).await;
    let dead = harness.broker.dead_letters(&products()).remove(0);
    assert_eq!(dead.reason, "NoHandler");
    assert_eq!(
        EventEnvelope::from_bytes(&dead.body).unwrap().event_id(),
        order.event_id()
    );
    assert!(seen.lock().is_empty());

    subscription.shutdown().await;
}

#[tokio::test]
async fn malformed_body_is_dead_lettered_as_serialization() {
    // Given: a running subscription
    let harness = Harness::new();
    let subscription = harness.subscribe(&ConsumerSettings::default());

    // When: a body that is not an envelope is sent straight to the broker
    harness
        .broker
        .send(
            &entity(),
            OutboundMessage {
                message_id: "garbage-1".into(),
                body: b"not json".to_vec(),
                headers: eventrelay::MessageHeaders::new(),
                content_type: "text/plain".into(),
            },
        )
        .await
        .unwrap();

    // Then: it is dead-lettered with reason Serialization
    eventually(|| harness.broker.dead_letters(&products()).len() == 1).await;
    let dead = harness.broker.dead_letters(&products()).remove(0);
    assert_eq!(dead.reason, "Serialization");
    assert_eq!(dead.body, b"not json");

    subscription.shutdown().await;
}

async fn assert_retry_bound(broker: InMemoryBroker) {
    // Given: a handler that always faults, allowed three attempts
    let harness = Harness::with_broker(broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    harness
        .registry
        .register(
            product_created(),
            handler_fn(move |envelope: EventEnvelope| {
                counter.fetch_add(1, Ordering::SeqCst);
                faulty(envelope)
            }),
            RetryPolicy::default().with_max_attempts(MaxDeliveryAttempts::try_new(3).unwrap()),
        )
        .unwrap();
    let subscription = harness.subscribe(&ConsumerSettings::default());

    // When: one envelope is published
    harness.adapter.publish(&widget(), &entity()).await.unwrap();

    // Then: the handler runs exactly three times before dead-lettering
    eventually(|| harness.broker.dead_letters(&products()).len() == 1).await;
    let dead = harness.broker.dead_letters(&products()).remove(0);
    assert_eq!(dead.reason, "MaxRetriesExceeded");
    assert_eq!(dead.delivery_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    subscription.shutdown().await;
}

#[tokio::test]
async fn faulting_handler_is_invoked_exactly_max_attempts_times() {
    assert_retry_bound(InMemoryBroker::new()).await;
}

#[tokio::test]
async fn retry_bound_holds_without_a_native_delivery_count() {
    assert_retry_bound(InMemoryBroker::with_options(BrokerOptions {
        delivery_count: false,
        ..BrokerOptions::default()
    }))
    .await;
}

#[tokio::test]
async fn duplicate_publishes_reach_the_handler_with_the_same_event_id() {
    // Given: a recording consumer
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    harness
        .registry
        .register(product_created(), recording(&seen), RetryPolicy::default())
        .unwrap();
    let subscription = harness.subscribe(&ConsumerSettings::default());

    // When: the same envelope is published twice
    let envelope = widget();
    harness.adapter.publish(&envelope, &entity()).await.unwrap();
    harness.adapter.publish(&envelope, &entity()).await.unwrap();

    // Then: both deliveries carry the same id, for the handler to deduplicate
    eventually(|| seen.lock().len() == 2).await;
    assert!(seen.lock().iter().all(|id| *id == envelope.event_id()));

    subscription.shutdown().await;
}

#[tokio::test]
async fn duplicate_publishes_each_get_the_full_attempt_budget() {
    // Given: a broker without a native delivery count and an always-faulting handler
    let harness = Harness::with_broker(InMemoryBroker::with_options(BrokerOptions {
        delivery_count: false,
        ..BrokerOptions::default()
    }));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    harness
        .registry
        .register(
            product_created(),
            handler_fn(move |envelope: EventEnvelope| {
                counter.fetch_add(1, Ordering::SeqCst);
                faulty(envelope)
            }),
            RetryPolicy::default().with_max_attempts(MaxDeliveryAttempts::try_new(3).unwrap()),
        )
        .unwrap();
    let subscription = harness.subscribe(&ConsumerSettings::default());

    // When: the same envelope is published twice
    let envelope = widget();
    let first = harness.adapter.publish(&envelope, &entity()).await.unwrap();
    let second = harness.adapter.publish(&envelope, &entity()).await.unwrap();

    // Then: each copy is dead-lettered after exactly three attempts of its own
    eventually(|| harness.broker.dead_letters(&products()).len() == 2).await;
    assert_ne!(first.message_id, second.message_id);
    let dead = harness.broker.dead_letters(&products());
    assert!(dead.iter().all(|letter| letter.delivery_count == 3));
    assert!(dead.iter().all(|letter| letter.reason == "MaxRetriesExceeded"));
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    subscription.shutdown().await;
}

#[tokio::test]
async fn in_flight_limit_stops_intake() {
    // Given: handlers that block until released, at most two in flight
    let harness = Harness::new();
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    {
        let gate = Arc::clone(&gate);
        let started = Arc::clone(&started);
        harness
            .registry
            .register(
                product_created(),
                handler_fn(move |_envelope: EventEnvelope| {
                    let gate = Arc::clone(&gate);
                    started.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let _permit = gate
                            .acquire()
                            .await
                            .map_err(|e| HandlerError::fault(e.to_string()))?;
                        Ok(())
                    }
                }),
                RetryPolicy::default(),
            )
            .unwrap();
    }
    let settings = ConsumerSettings {
        max_in_flight: MaxInFlight::try_new(2).unwrap(),
        ..ConsumerSettings::default()
    };
    let subscription = harness.subscribe(&settings);

    // When: five envelopes are published
    for _ in 0..5 {
        harness.adapter.publish(&widget(), &entity()).await.unwrap();
    }

    // Then: only two are pulled until handlers finish
    eventually(|| started.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(harness.broker.in_flight(&products()), 2);
    assert_eq!(harness.broker.depth(&products()), 3);

    gate.add_permits(5);
    eventually(|| harness.settled()).await;
    assert_eq!(started.load(Ordering::SeqCst), 5);

    subscription.shutdown().await;
}

#[tokio::test]
async fn shutdown_leaves_stalled_messages_unsettled_after_the_grace_period() {
    // Given: a handler that never finishes and a short grace period
    let harness = Harness::new();
    let started = Arc::new(AtomicUsize::new(0));
    {
        let started = Arc::clone(&started);
        harness
            .registry
            .register(
                product_created(),
                handler_fn(move |_envelope: EventEnvelope| {
                    started.fetch_add(1, Ordering::SeqCst);
                    std::future::pending::<HandlerResult>()
                }),
                RetryPolicy::default(),
            )
            .unwrap();
    }
    let settings = ConsumerSettings {
        shutdown_grace: Duration::from_millis(100),
        ..ConsumerSettings::default()
    };
    let subscription = harness.subscribe(&settings);
    harness.adapter.publish(&widget(), &entity()).await.unwrap();
    eventually(|| started.load(Ordering::SeqCst) == 1).await;

    // When: the application shuts down
    harness.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), subscription.closed())
        .await
        .expect("subscription did not stop after the grace period");

    // Then: the message is neither completed nor dead-lettered
    assert_eq!(harness.broker.in_flight(&products()), 1);
    assert!(harness.broker.dead_letters(&products()).is_empty());
}

#[tokio::test]
async fn closing_the_transport_ends_the_subscription() {
    let harness = Harness::new();
    let subscription = harness.subscribe(&ConsumerSettings::default());

    harness.broker.close();

    tokio::time::timeout(Duration::from_secs(2), subscription.closed())
        .await
        .expect("subscription kept running on a closed transport");
}

#[tokio::test]
async fn registration_is_closed_once_consuming_starts() {
    let harness = Harness::new();
    let subscription = harness.subscribe(&ConsumerSettings::default());

    let late = harness.registry.register(
        product_created(),
        handler_fn(faulty),
        RetryPolicy::default(),
    );

    assert_eq!(late, Err(RegistrationError::RegistrationClosed));
    subscription.shutdown().await;
}

#[tokio::test]
async fn correlation_is_ambient_inside_the_handler() {
    // Given: a handler that captures the ambient correlation context
    let harness = Harness::new();
    let captured = Arc::new(Mutex::new(None));
    {
        let captured = Arc::clone(&captured);
        harness
            .registry
            .register(
                product_created(),
                handler_fn(move |_envelope: EventEnvelope| {
                    *captured.lock() = CorrelationContext::current();
                    async { Ok(()) }
                }),
                RetryPolicy::default(),
            )
            .unwrap();
    }
    let subscription = harness.subscribe(&ConsumerSettings::default());

    // When: an envelope is published inside an upstream trace
    let upstream = CorrelationContext::new_root(true);
    harness
        .adapter
        .publish(&widget().with_correlation(upstream.clone()), &entity())
        .await
        .unwrap();

    // Then: the handler runs inside that trace
    eventually(|| captured.lock().is_some()).await;
    let inside = captured.lock().clone().unwrap();
    assert_eq!(inside.trace_id(), upstream.trace_id());

    subscription.shutdown().await;
}
