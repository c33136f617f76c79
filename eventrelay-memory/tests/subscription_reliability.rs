//! Reliability tests for consuming from the in-memory broker through the adapter.
//!
//! These tests target broker behaviour the adapter depends on: competing
//! consumers, per-subscription fan-out and redelivery of expired leases.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventrelay::{
    handler_fn, BrokerAdapter, ConsumerRegistry, ConsumerSettings, Destination, DestinationName,
    EventDispatcher, EventEnvelope, EventId, EventType, RetryPolicy,
};
use eventrelay_memory::{BrokerOptions, InMemoryBroker};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn product_created() -> EventType {
    EventType::try_new("ProductCreated").unwrap()
}

fn envelope(sku: u32) -> EventEnvelope {
    EventEnvelope::new(product_created(), json!({ "sku": sku }))
}

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

fn recording_registry(seen: &Arc<Mutex<Vec<EventId>>>) -> Arc<ConsumerRegistry> {
    let registry = Arc::new(ConsumerRegistry::new());
    let seen = Arc::clone(seen);
    registry
        .register(
            product_created(),
            handler_fn(move |envelope: EventEnvelope| {
                seen.lock().push(envelope.event_id());
                async { Ok(()) }
            }),
            RetryPolicy::default(),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn competing_consumers_share_a_queue_without_duplicates() {
    let broker = InMemoryBroker::new();
    let queue: Destination = "products".parse().unwrap();
    broker.declare(&queue);
    let adapter = BrokerAdapter::new(Arc::new(broker.clone()));
    let shutdown = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = recording_registry(&seen);

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            adapter.subscribe(
                queue.clone(),
                EventDispatcher::new(Arc::clone(&registry)),
                &ConsumerSettings::default(),
                &shutdown,
            )
        })
        .collect();

    let entity = DestinationName::try_new("products").unwrap();
    for sku in 0..50 {
        adapter.publish(&envelope(sku), &entity).await.unwrap();
    }

    wait_for(|| seen.lock().len() == 50).await;
    let unique: HashSet<EventId> = seen.lock().iter().copied().collect();
    assert_eq!(unique.len(), 50);

    shutdown.cancel();
    for consumer in consumers {
        consumer.closed().await;
    }
}

#[tokio::test]
async fn every_topic_subscription_receives_each_event() {
    let broker = InMemoryBroker::new();
    let inventory: Destination = "product-events/inventory".parse().unwrap();
    let search: Destination = "product-events/search".parse().unwrap();
    broker.declare(&inventory);
    broker.declare(&search);
    let adapter = BrokerAdapter::new(Arc::new(broker.clone()));
    let shutdown = CancellationToken::new();
    let inventory_seen = Arc::new(Mutex::new(Vec::new()));
    let search_seen = Arc::new(Mutex::new(Vec::new()));

    let subscriptions = [
        adapter.subscribe(
            inventory,
            EventDispatcher::new(recording_registry(&inventory_seen)),
            &ConsumerSettings::default(),
            &shutdown,
        ),
        adapter.subscribe(
            search,
            EventDispatcher::new(recording_registry(&search_seen)),
            &ConsumerSettings::default(),
            &shutdown,
        ),
    ];

    let published = envelope(1);
    adapter
        .publish(&published, &DestinationName::try_new("product-events").unwrap())
        .await
        .unwrap();

    wait_for(|| inventory_seen.lock().len() == 1 && search_seen.lock().len() == 1).await;
    assert_eq!(inventory_seen.lock()[0], published.event_id());
    assert_eq!(search_seen.lock()[0], published.event_id());

    shutdown.cancel();
    for subscription in subscriptions {
        subscription.closed().await;
    }
}

#[tokio::test]
async fn messages_abandoned_by_a_stopped_consumer_are_redelivered() {
    let broker = InMemoryBroker::with_options(BrokerOptions {
        lease_timeout: Some(Duration::from_millis(200)),
        ..BrokerOptions::default()
    });
    let queue: Destination = "products".parse().unwrap();
    broker.declare(&queue);
    let adapter = BrokerAdapter::new(Arc::new(broker.clone()));
    let entity = DestinationName::try_new("products").unwrap();

    // A consumer whose handler never returns, stopped with a short grace period.
    let stalled = Arc::new(AtomicUsize::new(0));
    let stalled_registry = Arc::new(ConsumerRegistry::new());
    {
        let stalled = Arc::clone(&stalled);
        stalled_registry
            .register(
                product_created(),
                handler_fn(move |_envelope: EventEnvelope| {
                    stalled.fetch_add(1, Ordering::SeqCst);
                    std::future::pending::<eventrelay::HandlerResult>()
                }),
                RetryPolicy::default(),
            )
            .unwrap();
    }
    let first = adapter.subscribe(
        queue.clone(),
        EventDispatcher::new(stalled_registry),
        &ConsumerSettings {
            shutdown_grace: Duration::from_millis(10),
            ..ConsumerSettings::default()
        },
        &CancellationToken::new(),
    );
    adapter.publish(&envelope(1), &entity).await.unwrap();
    wait_for(|| stalled.load(Ordering::SeqCst) == 1).await;
    first.shutdown().await;

    // A healthy consumer picks the message up once the lease expires.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let second = adapter.subscribe(
        queue.clone(),
        EventDispatcher::new(recording_registry(&seen)),
        &ConsumerSettings::default(),
        &CancellationToken::new(),
    );

    wait_for(|| seen.lock().len() == 1).await;
    wait_for(|| broker.in_flight(&queue) == 0).await;
    second.shutdown().await;
}
