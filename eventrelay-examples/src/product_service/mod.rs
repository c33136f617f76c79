//! A product service that consumes `ProductCreated` events into a catalog.
//!
//! The service subscribes every configured destination on an in-memory
//! broker standing in for the configured provider, publishes one sample
//! event and runs until that event has been processed or it is told to stop.

use std::future::Future;
use std::sync::Arc;

use eventrelay::telemetry::TelemetryPipeline;
use eventrelay::{
    BrokerAdapter, BusSettings, ConsumerRegistry, EventDispatcher, RetryConfig, RetryPolicy,
};
use eventrelay_memory::{BrokerOptions, InMemoryBroker};
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod catalog;
pub mod events;
pub mod types;

use catalog::Catalog;
use events::ProductCreated;

/// Service name reported when configuration does not supply one.
pub const SERVICE_NAME: &str = "product-service";

/// The event published once at startup.
pub fn sample_event() -> ProductCreated {
    ProductCreated {
        name: "Widget".to_string(),
        price: dec!(9.99),
        stock: 5,
    }
}

/// In-memory broker matching the configured provider's header conventions.
///
/// Leases outlive a handler's budget plus the shutdown grace period, so a
/// delivery aborted at shutdown returns to the queue.
pub fn broker_for(settings: &BusSettings) -> InMemoryBroker {
    InMemoryBroker::with_options(BrokerOptions {
        propagation_style: settings.provider().propagation_style(),
        lease_timeout: Some(settings.consumer.handler_timeout + settings.consumer.shutdown_grace),
        ..BrokerOptions::default()
    })
}

/// Runs the service until the sample event reaches the catalog or `stop`
/// resolves, then drains every subscription.
pub async fn run(
    settings: &BusSettings,
    broker: InMemoryBroker,
    pipeline: &TelemetryPipeline,
    catalog: Arc<Catalog>,
    stop: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    info!(
        provider = %settings.provider(),
        destinations = settings.destinations.len(),
        "starting product service on the in-memory broker"
    );

    let registry = Arc::new(ConsumerRegistry::new());
    registry.register_named(
        ProductCreated::event_type(),
        "catalog",
        catalog.handler(),
        RetryPolicy::from(&settings.consumer),
    )?;

    let adapter = BrokerAdapter::new(Arc::new(broker.clone())).with_telemetry(pipeline);
    let dispatcher = EventDispatcher::new(registry).with_telemetry(pipeline);
    let shutdown = CancellationToken::new();
    let subscriptions: Vec<_> = settings
        .destinations
        .iter()
        .map(|destination| {
            broker.declare(destination);
            adapter.subscribe(
                destination.clone(),
                dispatcher.clone(),
                &settings.consumer,
                &shutdown,
            )
        })
        .collect();

    let published = publish_sample(&adapter, settings).await;
    if published.is_ok() {
        tokio::select! {
            () = catalog.wait_for(1) => info!("sample event processed"),
            () = stop => info!("stop requested"),
        }
    }

    shutdown.cancel();
    for subscription in subscriptions {
        subscription.closed().await;
    }
    published?;
    info!(products = catalog.products().len(), "product service stopped");
    Ok(())
}

async fn publish_sample(adapter: &BrokerAdapter, settings: &BusSettings) -> anyhow::Result<()> {
    let Some(first) = settings.destinations.first() else {
        return Ok(());
    };
    let envelope = sample_event().to_envelope()?;
    let ack = adapter
        .publish_with_retry(&envelope, first.entity(), &RetryConfig::default())
        .await?;
    info!(message_id = %ack.message_id, destination = %first, "sample event published");
    Ok(())
}
