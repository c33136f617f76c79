//! Integration tests for the product service example
//!
//! These tests run the service against the in-memory broker with
//! configuration supplied from a map instead of the environment.

use std::sync::Arc;
use std::time::Duration;

use eventrelay::config::MapSource;
use eventrelay::telemetry::{InMemoryExporter, ResourceDescriptor, TelemetryPipeline};
use eventrelay::{BrokerAdapter, BusSettings, ConfigurationError, PropagationStyle, Transport};
use eventrelay_examples::product_service::{self, catalog::Catalog};

fn rabbit_settings(destinations: &str) -> BusSettings {
    let source = MapSource::from_iter([
        ("EVENTBUS_RABBITMQ_HOST", "localhost"),
        ("EVENTBUS_RABBITMQ_USERNAME", "guest"),
        ("EVENTBUS_RABBITMQ_PASSWORD", "guest"),
        ("EVENTBUS_DESTINATIONS", destinations),
    ]);
    BusSettings::load(&source).expect("valid settings")
}

fn pipeline(memory: &InMemoryExporter) -> TelemetryPipeline {
    TelemetryPipeline::builder(ResourceDescriptor::new("product-service", "test", "0").shared())
        .with_span_exporter(Arc::new(memory.clone()))
        .with_metric_exporter(Arc::new(memory.clone()))
        .with_log_exporter(Arc::new(memory.clone()))
        .build()
}

#[tokio::test]
async fn sample_event_reaches_the_catalog() {
    // Given: a service configured with one queue
    let settings = rabbit_settings("products");
    let memory = InMemoryExporter::new();
    let pipeline = pipeline(&memory);
    let catalog = Catalog::new();

    // When: the service runs without being stopped
    tokio::time::timeout(
        Duration::from_secs(5),
        product_service::run(
            &settings,
            product_service::broker_for(&settings),
            &pipeline,
            Arc::clone(&catalog),
            std::future::pending(),
        ),
    )
    .await
    .expect("service did not finish")
    .expect("service failed");
    pipeline.shutdown().await;

    // Then: the sample product is in the catalog and both spans were exported
    let products = catalog.products();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].name.as_ref(), "Widget");
    assert_eq!(memory.spans_named("publish ProductCreated").len(), 1);
    assert_eq!(memory.spans_named("process ProductCreated").len(), 1);
}

#[tokio::test]
async fn publish_failure_stops_the_service_with_an_error() {
    // Given: a topic subscription on a broker that refuses every publish attempt
    let settings = rabbit_settings("product-events/catalog");
    let broker = product_service::broker_for(&settings);
    for _ in 0..3 {
        broker.fail_next_send(eventrelay::PublishError::Unreachable("down".into()));
    }
    let memory = InMemoryExporter::new();
    let catalog = Catalog::new();

    // When: the service starts
    let result = product_service::run(
        &settings,
        broker,
        &pipeline(&memory),
        Arc::clone(&catalog),
        async {},
    )
    .await;

    // Then: it reports the publish failure and the catalog stays empty
    assert!(result.is_err());
    assert!(catalog.products().is_empty());
}

#[tokio::test(start_paused = true)]
async fn abandoned_delivery_returns_once_its_lease_expires() {
    // Given: the service's broker with one message leased and never settled
    let settings = rabbit_settings("products");
    let broker = product_service::broker_for(&settings);
    let products = &settings.destinations[0];
    broker.declare(products);
    let envelope = product_service::sample_event().to_envelope().unwrap();
    BrokerAdapter::new(Arc::new(broker.clone()))
        .publish(&envelope, products.entity())
        .await
        .unwrap();
    let abandoned = broker.receive(products).await.unwrap();
    assert_eq!(broker.depth(products), 0);

    // When: the handler budget and the shutdown grace period have both passed
    let lease = settings.consumer.handler_timeout + settings.consumer.shutdown_grace;
    tokio::time::advance(lease + Duration::from_secs(1)).await;

    // Then: the broker hands the same message out again
    let again = broker.receive(products).await.unwrap();
    assert_eq!(again.message_id, abandoned.message_id);
}

#[test]
fn service_bus_provider_uses_diagnostic_id_headers() {
    let source = MapSource::from_iter([
        ("EVENTBUS_PROVIDER", "AzureServiceBus"),
        (
            "EVENTBUS_SERVICEBUS_CONNECTION_STRING",
            "Endpoint=sb://example.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=v",
        ),
        ("EVENTBUS_DESTINATIONS", "products"),
    ]);
    let settings = BusSettings::load(&source).unwrap();

    assert_eq!(
        product_service::broker_for(&settings).propagation_style(),
        PropagationStyle::DiagnosticId
    );
}

#[test]
fn missing_connection_settings_fail_fast() {
    let source = MapSource::from_iter([("EVENTBUS_DESTINATIONS", "products")]);

    assert!(matches!(
        BusSettings::load(&source),
        Err(ConfigurationError::MissingField { key }) if key == "EVENTBUS_RABBITMQ_HOST"
    ));
}
