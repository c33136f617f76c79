//! Read-side catalog fed by `ProductCreated` events.

use std::collections::HashSet;
use std::sync::Arc;

use eventrelay::registry::{handler_fn, EventHandler};
use eventrelay::{EventEnvelope, EventId, HandlerError, HandlerResult};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::events::ProductCreated;
use super::types::Product;

/// Products seen so far, in arrival order.
///
/// Delivery is at-least-once, so the catalog remembers which envelopes it
/// has applied and skips redeliveries.
#[derive(Debug, Default)]
pub struct Catalog {
    products: Mutex<Vec<Product>>,
    applied: Mutex<HashSet<EventId>>,
    added: Notify,
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the catalog.
    pub fn products(&self) -> Vec<Product> {
        self.products.lock().clone()
    }

    /// Waits until the catalog holds at least `count` products.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let added = self.added.notified();
            tokio::pin!(added);
            added.as_mut().enable();
            if self.products.lock().len() >= count {
                return;
            }
            added.await;
        }
    }

    /// Applies one envelope. Invalid products are rejected, never retried.
    pub fn apply(&self, envelope: &EventEnvelope) -> HandlerResult {
        let event_id = envelope.event_id();
        if !self.applied.lock().insert(event_id) {
            debug!(%event_id, "duplicate delivery skipped");
            return Ok(());
        }
        let product = match product_from(envelope) {
            Ok(product) => product,
            Err(error) => {
                self.applied.lock().remove(&event_id);
                return Err(error);
            }
        };
        info!(
            name = %product.name,
            price = %product.price,
            stock = product.stock,
            "product added to catalog"
        );
        self.products.lock().push(product);
        self.added.notify_waiters();
        Ok(())
    }

    /// Handler that feeds this catalog.
    pub fn handler(self: &Arc<Self>) -> impl EventHandler {
        let catalog = Arc::clone(self);
        handler_fn(move |envelope: EventEnvelope| {
            let outcome = catalog.apply(&envelope);
            async move { outcome }
        })
    }
}

fn product_from(envelope: &EventEnvelope) -> Result<Product, HandlerError> {
    let event: ProductCreated = envelope.payload_as()?;
    Product::try_from(event).map_err(|e| HandlerError::rejected(e.to_string()))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn widget() -> ProductCreated {
        ProductCreated {
            name: "Widget".into(),
            price: dec!(9.99),
            stock: 5,
        }
    }

    #[tokio::test]
    async fn handler_maps_the_payload_into_the_catalog() {
        let catalog = Catalog::new();
        let envelope = widget().to_envelope().unwrap();

        catalog.handler().handle(&envelope).await.unwrap();

        let products = catalog.products();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].name.as_ref(), "Widget");
        assert_eq!(products[0].stock, 5);
    }

    #[tokio::test]
    async fn invalid_product_is_rejected() {
        let catalog = Catalog::new();
        let envelope = ProductCreated {
            price: dec!(-3),
            ..widget()
        }
        .to_envelope()
        .unwrap();

        let result = catalog.handler().handle(&envelope).await;

        assert!(matches!(result, Err(HandlerError::Rejected(_))));
        assert!(catalog.products().is_empty());
    }

    #[tokio::test]
    async fn payload_price_is_a_json_number() {
        let envelope = widget().to_envelope().unwrap();

        assert_eq!(envelope.payload()["price"], serde_json::json!(9.99));
        assert_eq!(
            EventEnvelope::from_bytes(&envelope.to_bytes().unwrap())
                .unwrap()
                .payload_as::<ProductCreated>()
                .unwrap(),
            widget()
        );
    }

    #[tokio::test]
    async fn redelivered_envelope_is_applied_once() {
        let catalog = Catalog::new();
        let handler = catalog.handler();
        let envelope = widget().to_envelope().unwrap();

        handler.handle(&envelope).await.unwrap();
        handler.handle(&envelope).await.unwrap();

        assert_eq!(catalog.products().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redeliveries_are_applied_once() {
        let catalog = Catalog::new();
        let envelope = widget().to_envelope().unwrap();
        let start = Arc::new(tokio::sync::Barrier::new(8));

        let deliveries: Vec<_> = (0..8)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                let envelope = envelope.clone();
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    catalog.apply(&envelope)
                })
            })
            .collect();
        for delivery in deliveries {
            delivery.await.unwrap().unwrap();
        }

        assert_eq!(catalog.products().len(), 1);
    }

    #[tokio::test]
    async fn rejected_envelope_is_not_remembered_as_applied() {
        let catalog = Catalog::new();
        let malformed = EventEnvelope::new(ProductCreated::event_type(), serde_json::json!({"name": 7}));

        assert!(catalog.apply(&malformed).is_err());

        assert!(!catalog.applied.lock().contains(&malformed.event_id()));
        assert!(catalog.products().is_empty());
    }

    #[tokio::test]
    async fn waiting_returns_once_the_product_arrives() {
        let catalog = Catalog::new();
        let waiting = {
            let catalog = Arc::clone(&catalog);
            tokio::spawn(async move { catalog.wait_for(1).await })
        };

        catalog.apply(&widget().to_envelope().unwrap()).unwrap();

        waiting.await.unwrap();
    }
}
