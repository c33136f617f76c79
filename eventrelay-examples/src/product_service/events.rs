//! Events published by the product service.

use eventrelay::{EventEnvelope, EventType};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::types::{InvalidProduct, Product, ProductName};

/// Wire name of [`ProductCreated`].
pub const PRODUCT_CREATED: &str = "ProductCreated";

/// A product was added to the catalog upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    /// Display name
    pub name: String,
    /// Unit price, a JSON number on the wire
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Units in stock
    pub stock: u32,
}

impl ProductCreated {
    /// The event type envelopes of this event carry.
    pub fn event_type() -> EventType {
        EventType::try_new(PRODUCT_CREATED).expect("ProductCreated is a valid event type")
    }

    /// Wraps the event in an envelope.
    pub fn to_envelope(&self) -> eventrelay::errors::EnvelopeResult<EventEnvelope> {
        EventEnvelope::from_payload(Self::event_type(), self)
    }
}

impl TryFrom<ProductCreated> for Product {
    type Error = InvalidProduct;

    fn try_from(event: ProductCreated) -> Result<Self, Self::Error> {
        let name =
            ProductName::try_new(event.name).map_err(|e| InvalidProduct::Name(e.to_string()))?;
        if event.price.is_sign_negative() {
            return Err(InvalidProduct::NegativePrice(event.price));
        }
        Ok(Self {
            name,
            price: event.price,
            stock: event.stock,
        })
    }
}
