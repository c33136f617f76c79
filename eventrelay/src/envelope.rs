//! The event envelope: the unit every transport carries.
//!
//! On the wire an envelope is a JSON object:
//!
//! ```json
//! {
//!   "eventType": "ProductCreated",
//!   "eventId": "01890a5d-ac96-774b-bcce-b302099a8057",
//!   "createdAt": "2024-05-01T09:30:00.123456789Z",
//!   "payload": { "name": "Widget", "price": 9.99, "stock": 5 }
//! }
//! ```
//!
//! The correlation context is deliberately absent from the body; transports
//! carry it in their native headers (see [`crate::correlation`]).
//!
//! `eventId` and `createdAt` are assigned once when the envelope is created.
//! There are no setters, so every downstream handler sees the values the
//! producer assigned.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation::CorrelationContext;
use crate::errors::{EnvelopeError, EnvelopeResult};
use crate::types::{EventId, EventType, Timestamp};

/// MIME type of the serialized envelope.
pub const CONTENT_TYPE: &str = "application/json";

/// Payload plus identity plus correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_type: EventType,
    event_id: EventId,
    created_at: Timestamp,
    payload: Value,
    #[serde(skip)]
    correlation: Option<CorrelationContext>,
}

impl EventEnvelope {
    /// Creates an envelope around an already-structured payload.
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            event_id: EventId::new(),
            created_at: Timestamp::now(),
            payload,
            correlation: None,
        }
    }

    /// Creates an envelope from a serializable domain value.
    pub fn from_payload<T>(event_type: EventType, payload: &T) -> EnvelopeResult<Self>
    where
        T: Serialize,
    {
        let payload = serde_json::to_value(payload)
            .map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
        Ok(Self::new(event_type, payload))
    }

    /// Attaches the correlation context this envelope travels under.
    #[must_use]
    pub fn with_correlation(mut self, correlation: CorrelationContext) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// Routing key for consumers.
    pub const fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Identity used by consumers to detect redeliveries.
    pub const fn event_id(&self) -> EventId {
        self.event_id
    }

    /// When the producer created the envelope.
    pub const fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Raw structured payload.
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Correlation context restored from transport headers, or attached by the
    /// producer before publishing.
    pub const fn correlation(&self) -> Option<&CorrelationContext> {
        self.correlation.as_ref()
    }

    /// Maps the payload onto a domain type.
    pub fn payload_as<T>(&self) -> EnvelopeResult<T>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.payload).map_err(|e| EnvelopeError::PayloadMismatch {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    /// Encodes the wire form.
    pub fn to_bytes(&self) -> EnvelopeResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    /// Decodes the wire form. The result carries no correlation context.
    pub fn from_bytes(bytes: &[u8]) -> EnvelopeResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ProductCreated {
        name: String,
        price: f64,
        stock: u32,
    }

    fn product_created() -> EventType {
        EventType::try_new("ProductCreated").unwrap()
    }

    #[test]
    fn wire_form_uses_camel_case_and_omits_correlation() {
        let envelope = EventEnvelope::new(product_created(), json!({"name": "Widget"}))
            .with_correlation(CorrelationContext::new_root(true));

        let wire: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        let object = wire.as_object().unwrap();

        let mut keys: Vec<_> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["createdAt", "eventId", "eventType", "payload"]);
        assert_eq!(object["eventType"], "ProductCreated");
        assert_eq!(object["eventId"], envelope.event_id().to_string());
    }

    #[test]
    fn typed_payload_maps_back_to_domain_type() {
        let product = ProductCreated {
            name: "Widget".into(),
            price: 9.99,
            stock: 5,
        };
        let envelope = EventEnvelope::from_payload(product_created(), &product).unwrap();
        assert_eq!(envelope.payload_as::<ProductCreated>().unwrap(), product);
    }

    #[test]
    fn payload_of_wrong_shape_reports_mismatch() {
        let envelope = EventEnvelope::new(product_created(), json!({"title": "Widget"}));
        let error = envelope.payload_as::<ProductCreated>().unwrap_err();
        assert!(matches!(error, EnvelopeError::PayloadMismatch { .. }));
    }

    #[test]
    fn malformed_bytes_fail_deserialization() {
        let cases: [&[u8]; 4] = [
            b"not json",
            br#"{"eventType":"","eventId":"01890a5d-ac96-774b-bcce-b302099a8057","createdAt":"2024-05-01T09:30:00Z","payload":{}}"#,
            br#"{"eventType":"X","eventId":"00000000-0000-0000-0000-000000000000","createdAt":"2024-05-01T09:30:00Z","payload":{}}"#,
            br#"{"eventType":"X","createdAt":"2024-05-01T09:30:00Z","payload":{}}"#,
        ];
        for bytes in cases {
            assert!(matches!(
                EventEnvelope::from_bytes(bytes),
                Err(EnvelopeError::Deserialization(_))
            ));
        }
    }

    #[test]
    fn accepts_envelopes_from_foreign_producers() {
        let bytes = br#"{"eventType":"ProductCreated","eventId":"9b2f6c1e-3f43-4d8b-a7a4-6a0c1c4f5e21","createdAt":"2024-05-01T09:30:00.5+02:00","payload":{"name":"Widget","price":9.99,"stock":5}}"#;
        let envelope = EventEnvelope::from_bytes(bytes).unwrap();
        assert_eq!(envelope.event_type().as_ref(), "ProductCreated");
        assert_eq!(
            envelope.created_at().to_string(),
            "2024-05-01T07:30:00.500+00:00"
        );
        assert!(envelope.correlation().is_none());
    }

    #[test]
    fn float_payloads_survive_the_wire_exactly() {
        let original = EventEnvelope::new(product_created(), json!({"price": 949_419_636.971_064_1}));

        let decoded = EventEnvelope::from_bytes(&original.to_bytes().unwrap()).unwrap();

        assert_eq!(
            decoded.payload()["price"].as_f64().map(f64::to_bits),
            Some(949_419_636.971_064_1_f64.to_bits())
        );
        assert_eq!(decoded.payload(), original.payload());
    }

    proptest! {
        #[test]
        fn serialized_envelope_decodes_to_identical_fields(
            event_type in "[A-Za-z][A-Za-z0-9.]{0,40}",
            name in ".{0,32}",
            price in -1.0e9f64..1.0e9f64,
            stock in any::<u32>(),
        ) {
            let original = EventEnvelope::new(
                EventType::try_new(event_type).unwrap(),
                json!({"name": name, "price": price, "stock": stock}),
            );

            let decoded = EventEnvelope::from_bytes(&original.to_bytes().unwrap()).unwrap();

            prop_assert_eq!(decoded.event_type(), original.event_type());
            prop_assert_eq!(decoded.event_id(), original.event_id());
            prop_assert_eq!(decoded.created_at(), original.created_at());
            prop_assert_eq!(decoded.payload(), original.payload());
        }
    }
}
