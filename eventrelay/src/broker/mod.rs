//! Broker transports and the adapter that runs them.
//!
//! A [`Transport`] is the thin, broker-specific driver: it moves bytes and
//! headers, leases received messages and settles them. Everything else
//! (envelope encoding, trace propagation, attempt counting, concurrency and
//! shutdown) lives in [`BrokerAdapter`], so every broker gets identical
//! delivery semantics.
//!
//! Two delivery models are supported through [`Destination`]:
//!
//! - **Queue**: point-to-point. All consumers of a queue compete for its
//!   messages.
//! - **Topic**: fan-out. Every subscription of a topic receives its own copy.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::correlation::{MessageHeaders, PropagationStyle};
use crate::errors::{PublishResult, TransportResult};
use crate::outcome::DeliveryOutcome;
use crate::types::{DestinationName, SubscriptionName};

pub mod adapter;

pub use adapter::{BrokerAdapter, RetryConfig, SubscriptionHandle};

/// Dead-letter property holding the [`DeliveryOutcome`] reason.
pub const DEAD_LETTER_REASON: &str = "dead_letter_reason";
/// Dead-letter property holding the human-readable failure detail.
pub const DEAD_LETTER_DESCRIPTION: &str = "dead_letter_description";

/// Where messages are consumed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Point-to-point queue
    Queue(DestinationName),
    /// One subscription of a fan-out topic
    Topic {
        /// Topic messages are published to
        topic: DestinationName,
        /// Subscription this consumer drains
        subscription: SubscriptionName,
    },
}

impl Destination {
    /// A queue destination.
    pub const fn queue(name: DestinationName) -> Self {
        Self::Queue(name)
    }

    /// A topic subscription destination.
    pub const fn topic(topic: DestinationName, subscription: SubscriptionName) -> Self {
        Self::Topic {
            topic,
            subscription,
        }
    }

    /// The entity producers publish to: the queue itself or the topic.
    pub const fn entity(&self) -> &DestinationName {
        match self {
            Self::Queue(name) | Self::Topic { topic: name, .. } => name,
        }
    }

    /// The subscription name for topic destinations.
    pub const fn subscription(&self) -> Option<&SubscriptionName> {
        match self {
            Self::Queue(_) => None,
            Self::Topic { subscription, .. } => Some(subscription),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "{name}"),
            Self::Topic {
                topic,
                subscription,
            } => write!(f, "{topic}/{subscription}"),
        }
    }
}

impl FromStr for Destination {
    type Err = String;

    /// Parses `queue` or `topic/subscription`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |e: &dyn fmt::Display| format!("invalid destination `{s}`: {e}");
        match s.split_once('/') {
            None => DestinationName::try_new(s)
                .map(Self::Queue)
                .map_err(|e| invalid(&e)),
            Some((topic, subscription)) => Ok(Self::Topic {
                topic: DestinationName::try_new(topic).map_err(|e| invalid(&e))?,
                subscription: SubscriptionName::try_new(subscription)
                    .map_err(|e| invalid(&e))?,
            }),
        }
    }
}

/// A message ready to hand to a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Broker-level message id, unique per send. The event id stays in the body.
    pub message_id: String,
    /// Encoded envelope
    pub body: Vec<u8>,
    /// Application properties, including trace propagation headers
    pub headers: MessageHeaders,
    /// MIME type of `body`
    pub content_type: String,
}

/// Opaque handle to a leased, not yet settled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

/// A message received from a broker and leased to this consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Broker-level message id
    pub message_id: String,
    /// Raw body
    pub body: Vec<u8>,
    /// Application properties
    pub headers: MessageHeaders,
    /// Native delivery count (1 on first delivery), when the broker tracks one
    pub delivery_count: Option<u32>,
    /// Lease to settle
    pub lease: LeaseId,
}

/// What the broker should do with a leased message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Remove the message
    Complete,
    /// Release the lease; the broker redelivers later
    Abandon,
    /// Move the message, unchanged, to the dead-letter destination
    DeadLetter {
        /// Stored as [`DEAD_LETTER_REASON`]
        reason: String,
        /// Stored as [`DEAD_LETTER_DESCRIPTION`]
        description: String,
    },
}

impl From<&DeliveryOutcome> for Settlement {
    fn from(outcome: &DeliveryOutcome) -> Self {
        match outcome {
            DeliveryOutcome::Acknowledged => Self::Complete,
            DeliveryOutcome::Retry { .. } => Self::Abandon,
            DeliveryOutcome::DeadLettered {
                reason,
                description,
            } => Self::DeadLetter {
                reason: reason.to_string(),
                description: description.clone(),
            },
        }
    }
}

/// Broker acknowledgement of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Message id the broker stored
    pub message_id: String,
    /// Broker-assigned sequence number, when the broker assigns one
    pub sequence_number: Option<u64>,
}

/// A broker driver.
///
/// Drivers normalize their SDK's failures: publish failures into
/// [`PublishError`](crate::errors::PublishError), receive and settle
/// failures into [`TransportError`](crate::errors::TransportError).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name, used as the `messaging.system` span attribute.
    fn name(&self) -> &'static str;

    /// Header style this broker's ecosystem uses for trace propagation.
    fn propagation_style(&self) -> PropagationStyle {
        PropagationStyle::W3c
    }

    /// Publishes to a queue or topic.
    async fn send(
        &self,
        entity: &DestinationName,
        message: OutboundMessage,
    ) -> PublishResult<PublishAck>;

    /// Waits for the next message and leases it.
    ///
    /// Must be cancel-safe: dropping the future before it completes must
    /// not lose a message. Returns [`TransportError::Closed`](crate::errors::TransportError::Closed)
    /// once the transport shuts down.
    async fn receive(&self, source: &Destination) -> TransportResult<InboundMessage>;

    /// Settles a leased message.
    async fn settle(
        &self,
        source: &Destination,
        lease: LeaseId,
        settlement: Settlement,
    ) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{DeadLetterReason, RetryReason};

    #[test]
    fn parses_queues_and_topic_subscriptions() {
        let queue: Destination = "products".parse().unwrap();
        let topic: Destination = "product-events/inventory".parse().unwrap();

        assert_eq!(queue.entity().to_string(), "products");
        assert!(queue.subscription().is_none());
        assert_eq!(topic.entity().to_string(), "product-events");
        assert_eq!(topic.subscription().unwrap().to_string(), "inventory");
        assert_eq!(topic.to_string(), "product-events/inventory");
    }

    #[test]
    fn rejects_blank_parts() {
        assert!("".parse::<Destination>().is_err());
        assert!("events/".parse::<Destination>().is_err());
        assert!("/inventory".parse::<Destination>().is_err());
    }

    #[test]
    fn settlement_follows_the_outcome() {
        assert_eq!(
            Settlement::from(&DeliveryOutcome::Acknowledged),
            Settlement::Complete
        );
        assert_eq!(
            Settlement::from(&DeliveryOutcome::retry(RetryReason::Timeout, "slow")),
            Settlement::Abandon
        );
        assert_eq!(
            Settlement::from(&DeliveryOutcome::dead_lettered(
                DeadLetterReason::NoHandler,
                "no consumer for OrderPlaced"
            )),
            Settlement::DeadLetter {
                reason: "NoHandler".into(),
                description: "no consumer for OrderPlaced".into(),
            }
        );
    }
}
