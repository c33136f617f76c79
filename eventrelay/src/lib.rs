//! `EventRelay` - transport-agnostic event bus with end-to-end tracing
//!
//! Services publish [`EventEnvelope`]s to queues or topics and consume them
//! through handlers registered per event type. Delivery is at-least-once:
//! every message ends acknowledged, retried by the broker or dead-lettered
//! with a recorded reason. The correlation context of the publishing code
//! travels in the message headers, so consumer spans join the producer's
//! trace regardless of which broker carries the message.
//!
//! Telemetry (spans, metrics and logs) flows through a [`TelemetryPipeline`]
//! whose exporters are chosen by configuration.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use eventrelay::{
//!     handler_fn, BrokerAdapter, ConsumerRegistry, ConsumerSettings, Destination,
//!     EventDispatcher, EventType, RetryPolicy, Transport,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ConsumerRegistry::new());
//! registry.register(
//!     EventType::try_new("ProductCreated")?,
//!     handler_fn(|envelope| async move {
//!         tracing::info!(event_id = %envelope.event_id(), "product created");
//!         Ok(())
//!     }),
//!     RetryPolicy::default(),
//! )?;
//!
//! let adapter = BrokerAdapter::new(transport);
//! let shutdown = CancellationToken::new();
//! let subscription = adapter.subscribe(
//!     "products".parse::<Destination>()?,
//!     EventDispatcher::new(registry),
//!     &ConsumerSettings::default(),
//!     &shutdown,
//! );
//!
//! shutdown.cancel();
//! subscription.closed().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod logging;
pub mod outcome;
pub mod registry;
pub mod telemetry;
pub mod types;

pub use broker::{
    BrokerAdapter, Destination, InboundMessage, LeaseId, OutboundMessage, PublishAck,
    RetryConfig, Settlement, SubscriptionHandle, Transport,
};
pub use config::{
    BrokerConnection, BrokerProvider, BusSettings, ConfigSource, ConsumerSettings, EnvSource,
    MapSource, MaxDeliveryAttempts, MaxInFlight,
};
pub use correlation::{CorrelationContext, MessageHeaders, PropagationStyle};
pub use dispatcher::{DispatchContext, EventDispatcher};
pub use envelope::EventEnvelope;
pub use errors::{
    ConfigurationError, EnvelopeError, ExportError, HandlerError, HandlerResult, PublishError,
    RegistrationError, TransportError,
};
pub use outcome::{DeadLetterReason, DeliveryOutcome, RetryReason};
pub use registry::{
    handler_fn, typed_handler, ConsumerRegistry, EventHandler, Registration, RetryPolicy,
};
pub use telemetry::{TelemetryPipeline, TelemetrySettings};
pub use types::{DestinationName, EventId, EventType, SubscriptionName, Timestamp};
