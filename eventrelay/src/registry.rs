//! Consumer registrations, keyed by event type.
//!
//! Handlers are registered during startup. The registry is sealed when the
//! first dispatcher is created from it; after that lookups read an immutable
//! map without locking and further registrations fail with
//! [`RegistrationError::RegistrationClosed`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::{ConsumerSettings, MaxDeliveryAttempts};
use crate::envelope::EventEnvelope;
use crate::errors::{HandlerResult, RegistrationError};
use crate::types::EventType;

/// Processes envelopes of one event type.
///
/// Return `Ok(())` on success, [`HandlerError::Fault`](crate::errors::HandlerError::Fault)
/// when redelivery might help and
/// [`HandlerError::Rejected`](crate::errors::HandlerError::Rejected) when it never will.
/// Delivery is at-least-once, so handlers must tolerate duplicates; the
/// envelope's `event_id` identifies them.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handles one envelope.
    async fn handle(&self, envelope: &EventEnvelope) -> HandlerResult;
}

/// Handler backed by an async function of the whole envelope.
pub struct FnHandler<F>(F);

/// Wraps `f` as an [`EventHandler`].
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: &EventEnvelope) -> HandlerResult {
        (self.0)(envelope.clone()).await
    }
}

/// Handler that maps the payload to a domain type first.
///
/// A payload that does not fit `T` is rejected and dead-lettered.
pub struct TypedHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

/// Wraps `f`, which receives the payload decoded as `T`.
pub const fn typed_handler<T, F, Fut>(f: F) -> TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    TypedHandler {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> EventHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: &EventEnvelope) -> HandlerResult {
        let payload = envelope.payload_as::<T>()?;
        (self.f)(payload).await
    }
}

/// Per-registration limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delivery attempts before a faulting message is dead-lettered
    pub max_attempts: MaxDeliveryAttempts,
    /// Execution budget for one invocation
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ConsumerSettings::default())
    }
}

impl From<&ConsumerSettings> for RetryPolicy {
    fn from(settings: &ConsumerSettings) -> Self {
        Self {
            max_attempts: settings.max_delivery_attempts,
            timeout: settings.handler_timeout,
        }
    }
}

impl RetryPolicy {
    /// Replaces the attempt ceiling.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: MaxDeliveryAttempts) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Replaces the execution budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether `attempt` (1-based) is the last one allowed.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= u32::from(self.max_attempts)
    }
}

/// One handler bound to an event type.
#[derive(Clone)]
pub struct Registration {
    event_type: EventType,
    name: String,
    handler: Arc<dyn EventHandler>,
    policy: RetryPolicy,
}

impl Registration {
    /// Event type this handler consumes.
    pub const fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Name used in logs and span attributes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The handler.
    pub fn handler(&self) -> &dyn EventHandler {
        self.handler.as_ref()
    }

    /// Limits for this handler.
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("event_type", &self.event_type)
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

type RegistrationMap = HashMap<EventType, Vec<Registration>>;

/// Maps event types to their handlers.
#[derive(Default)]
pub struct ConsumerRegistry {
    pending: Mutex<RegistrationMap>,
    sealed: OnceLock<RegistrationMap>,
}

impl ConsumerRegistry {
    /// Creates an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type`. Several handlers may share one
    /// event type; each runs independently.
    pub fn register(
        &self,
        event_type: EventType,
        handler: impl EventHandler,
        policy: RetryPolicy,
    ) -> Result<(), RegistrationError> {
        let name = format!("{event_type}#{}", self.count(&event_type));
        self.register_named(event_type, name, handler, policy)
    }

    /// Like [`register`](Self::register) with an explicit handler name.
    pub fn register_named(
        &self,
        event_type: EventType,
        name: impl Into<String>,
        handler: impl EventHandler,
        policy: RetryPolicy,
    ) -> Result<(), RegistrationError> {
        let mut pending = self.pending.lock();
        if self.sealed.get().is_some() {
            return Err(RegistrationError::RegistrationClosed);
        }
        let name = name.into();
        debug!(event_type = %event_type, handler = %name, "registered consumer");
        pending
            .entry(event_type.clone())
            .or_default()
            .push(Registration {
                event_type,
                name,
                handler: Arc::new(handler),
                policy,
            });
        Ok(())
    }

    /// Freezes the registry. Later calls do nothing.
    pub fn seal(&self) {
        let mut pending = self.pending.lock();
        self.sealed.get_or_init(|| std::mem::take(&mut *pending));
    }

    /// Whether registrations are closed.
    pub fn is_sealed(&self) -> bool {
        self.sealed.get().is_some()
    }

    /// Handlers for `event_type`. Always `None` before the registry is sealed.
    pub fn resolve(&self, event_type: &EventType) -> Option<&[Registration]> {
        self.sealed
            .get()?
            .get(event_type)
            .map(Vec::as_slice)
            .filter(|registrations| !registrations.is_empty())
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = match self.sealed.get() {
            Some(sealed) => sealed.keys().cloned().collect(),
            None => self.pending.lock().keys().cloned().collect(),
        };
        types.sort();
        types
    }

    fn count(&self, event_type: &EventType) -> usize {
        self.pending.lock().get(event_type).map_or(0, Vec::len)
    }
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("event_types", &self.event_types())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
