//! In-memory broker for `EventRelay`
//!
//! This crate provides an in-process implementation of the
//! [`Transport`] trait from the eventrelay crate, useful for tests and local
//! development where no real broker is available. It models the parts of
//! broker behaviour the adapter relies on: competing consumers on queues,
//! per-subscription copies on topics, leases, delivery counts, abandon and
//! dead-lettering.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventrelay::broker::{
    Destination, InboundMessage, LeaseId, OutboundMessage, PublishAck, Settlement, Transport,
    DEAD_LETTER_DESCRIPTION, DEAD_LETTER_REASON,
};
use eventrelay::correlation::{MessageHeaders, PropagationStyle};
use eventrelay::errors::{PublishError, PublishResult, TransportError, TransportResult};
use eventrelay::types::{DestinationName, SubscriptionName};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Behaviour switches for [`InMemoryBroker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Report a native delivery count on received messages. Disable to
    /// emulate brokers that do not track one.
    pub delivery_count: bool,
    /// Unsettled leases older than this are returned to the queue.
    pub lease_timeout: Option<Duration>,
    /// Trace header style advertised to the adapter.
    pub propagation_style: PropagationStyle,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            delivery_count: true,
            lease_timeout: None,
            propagation_style: PropagationStyle::W3c,
        }
    }
}

/// A message moved to a destination's dead-letter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Broker-level message id
    pub message_id: String,
    /// Original body, unchanged
    pub body: Vec<u8>,
    /// Original headers plus the dead-letter reason and description
    /// properties
    pub headers: MessageHeaders,
    /// Deliveries made before dead-lettering
    pub delivery_count: u32,
    /// Reason property
    pub reason: String,
    /// Description property
    pub description: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Vec<u8>,
    headers: MessageHeaders,
    delivery_count: u32,
}

#[derive(Debug)]
struct Lease {
    message: StoredMessage,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<StoredMessage>,
    leased: HashMap<LeaseId, Lease>,
    dead_letters: Vec<DeadLetter>,
}

impl Queue {
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                trace!(message_id = %lease.message.message_id, "lease expired");
                self.ready.push_front(lease.message);
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<Destination, Queue>,
    subscriptions: HashMap<DestinationName, BTreeSet<SubscriptionName>>,
    send_faults: VecDeque<PublishError>,
    next_lease: u64,
    next_sequence: u64,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    options: BrokerOptions,
    state: Mutex<State>,
    changed: Notify,
}

/// Thread-safe in-process broker.
///
/// Clones share the same queues. Publishing to a name with declared topic
/// subscriptions copies the message into every subscription; any other name
/// is treated as a queue.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create a new empty broker with default options
    pub fn new() -> Self {
        Self::with_options(BrokerOptions::default())
    }

    /// Create a new empty broker
    pub fn with_options(options: BrokerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(State::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Creates the queue or topic subscription behind `destination`.
    ///
    /// Topic subscriptions only receive messages published after they exist.
    pub fn declare(&self, destination: &Destination) {
        let mut state = self.inner.state.lock();
        if let Destination::Topic {
            topic,
            subscription,
        } = destination
        {
            state
                .subscriptions
                .entry(topic.clone())
                .or_default()
                .insert(subscription.clone());
        }
        state.queues.entry(destination.clone()).or_default();
    }

    /// Makes the next send fail with `error`. Faults queue up in order.
    pub fn fail_next_send(&self, error: PublishError) {
        self.inner.state.lock().send_faults.push_back(error);
    }

    /// Messages waiting to be received.
    pub fn depth(&self, destination: &Destination) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(destination)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Messages received but not yet settled.
    pub fn in_flight(&self, destination: &Destination) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(destination)
            .map_or(0, |queue| queue.leased.len())
    }

    /// Dead-lettered messages, oldest first.
    pub fn dead_letters(&self, destination: &Destination) -> Vec<DeadLetter> {
        self.inner
            .state
            .lock()
            .queues
            .get(destination)
            .map(|queue| queue.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Shuts the broker down. Pending receives return
    /// [`TransportError::Closed`] and later sends fail.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.changed.notify_waiters();
    }

    fn try_lease(&self, source: &Destination) -> TransportResult<Option<InboundMessage>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let lease = LeaseId(state.next_lease);
        let queue = state.queues.entry(source.clone()).or_default();
        queue.reclaim_expired(Instant::now());
        let Some(mut message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        message.delivery_count += 1;
        let inbound = InboundMessage {
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            headers: message.headers.clone(),
            delivery_count: self
                .inner
                .options
                .delivery_count
                .then_some(message.delivery_count),
            lease,
        };
        let expires_at = self
            .inner
            .options
            .lease_timeout
            .map(|timeout| Instant::now() + timeout);
        queue.leased.insert(lease, Lease { message, expires_at });
        state.next_lease += 1;
        Ok(Some(inbound))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn propagation_style(&self) -> PropagationStyle {
        self.inner.options.propagation_style
    }

    async fn send(
        &self,
        entity: &DestinationName,
        message: OutboundMessage,
    ) -> PublishResult<PublishAck> {
        let mut state = self.inner.state.lock();
        if let Some(fault) = state.send_faults.pop_front() {
            return Err(fault);
        }
        if state.closed {
            return Err(PublishError::Unreachable("broker closed".to_string()));
        }

        let stored = StoredMessage {
            message_id: message.message_id,
            body: message.body,
            headers: message.headers,
            delivery_count: 0,
        };
        let targets: Vec<Destination> = match state.subscriptions.get(entity) {
            Some(subscriptions) => subscriptions
                .iter()
                .map(|subscription| Destination::topic(entity.clone(), subscription.clone()))
                .collect(),
            None => vec![Destination::queue(entity.clone())],
        };
        for target in targets {
            state
                .queues
                .entry(target)
                .or_default()
                .ready
                .push_back(stored.clone());
        }

        state.next_sequence += 1;
        let ack = PublishAck {
            message_id: stored.message_id,
            sequence_number: Some(state.next_sequence),
        };
        drop(state);
        debug!(entity = %entity, message_id = %ack.message_id, "message stored");
        self.inner.changed.notify_waiters();
        Ok(ack)
    }

    async fn receive(&self, source: &Destination) -> TransportResult<InboundMessage> {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(message) = self.try_lease(source)? {
                return Ok(message);
            }

            match self.inner.options.lease_timeout {
                Some(timeout) => {
                    let _ = tokio::time::timeout(timeout, changed).await;
                }
                None => changed.await,
            }
        }
    }

    async fn settle(
        &self,
        source: &Destination,
        lease: LeaseId,
        settlement: Settlement,
    ) -> TransportResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let queue = state
            .queues
            .get_mut(source)
            .ok_or_else(|| TransportError::UnknownDestination(source.to_string()))?;
        let Lease { message, .. } = queue
            .leased
            .remove(&lease)
            .ok_or(TransportError::LeaseLost(lease.0))?;

        match settlement {
            Settlement::Complete => {
                trace!(message_id = %message.message_id, "completed");
            }
            Settlement::Abandon => {
                trace!(message_id = %message.message_id, "abandoned");
                queue.ready.push_back(message);
                drop(state);
                self.inner.changed.notify_waiters();
            }
            Settlement::DeadLetter {
                reason,
                description,
            } => {
                debug!(message_id = %message.message_id, %reason, "dead-lettered");
                let mut headers = message.headers;
                headers.insert(DEAD_LETTER_REASON, reason.clone());
                headers.insert(DEAD_LETTER_DESCRIPTION, description.clone());
                queue.dead_letters.push(DeadLetter {
                    message_id: message.message_id,
                    body: message.body,
                    headers,
                    delivery_count: message.delivery_count,
                    reason,
                    description,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Destination {
        "products".parse().unwrap()
    }

    fn outbound(id: &str) -> OutboundMessage {
        OutboundMessage {
            message_id: id.to_string(),
            body: br#"{"hello":"world"}"#.to_vec(),
            headers: MessageHeaders::new(),
            content_type: "application/json".to_string(),
        }
    }

    async fn send(broker: &InMemoryBroker, entity: &str, id: &str) {
        broker
            .send(&DestinationName::try_new(entity).unwrap(), outbound(id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn queue_messages_are_leased_in_order() {
        let broker = InMemoryBroker::new();
        send(&broker, "products", "m-1").await;
        send(&broker, "products", "m-2").await;

        let first = broker.receive(&queue()).await.unwrap();
        let second = broker.receive(&queue()).await.unwrap();

        assert_eq!(first.message_id, "m-1");
        assert_eq!(second.message_id, "m-2");
        assert_eq!(first.delivery_count, Some(1));
        assert_eq!(broker.in_flight(&queue()), 2);
        assert_eq!(broker.depth(&queue()), 0);
    }

    #[tokio::test]
    async fn abandon_redelivers_with_a_higher_count() {
        let broker = InMemoryBroker::new();
        send(&broker, "products", "m-1").await;

        let first = broker.receive(&queue()).await.unwrap();
        broker
            .settle(&queue(), first.lease, Settlement::Abandon)
            .await
            .unwrap();
        let again = broker.receive(&queue()).await.unwrap();

        assert_eq!(again.message_id, "m-1");
        assert_eq!(again.delivery_count, Some(2));
    }

    #[tokio::test]
    async fn dead_letter_keeps_the_original_message_and_reason() {
        let broker = InMemoryBroker::new();
        send(&broker, "products", "m-1").await;

        let message = broker.receive(&queue()).await.unwrap();
        broker
            .settle(
                &queue(),
                message.lease,
                Settlement::DeadLetter {
                    reason: "NoHandler".into(),
                    description: "no consumer".into(),
                },
            )
            .await
            .unwrap();

        let dead = broker.dead_letters(&queue());
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, message.body);
        assert_eq!(dead[0].reason, "NoHandler");
        assert_eq!(dead[0].headers.get(DEAD_LETTER_REASON), Some("NoHandler"));
        assert_eq!(dead[0].headers.get(DEAD_LETTER_DESCRIPTION), Some("no consumer"));
        assert_eq!(broker.in_flight(&queue()), 0);
    }

    #[tokio::test]
    async fn settling_twice_loses_the_lease() {
        let broker = InMemoryBroker::new();
        send(&broker, "products", "m-1").await;
        let message = broker.receive(&queue()).await.unwrap();

        broker
            .settle(&queue(), message.lease, Settlement::Complete)
            .await
            .unwrap();

        assert_eq!(
            broker
                .settle(&queue(), message.lease, Settlement::Complete)
                .await,
            Err(TransportError::LeaseLost(message.lease.0))
        );
    }

    #[tokio::test]
    async fn topic_subscriptions_each_get_a_copy() {
        let broker = InMemoryBroker::new();
        let inventory: Destination = "product-events/inventory".parse().unwrap();
        let search: Destination = "product-events/search".parse().unwrap();
        broker.declare(&inventory);
        broker.declare(&search);

        send(&broker, "product-events", "m-1").await;

        assert_eq!(broker.receive(&inventory).await.unwrap().message_id, "m-1");
        assert_eq!(broker.receive(&search).await.unwrap().message_id, "m-1");
    }

    #[tokio::test]
    async fn receive_waits_for_a_send() {
        let broker = InMemoryBroker::new();
        let waiting = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive(&queue()).await })
        };
        tokio::task::yield_now().await;

        send(&broker, "products", "m-1").await;

        assert_eq!(waiting.await.unwrap().unwrap().message_id, "m-1");
    }

    #[tokio::test]
    async fn cancelled_receive_loses_nothing() {
        let broker = InMemoryBroker::new();
        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), broker.receive(&queue())).await;
        assert!(cancelled.is_err());

        send(&broker, "products", "m-1").await;

        assert_eq!(broker.receive(&queue()).await.unwrap().message_id, "m-1");
    }

    #[tokio::test]
    async fn close_ends_receives_and_sends() {
        let broker = InMemoryBroker::new();
        broker.close();

        assert_eq!(broker.receive(&queue()).await, Err(TransportError::Closed));
        assert!(matches!(
            broker
                .send(&DestinationName::try_new("products").unwrap(), outbound("m-1"))
                .await,
            Err(PublishError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn injected_faults_fail_sends_in_order() {
        let broker = InMemoryBroker::new();
        broker.fail_next_send(PublishError::Throttled { retry_after: None });

        let entity = DestinationName::try_new("products").unwrap();
        assert_eq!(
            broker.send(&entity, outbound("m-1")).await,
            Err(PublishError::Throttled { retry_after: None })
        );
        assert!(broker.send(&entity, outbound("m-1")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_leases_return_to_the_queue() {
        let broker = InMemoryBroker::with_options(BrokerOptions {
            lease_timeout: Some(Duration::from_secs(5)),
            ..BrokerOptions::default()
        });
        send(&broker, "products", "m-1").await;
        let _abandoned = broker.receive(&queue()).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = broker.receive(&queue()).await.unwrap();

        assert_eq!(again.message_id, "m-1");
        assert_eq!(again.delivery_count, Some(2));
    }

    #[tokio::test]
    async fn delivery_count_can_be_withheld() {
        let broker = InMemoryBroker::with_options(BrokerOptions {
            delivery_count: false,
            ..BrokerOptions::default()
        });
        send(&broker, "products", "m-1").await;

        assert_eq!(broker.receive(&queue()).await.unwrap().delivery_count, None);
    }
}
