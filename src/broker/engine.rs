//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - managing topics and the subscriptions attached to them
//! - fanning each published message out to every subscription of its topic
//! - leasing deliveries and taking them back when a lease expires or is nacked
//!
//! It plays the managed pub/sub service for the emulator server and for tests.
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous and designed to be held behind a
//!   lock (`SharedBroker`). Callers should avoid holding the lock across
//!   network I/O.
//! - The lease loop is designed to be run as a background task and will
//!   return expired leases to their backlog for redelivery. Messages are never
//!   dropped: at-least-once delivery has no retry cap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::client::{FlowControl, SubscriptionEvent};
use crate::broker::topic::{StoredMessage, Subscription, SubscriptionName, Topic};
use crate::message::OutboundRequest;
use crate::utils::error::BrokerError;
use crate::utils::lock;

pub type SharedBroker = Arc<Mutex<Broker>>;

#[derive(Debug)]
pub struct Broker {
    pub topics: HashMap<String, Topic>,
    pub subscriptions: HashMap<SubscriptionName, Subscription>,
    max_message_bytes: usize,
}

impl Broker {
    /// Largest payload accepted by `publish`, matching the managed service.
    pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10_000_000;
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::with_max_message_bytes(Self::DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_max_message_bytes(max_message_bytes: usize) -> Self {
        Self {
            topics: HashMap::new(),
            subscriptions: HashMap::new(),
            max_message_bytes,
        }
    }

    pub fn shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    pub fn create_topic(&mut self, name: &str) -> Result<(), BrokerError> {
        if self.topics.contains_key(name) {
            return Err(BrokerError::TopicAlreadyExists(name.to_string()));
        }
        self.topics.insert(name.to_string(), Topic::new(name));
        info!(topic = %name, "Topic created");
        Ok(())
    }

    /// Creates a subscription on an existing topic. Only messages published
    /// after this call reach it.
    pub fn create_subscription(
        &mut self,
        name: &str,
        topic: &str,
        ack_deadline: Duration,
    ) -> Result<(), BrokerError> {
        if self.subscriptions.contains_key(name) {
            return Err(BrokerError::SubscriptionAlreadyExists(name.to_string()));
        }
        let Some(t) = self.topics.get_mut(topic) else {
            return Err(BrokerError::TopicNotFound(topic.to_string()));
        };
        t.attach(name.to_string());
        self.subscriptions
            .insert(name.to_string(), Subscription::new(name, topic, ack_deadline));
        info!(subscription = %name, topic = %topic, ?ack_deadline, "Subscription created");
        Ok(())
    }

    /// Removes a subscription together with its backlog and leases.
    pub fn delete_subscription(&mut self, name: &str) -> Result<(), BrokerError> {
        let subscription = self
            .subscriptions
            .remove(name)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(name.to_string()))?;
        if let Some(topic) = self.topics.get_mut(&subscription.topic) {
            topic.detach(name);
        }
        info!(subscription = %name, "Subscription deleted");
        Ok(())
    }

    /// Accepts a message for every subscription of its topic and returns the
    /// assigned message id. Nothing is stored if the request is rejected.
    pub fn publish(&mut self, request: OutboundRequest) -> Result<String, BrokerError> {
        let Some(topic) = self.topics.get(&request.destination_topic) else {
            return Err(BrokerError::TopicNotFound(request.destination_topic));
        };
        if request.payload.len() > self.max_message_bytes {
            return Err(BrokerError::PayloadTooLarge {
                size: request.payload.len(),
                max: self.max_message_bytes,
            });
        }

        let message = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            payload: request.payload,
            attributes: request.attributes,
            publish_time: chrono::Utc::now().timestamp_millis(),
            deliveries: 0,
        };
        let message_id = message.message_id.clone();

        for name in &topic.subscriptions {
            if let Some(subscription) = self.subscriptions.get_mut(name) {
                subscription.enqueue(message.clone());
            }
        }

        debug!(topic = %topic.name, message_id = %message_id, "Message published");
        Ok(message_id)
    }

    /// Attaches a new subscriber to `subscription` and returns its event stream.
    /// A previous subscriber on the same subscription is replaced.
    pub fn attach(
        &mut self,
        subscription: &str,
        flow: FlowControl,
    ) -> Result<UnboundedReceiver<SubscriptionEvent>, BrokerError> {
        let sub = self
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(subscription.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        sub.attach(tx, flow);
        info!(
            subscription = %subscription,
            max_outstanding = flow.max_outstanding_messages,
            "Subscriber attached"
        );
        Ok(rx)
    }

    pub fn ack(&mut self, subscription: &str, ack_id: &str) -> Result<(), BrokerError> {
        self.subscription_mut(subscription)?.ack(ack_id)
    }

    pub fn nack(&mut self, subscription: &str, ack_id: &str) -> Result<(), BrokerError> {
        self.subscription_mut(subscription)?.nack(ack_id)
    }

    /// Returns expired leases of every subscription to its backlog.
    pub fn expire_leases(&mut self) -> usize {
        let now = Instant::now();
        self.subscriptions
            .values_mut()
            .map(|subscription| subscription.expire_leases(now))
            .sum()
    }

    /// Messages waiting for delivery on `subscription`.
    pub fn backlog_len(&self, subscription: &str) -> Option<usize> {
        self.subscriptions.get(subscription).map(|s| s.backlog.len())
    }

    /// Messages delivered on `subscription` and not yet resolved.
    pub fn leased_len(&self, subscription: &str) -> Option<usize> {
        self.subscriptions.get(subscription).map(|s| s.leases.len())
    }

    fn subscription_mut(&mut self, name: &str) -> Result<&mut Subscription, BrokerError> {
        self.subscriptions
            .get_mut(name)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(name.to_string()))
    }

    /// Periodically returns expired leases to their backlog. Runs forever;
    /// spawn it next to whatever serves the broker.
    pub async fn start_lease_loop(broker: SharedBroker, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            let expired = lock(&broker).expire_leases();
            if expired > 0 {
                info!(expired, "Returned expired leases for redelivery");
            }
        }
    }
}
