//! Topic and subscription state
//!
//! A `Topic` only knows the names of the subscriptions attached to it. Each
//! `Subscription` keeps its own backlog of messages waiting for delivery and
//! the leases of messages handed to its subscriber but not yet resolved.
//! A message leaves a subscription only through an ack; nacks and expired
//! leases put it back at the front of the backlog.
//!
//! A lease starts when the message is handed to the subscriber, and the
//! delivery carries the lease's expiry. The subscriber's flow control caps how
//! many leases are open at once, so a slow consumer is not handed messages
//! whose lease would run out before it gets to them.
//!
//! Concurrency note: callers must synchronize access (the engine lock).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::client::{FlowControl, ReceivedMessage, SubscriptionEvent};
use crate::utils::error::BrokerError;

pub type SubscriptionName = String;

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscriptions: HashSet<SubscriptionName>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: HashSet::new(),
        }
    }

    /// Attach a subscription to the topic. Duplicate attaches are ignored.
    pub fn attach(&mut self, subscription: SubscriptionName) {
        self.subscriptions.insert(subscription);
    }

    pub fn detach(&mut self, subscription: &str) {
        self.subscriptions.remove(subscription);
    }
}

/// A message retained by a subscription until it is acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: i64,
    /// Number of times the message has been handed out so far.
    pub deliveries: u32,
}

#[derive(Debug)]
pub struct Lease {
    pub message: StoredMessage,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct Subscription {
    pub name: SubscriptionName,
    pub topic: String,
    pub ack_deadline: Duration,
    pub backlog: VecDeque<StoredMessage>,
    pub leases: HashMap<String, Lease>,
    subscriber: Option<UnboundedSender<SubscriptionEvent>>,
    max_outstanding: usize,
}

impl Subscription {
    pub fn new(name: &str, topic: &str, ack_deadline: Duration) -> Self {
        Self {
            name: name.to_string(),
            topic: topic.to_string(),
            ack_deadline,
            backlog: VecDeque::new(),
            leases: HashMap::new(),
            subscriber: None,
            max_outstanding: FlowControl::DEFAULT_MAX_OUTSTANDING_MESSAGES,
        }
    }

    /// Replaces the current subscriber and starts delivering the backlog to it.
    pub fn attach(&mut self, subscriber: UnboundedSender<SubscriptionEvent>, flow: FlowControl) {
        if self.subscriber.is_some() {
            debug!(subscription = %self.name, "Replacing existing subscriber");
        }
        self.subscriber = Some(subscriber);
        self.max_outstanding = flow.max_outstanding_messages.max(1);
        self.pump();
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn enqueue(&mut self, message: StoredMessage) {
        self.backlog.push_back(message);
        self.pump();
    }

    pub fn ack(&mut self, ack_id: &str) -> Result<(), BrokerError> {
        match self.leases.remove(ack_id) {
            Some(lease) => {
                debug!(subscription = %self.name, message_id = %lease.message.message_id, "Message acknowledged");
                self.pump();
                Ok(())
            }
            None => Err(self.unknown(ack_id)),
        }
    }

    /// Releases the lease and makes the message available again right away.
    pub fn nack(&mut self, ack_id: &str) -> Result<(), BrokerError> {
        let lease = self.leases.remove(ack_id).ok_or_else(|| self.unknown(ack_id))?;
        debug!(subscription = %self.name, message_id = %lease.message.message_id, "Message nacked");
        self.backlog.push_front(lease.message);
        self.pump();
        Ok(())
    }

    /// Returns every lease whose deadline has passed to the backlog.
    pub fn expire_leases(&mut self, now: Instant) -> usize {
        let expired_ids: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();

        let mut expired: Vec<Lease> = expired_ids
            .iter()
            .filter_map(|ack_id| self.leases.remove(ack_id))
            .collect();
        // latest deadline first so the oldest lease ends up at the front
        expired.sort_by(|a, b| b.deadline.cmp(&a.deadline));

        let count = expired.len();
        for lease in expired {
            warn!(
                subscription = %self.name,
                message_id = %lease.message.message_id,
                deliveries = lease.message.deliveries,
                "Lease expired; message will be redelivered"
            );
            self.backlog.push_front(lease.message);
        }
        if count > 0 {
            self.pump();
        }
        count
    }

    /// Hands backlog messages to the subscriber until the backlog is empty,
    /// the subscriber's flow control is exhausted or the subscriber is gone.
    fn pump(&mut self) {
        while !self.backlog.is_empty() && self.leases.len() < self.max_outstanding {
            let Some(tx) = self.subscriber.as_ref() else {
                return;
            };
            if tx.is_closed() {
                debug!(subscription = %self.name, "Subscriber went away");
                self.subscriber = None;
                return;
            }
            let Some(mut message) = self.backlog.pop_front() else {
                return;
            };

            let ack_id = Uuid::new_v4().to_string();
            let deadline = Instant::now() + self.ack_deadline;
            let delivery = ReceivedMessage {
                message_id: message.message_id.clone(),
                ack_id: ack_id.clone(),
                payload: message.payload.clone(),
                attributes: message.attributes.clone(),
                publish_time: message.publish_time,
                delivery_attempt: message.deliveries + 1,
                ack_deadline: self.ack_deadline,
                lease_expires_at: deadline,
            };

            if tx.send(SubscriptionEvent::Message(delivery)).is_err() {
                self.subscriber = None;
                self.backlog.push_front(message);
                return;
            }

            message.deliveries += 1;
            self.leases.insert(
                ack_id,
                Lease { message, deadline },
            );
        }
    }

    fn unknown(&self, ack_id: &str) -> BrokerError {
        BrokerError::UnknownAckId {
            subscription: self.name.clone(),
            ack_id: ack_id.to_string(),
        }
    }
}
