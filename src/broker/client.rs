//! Broker client seam
//!
//! The bridge never talks to a broker directly. It opens a `Subscriber`
//! through a `BrokerClient`, reads `SubscriptionEvent`s from it and resolves
//! deliveries through the subscriber's `Acknowledger`. Reconnecting and
//! backing off are the client's business; it reports what it is doing as
//! `ConnectionState` events on every open subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::message::OutboundRequest;
use crate::utils::error::BrokerError;

/// One delivery attempt of a message, as handed over by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Native acknowledgement token, valid for this delivery only.
    pub ack_id: String,
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: i64,
    pub delivery_attempt: u32,
    /// Lease length configured on the subscription.
    pub ack_deadline: Duration,
    /// When the broker takes this delivery back. Handles use the same instant
    /// so they never outlive the broker's lease.
    pub lease_expires_at: Instant,
}

/// Subscriber-side flow control: the broker hands out at most
/// `max_outstanding_messages` deliveries that are still unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub max_outstanding_messages: usize,
}

impl FlowControl {
    pub const DEFAULT_MAX_OUTSTANDING_MESSAGES: usize = 1000;

    pub fn new(max_outstanding_messages: usize) -> Self {
        Self {
            max_outstanding_messages: max_outstanding_messages.max(1),
        }
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_OUTSTANDING_MESSAGES)
    }
}

/// Liveness of the connection behind a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
}

#[derive(Debug)]
pub enum SubscriptionEvent {
    Message(ReceivedMessage),
    Connection(ConnectionState),
}

/// Resolves native ack tokens against the broker.
pub trait Acknowledger: Send + Sync {
    fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), BrokerError>;
    fn nack(&self, subscription: &str, ack_id: &str) -> Result<(), BrokerError>;
}

/// An open, long-lived subscription.
pub struct Subscriber {
    pub subscription: String,
    pub events: UnboundedReceiver<SubscriptionEvent>,
    pub acker: Arc<dyn Acknowledger>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscription", &self.subscription)
            .finish()
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Opens `subscription`. Fails with `SubscriptionNotFound` if the broker
    /// does not know it.
    async fn subscribe(
        &self,
        subscription: &str,
        flow: FlowControl,
    ) -> Result<Subscriber, BrokerError>;

    /// Publishes a message and resolves with the broker-assigned message id
    /// once the broker has accepted it.
    async fn publish(&self, request: OutboundRequest) -> Result<String, BrokerError>;
}
