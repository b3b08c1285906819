//! In-process broker client
//!
//! `LocalClient` drives a `SharedBroker` directly. The connection can never
//! drop, so it never reports `ConnectionState` changes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::client::{Acknowledger, BrokerClient, FlowControl, Subscriber};
use crate::broker::engine::SharedBroker;
use crate::message::OutboundRequest;
use crate::utils::error::BrokerError;
use crate::utils::lock;

#[derive(Debug, Clone)]
pub struct LocalClient {
    broker: SharedBroker,
}

impl LocalClient {
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerClient for LocalClient {
    async fn subscribe(
        &self,
        subscription: &str,
        flow: FlowControl,
    ) -> Result<Subscriber, BrokerError> {
        let events = lock(&self.broker).attach(subscription, flow)?;
        Ok(Subscriber {
            subscription: subscription.to_string(),
            events,
            acker: Arc::new(self.clone()),
        })
    }

    async fn publish(&self, request: OutboundRequest) -> Result<String, BrokerError> {
        lock(&self.broker).publish(request)
    }
}

impl Acknowledger for LocalClient {
    fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), BrokerError> {
        lock(&self.broker).ack(subscription, ack_id)
    }

    fn nack(&self, subscription: &str, ack_id: &str) -> Result<(), BrokerError> {
        lock(&self.broker).nack(subscription, ack_id)
    }
}
