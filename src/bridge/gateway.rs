//! Outbound gateway
//!
//! The application-facing send surface. Every call builds one
//! `OutboundRequest` for the gateway's topic and waits for the broker to accept
//! it. Failures go straight back to the caller; the gateway never retries.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::broker::Broker;
use crate::broker::client::BrokerClient;
use crate::message::{OutboundRequest, PublishReceipt, ToPayload};
use crate::utils::error::PublishError;

pub struct OutboundGateway {
    client: Arc<dyn BrokerClient>,
    topic: String,
    channel: String,
    max_message_bytes: usize,
    default_attributes: HashMap<String, String>,
}

impl OutboundGateway {
    pub fn new(client: Arc<dyn BrokerClient>, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            client,
            channel: topic.clone(),
            topic,
            max_message_bytes: Broker::DEFAULT_MAX_MESSAGE_BYTES,
            default_attributes: HashMap::new(),
        }
    }

    /// Logical name of the outbound channel, used in logs.
    pub fn with_channel_name(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    /// Attribute added to every message unless the call site sets the same key.
    pub fn with_default_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_attributes.insert(key.into(), value.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    /// Publishes `value` and resolves once the broker has accepted it.
    pub async fn send<V>(&self, value: &V) -> Result<PublishReceipt, PublishError>
    where
        V: ToPayload + Sync + ?Sized,
    {
        self.send_with_attributes(value, HashMap::new()).await
    }

    pub async fn send_with_attributes<V>(
        &self,
        value: &V,
        attributes: HashMap<String, String>,
    ) -> Result<PublishReceipt, PublishError>
    where
        V: ToPayload + Sync + ?Sized,
    {
        let request = self.request(value, attributes)?;
        let size = request.payload.len();

        let message_id = self.client.publish(request).await.map_err(|e| {
            warn!(channel = %self.channel, topic = %self.topic, error = %e, "Publish failed");
            e
        })?;

        debug!(channel = %self.channel, topic = %self.topic, message_id = %message_id, size, "Message published");
        Ok(PublishReceipt {
            message_id,
            topic: self.topic.clone(),
        })
    }

    /// Builds the request `send_with_attributes` would submit, without
    /// submitting it.
    pub fn request<V>(
        &self,
        value: &V,
        attributes: HashMap<String, String>,
    ) -> Result<OutboundRequest, PublishError>
    where
        V: ToPayload + ?Sized,
    {
        let payload = value.to_payload()?;
        if payload.len() > self.max_message_bytes {
            return Err(PublishError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_message_bytes,
            });
        }

        let mut merged = self.default_attributes.clone();
        merged.extend(attributes);
        Ok(OutboundRequest {
            payload,
            attributes: merged,
            destination_topic: self.topic.clone(),
        })
    }
}

impl std::fmt::Debug for OutboundGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGateway")
            .field("topic", &self.topic)
            .field("channel", &self.channel)
            .field("max_message_bytes", &self.max_message_bytes)
            .finish()
    }
}
