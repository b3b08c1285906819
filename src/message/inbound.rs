use std::borrow::Cow;
use std::collections::HashMap;

use crate::broker::client::ReceivedMessage;
use crate::message::ack::AckHandle;

/// A message delivered from a broker subscription onto a delivery channel.
///
/// Immutable once built. The handler that takes it is responsible for
/// resolving `ack_handle()` exactly once.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    delivery_id: String,
    message_id: String,
    subscription: String,
    payload: Vec<u8>,
    attributes: HashMap<String, String>,
    publish_time: i64,
    delivery_attempt: u32,
    ack_handle: AckHandle,
}

impl InboundMessage {
    /// Wraps a raw broker delivery together with the handle for its ack id.
    pub fn new(received: ReceivedMessage, ack_handle: AckHandle) -> Self {
        Self {
            delivery_id: ack_handle.delivery_id().to_string(),
            subscription: ack_handle.subscription().to_string(),
            message_id: received.message_id,
            payload: received.payload,
            attributes: received.attributes,
            publish_time: received.publish_time,
            delivery_attempt: received.delivery_attempt,
            ack_handle,
        }
    }

    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    /// Broker-assigned id, stable across redeliveries of the same message.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// The payload as text with invalid sequences replaced, for logging.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Milliseconds since the UNIX epoch at which the broker accepted the message.
    pub fn publish_time(&self) -> i64 {
        self.publish_time
    }

    /// 1 on first delivery, incremented on every redelivery.
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    pub fn ack_handle(&self) -> &AckHandle {
        &self.ack_handle
    }
}
