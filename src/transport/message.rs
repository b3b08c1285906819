//! Emulator wire protocol
//!
//! Every frame is a JSON text message tagged by `type`. Payloads travel as
//! standard base64 so arbitrary bytes survive the JSON encoding. Requests that
//! expect an answer carry a client-chosen `request_id` which the server echoes.
//!
//! A delivery states how much of its lease is left when the server sends it;
//! the receiving side turns that back into a local deadline.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::broker::client::{FlowControl, ReceivedMessage};
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe {
        request_id: String,
        subscription: String,
        #[serde(default = "default_max_outstanding")]
        max_outstanding_messages: usize,
    },
    #[serde(rename = "publish")]
    Publish {
        request_id: String,
        topic: String,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
        #[serde(default)]
        attributes: HashMap<String, String>,
    },
    #[serde(rename = "ack")]
    Ack {
        subscription: String,
        ack_id: String,
    },
    #[serde(rename = "nack")]
    Nack {
        subscription: String,
        ack_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "subscribed")]
    Subscribed { request_id: String },
    #[serde(rename = "published")]
    Published {
        request_id: String,
        message_id: String,
    },
    #[serde(rename = "message")]
    Message {
        subscription: String,
        message_id: String,
        ack_id: String,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
        #[serde(default)]
        attributes: HashMap<String, String>,
        publish_time: i64,
        delivery_attempt: u32,
        ack_deadline_ms: u64,
        lease_remaining_ms: u64,
    },
    #[serde(rename = "error")]
    Error {
        request_id: Option<String>,
        error: BrokerError,
    },
}

impl ServerMessage {
    pub fn delivery(subscription: &str, message: ReceivedMessage) -> Self {
        ServerMessage::Message {
            subscription: subscription.to_string(),
            message_id: message.message_id,
            ack_id: message.ack_id,
            payload: message.payload,
            attributes: message.attributes,
            publish_time: message.publish_time,
            delivery_attempt: message.delivery_attempt,
            ack_deadline_ms: millis(message.ack_deadline),
            lease_remaining_ms: millis(
                message
                    .lease_expires_at
                    .saturating_duration_since(Instant::now()),
            ),
        }
    }
}

/// Splits a `message` frame back into its subscription and delivery.
pub fn into_delivery(message: ServerMessage) -> Option<(String, ReceivedMessage)> {
    match message {
        ServerMessage::Message {
            subscription,
            message_id,
            ack_id,
            payload,
            attributes,
            publish_time,
            delivery_attempt,
            ack_deadline_ms,
            lease_remaining_ms,
        } => Some((
            subscription,
            ReceivedMessage {
                message_id,
                ack_id,
                payload,
                attributes,
                publish_time,
                delivery_attempt,
                ack_deadline: Duration::from_millis(ack_deadline_ms),
                lease_expires_at: Instant::now() + Duration::from_millis(lease_remaining_ms),
            },
        )),
        _ => None,
    }
}

fn default_max_outstanding() -> usize {
    FlowControl::DEFAULT_MAX_OUTSTANDING_MESSAGES
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
