//! Error types for the bridge.
//!
//! `BrokerError` is what the broker collaborator reports, `PublishError` is what
//! a caller of the outbound gateway sees and `BridgeError` covers starting and
//! stopping the inbound side. Handler failures never appear here: a handler
//! recovers from its own failure by nacking.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a broker client or the in-memory broker engine.
///
/// The type is serializable so the emulator server can hand the exact error
/// back to a remote client.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The connection dropped while a request was in flight.
    #[error("broker connection lost")]
    Disconnected,

    #[error("topic `{0}` does not exist")]
    TopicNotFound(String),

    #[error("topic `{0}` already exists")]
    TopicAlreadyExists(String),

    #[error("subscription `{0}` does not exist")]
    SubscriptionNotFound(String),

    #[error("subscription `{0}` already exists")]
    SubscriptionAlreadyExists(String),

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// The ack id is not leased, usually because its lease already expired.
    #[error("unknown ack id `{ack_id}` on subscription `{subscription}`")]
    UnknownAckId { subscription: String, ack_id: String },

    #[error("timed out waiting for the broker")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failure of `OutboundGateway::send`. Never retried by the gateway.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors starting the inbound bridge or wiring the application.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge is already running on subscription `{0}`")]
    AlreadyRunning(String),

    #[error("failed to open subscription: {0}")]
    Subscribe(#[from] BrokerError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}
