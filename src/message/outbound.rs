//! Outbound envelopes
//!
//! `ToPayload` decides how an application value becomes message bytes: text
//! and byte buffers are sent as-is, anything wrapped in `Json` goes through
//! `serde_json`.

use std::collections::HashMap;

use serde::Serialize;

use crate::utils::error::PublishError;

/// A single publish to a broker topic. Built per send call and not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub destination_topic: String,
}

impl OutboundRequest {
    pub fn new(destination_topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            payload,
            attributes: HashMap::new(),
            destination_topic: destination_topic.into(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Broker acceptance of a publish. Says nothing about downstream processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    pub topic: String,
}

/// Conversion of an application value into message payload bytes.
pub trait ToPayload {
    fn to_payload(&self) -> Result<Vec<u8>, PublishError>;
}

impl ToPayload for str {
    fn to_payload(&self) -> Result<Vec<u8>, PublishError> {
        Ok(self.as_bytes().to_vec())
    }
}

impl ToPayload for String {
    fn to_payload(&self) -> Result<Vec<u8>, PublishError> {
        self.as_str().to_payload()
    }
}

impl ToPayload for [u8] {
    fn to_payload(&self) -> Result<Vec<u8>, PublishError> {
        Ok(self.to_vec())
    }
}

impl ToPayload for Vec<u8> {
    fn to_payload(&self) -> Result<Vec<u8>, PublishError> {
        Ok(self.clone())
    }
}

impl<T: ToPayload + ?Sized> ToPayload for &T {
    fn to_payload(&self) -> Result<Vec<u8>, PublishError> {
        (**self).to_payload()
    }
}

/// Sends the wrapped value as a JSON document.
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

impl<T: Serialize> ToPayload for Json<T> {
    fn to_payload(&self) -> Result<Vec<u8>, PublishError> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}
