//! Fixtures shared by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::broker::client::{Acknowledger, ReceivedMessage};
use crate::message::{AckHandle, InboundMessage};
use crate::utils::error::BrokerError;

/// Records every resolution it is asked to forward.
#[derive(Default)]
pub struct RecordingAcker {
    pub calls: Mutex<Vec<(&'static str, String, String)>>,
}

impl RecordingAcker {
    pub fn calls(&self) -> Vec<(&'static str, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Acknowledger for RecordingAcker {
    fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), BrokerError> {
        self.calls
            .lock()
            .unwrap()
            .push(("ack", subscription.to_string(), ack_id.to_string()));
        Ok(())
    }

    fn nack(&self, subscription: &str, ack_id: &str) -> Result<(), BrokerError> {
        self.calls
            .lock()
            .unwrap()
            .push(("nack", subscription.to_string(), ack_id.to_string()));
        Ok(())
    }
}

pub fn received(payload: &str) -> ReceivedMessage {
    ReceivedMessage {
        message_id: "m-1".to_string(),
        ack_id: "ack-42".to_string(),
        payload: payload.as_bytes().to_vec(),
        attributes: HashMap::new(),
        publish_time: 1_725_000_000_000,
        delivery_attempt: 1,
        ack_deadline: Duration::from_secs(60),
        lease_expires_at: Instant::now() + Duration::from_secs(60),
    }
}

pub fn inbound(payload: &str, acker: Arc<RecordingAcker>) -> Arc<InboundMessage> {
    let handle = AckHandle::new(
        "delivery-1",
        "testSubscription",
        "ack-42",
        Instant::now() + Duration::from_secs(60),
        acker,
    );
    Arc::new(InboundMessage::new(received(payload), handle))
}
