use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::ack::{AckHandle, AckState, AckTracker};
use super::inbound::InboundMessage;
use super::outbound::{Json, OutboundRequest, ToPayload};
use crate::broker::client::ReceivedMessage;
use crate::broker::{Broker, LocalClient};
use crate::testing::RecordingAcker;

fn handle_with(acker: Arc<RecordingAcker>, deadline: Instant) -> AckHandle {
    AckHandle::new("delivery-1", "testSubscription", "ack-42", deadline, acker)
}

fn in_a_minute() -> Instant {
    Instant::now() + Duration::from_secs(60)
}

#[test]
fn test_ack_forwards_the_native_token() {
    let acker = Arc::new(RecordingAcker::default());
    let handle = handle_with(acker.clone(), in_a_minute());

    assert_eq!(handle.state(), AckState::Pending);
    assert!(handle.ack());
    assert_eq!(handle.state(), AckState::Acked);

    assert_eq!(
        acker.calls(),
        vec![("ack", "testSubscription".to_string(), "ack-42".to_string())]
    );
}

#[test]
fn test_second_resolution_is_ignored() {
    let acker = Arc::new(RecordingAcker::default());
    let handle = handle_with(acker.clone(), in_a_minute());

    assert!(handle.nack());
    assert!(!handle.ack());
    assert!(!handle.nack());
    assert_eq!(handle.state(), AckState::Nacked);
    assert_eq!(acker.calls().len(), 1);
    assert_eq!(acker.calls()[0].0, "nack");
}

#[test]
fn test_clones_share_state() {
    let acker = Arc::new(RecordingAcker::default());
    let handle = handle_with(acker.clone(), in_a_minute());
    let clone = handle.clone();

    assert!(clone.ack());
    assert_eq!(handle.state(), AckState::Acked);
    assert!(!handle.ack());
}

#[test]
fn test_handle_past_deadline_is_expired() {
    let acker = Arc::new(RecordingAcker::default());
    let handle = handle_with(acker.clone(), Instant::now());

    assert_eq!(handle.state(), AckState::Expired);
    assert!(!handle.ack());
    assert!(acker.calls().is_empty());
}

#[test]
fn test_tracker_forgets_resolved_and_expired_handles() {
    let acker: Arc<RecordingAcker> = Arc::new(RecordingAcker::default());
    let tracker = Arc::new(AckTracker::new());

    let first = AckHandle::tracked(
        "d1".to_string(),
        "sub".to_string(),
        "a1".to_string(),
        in_a_minute(),
        acker.clone(),
        tracker.clone(),
    );
    let _second = AckHandle::tracked(
        "d2".to_string(),
        "sub".to_string(),
        "a2".to_string(),
        in_a_minute(),
        acker.clone(),
        tracker.clone(),
    );
    let _expired = AckHandle::tracked(
        "d3".to_string(),
        "sub".to_string(),
        "a3".to_string(),
        Instant::now(),
        acker,
        tracker.clone(),
    );

    assert_eq!(tracker.outstanding(), 2);
    first.ack();
    assert_eq!(tracker.outstanding(), 1);
}

#[test]
fn test_inbound_message_exposes_delivery() {
    let acker = Arc::new(RecordingAcker::default());
    let handle = handle_with(acker, in_a_minute());
    let mut attributes = HashMap::new();
    attributes.insert("origin".to_string(), "test".to_string());

    let message = InboundMessage::new(
        ReceivedMessage {
            message_id: "m-1".to_string(),
            ack_id: "ack-42".to_string(),
            payload: b"hello".to_vec(),
            attributes,
            publish_time: 1_725_000_000_000,
            delivery_attempt: 2,
            ack_deadline: Duration::from_secs(10),
            lease_expires_at: Instant::now() + Duration::from_secs(10),
        },
        handle,
    );

    assert_eq!(message.delivery_id(), "delivery-1");
    assert_eq!(message.subscription(), "testSubscription");
    assert_eq!(message.message_id(), "m-1");
    assert_eq!(message.payload_str(), Some("hello"));
    assert_eq!(message.attribute("origin"), Some("test"));
    assert_eq!(message.delivery_attempt(), 2);
    assert_eq!(message.ack_handle().ack_id(), "ack-42");
}

#[test]
fn test_payload_conversions() {
    assert_eq!("hello".to_payload().unwrap(), b"hello".to_vec());
    assert_eq!(vec![0u8, 159, 146].to_payload().unwrap(), vec![0u8, 159, 146]);

    #[derive(serde::Serialize)]
    struct Reading {
        temp: i32,
    }
    let bytes = Json(Reading { temp: 25 }).to_payload().unwrap();
    assert_eq!(bytes, br#"{"temp":25}"#.to_vec());
}

#[test]
fn test_outbound_request_builder() {
    let request = OutboundRequest::new("testTopic", b"x".to_vec()).with_attribute("k", "v");
    assert_eq!(request.destination_topic, "testTopic");
    assert_eq!(request.attributes.get("k").map(String::as_str), Some("v"));
}

#[test]
fn test_ack_after_broker_lease_loss_reads_expired() {
    let mut broker = Broker::default();
    broker.create_topic("testTopic").unwrap();
    broker
        .create_subscription("testSubscription", "testTopic", Duration::from_secs(60))
        .unwrap();
    let client = LocalClient::new(broker.shared());

    // the broker has never leased this token
    let handle = AckHandle::new(
        "delivery-1",
        "testSubscription",
        "stale-ack-id",
        in_a_minute(),
        Arc::new(client),
    );
    assert!(!handle.ack());
    assert_eq!(handle.state(), AckState::Expired);
    assert!(!handle.nack());
}
