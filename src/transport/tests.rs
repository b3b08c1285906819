use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::{accept_async, connect_async};
use tungstenite::protocol::Message as WsMessage;

use super::message::{ClientMessage, ServerMessage, into_delivery};
use super::remote::{Command, ConnectionTask, ReconnectPolicy, WebSocketClient};
use super::websocket::serve;
use crate::broker::client::{
    Acknowledger, BrokerClient, ConnectionState, FlowControl, SubscriptionEvent,
};
use crate::broker::{Broker, SharedBroker};
use crate::message::OutboundRequest;
use crate::testing::received;
use crate::utils::error::BrokerError;
use crate::utils::lock;

const WAIT: Duration = Duration::from_secs(2);

fn broker_with_subscription() -> SharedBroker {
    let mut broker = Broker::default();
    broker.create_topic("testTopic").unwrap();
    broker
        .create_subscription("testSubscription", "testTopic", Duration::from_secs(10))
        .unwrap();
    broker.shared()
}

async fn emulator(broker: SharedBroker) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, broker));
    format!("ws://{addr}")
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
    }
}

async fn next_event(events: &mut UnboundedReceiver<SubscriptionEvent>) -> SubscriptionEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("event within timeout")
        .expect("subscription open")
}

#[test]
fn test_publish_frame_encodes_payload_as_base64() {
    let frame = ClientMessage::Publish {
        request_id: "r-1".to_string(),
        topic: "testTopic".to_string(),
        payload: b"hello".to_vec(),
        attributes: HashMap::new(),
    };
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "publish");
    assert_eq!(value["payload"], "aGVsbG8=");

    // attributes are optional on the wire
    let parsed: ClientMessage = serde_json::from_value(json!({
        "type": "publish",
        "request_id": "r-1",
        "topic": "testTopic",
        "payload": "aGVsbG8="
    }))
    .unwrap();
    assert_eq!(parsed, frame);
}

#[test]
fn test_invalid_base64_is_rejected() {
    let result = serde_json::from_value::<ClientMessage>(json!({
        "type": "publish",
        "request_id": "r-1",
        "topic": "testTopic",
        "payload": "not base64!"
    }));
    assert!(result.is_err());
}

#[test]
fn test_delivery_frame_round_trips_into_received_message() {
    let mut message = received("hello");
    message.attributes.insert("origin".to_string(), "test".to_string());
    message.ack_deadline = Duration::from_millis(1500);

    message.lease_expires_at = Instant::now() + Duration::from_millis(1500);

    let frame = ServerMessage::delivery("testSubscription", message.clone());
    let json = serde_json::to_string(&frame).unwrap();
    assert!(json.contains(r#""type":"message""#));
    assert!(json.contains(r#""ack_deadline_ms":1500"#));
    assert!(json.contains(r#""lease_remaining_ms":"#));

    let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
    let (subscription, delivered) = into_delivery(parsed).unwrap();
    assert_eq!(subscription, "testSubscription");
    assert_eq!(delivered.message_id, message.message_id);
    assert_eq!(delivered.ack_id, message.ack_id);
    assert_eq!(delivered.payload, message.payload);
    assert_eq!(delivered.attributes, message.attributes);
    assert_eq!(delivered.delivery_attempt, message.delivery_attempt);
    assert_eq!(delivered.ack_deadline, message.ack_deadline);
    // the remaining lease is carried, not the full deadline
    assert!(delivered.lease_expires_at <= message.lease_expires_at + Duration::from_millis(50));
    assert!(delivered.lease_expires_at > Instant::now() + Duration::from_millis(1000));

    assert!(into_delivery(ServerMessage::Subscribed { request_id: "r".to_string() }).is_none());
}

#[test]
fn test_error_frame_carries_structured_error() {
    let frame = ServerMessage::Error {
        request_id: Some("r-9".to_string()),
        error: BrokerError::TopicNotFound("nope".to_string()),
    };
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "error");
    assert_eq!(value["error"]["kind"], "topic_not_found");
    assert_eq!(value["error"]["detail"], "nope");
}

#[test]
fn test_backoff_doubles_up_to_the_cap() {
    let policy = ReconnectPolicy {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
    };
    assert_eq!(policy.delay(1), Duration::from_millis(100));
    assert_eq!(policy.delay(2), Duration::from_millis(200));
    assert_eq!(policy.delay(4), Duration::from_millis(800));
    assert_eq!(policy.delay(5), Duration::from_secs(1));
    assert_eq!(policy.delay(200), Duration::from_secs(1));
}

#[tokio::test]
async fn test_publish_deliver_and_ack_over_websocket() {
    let broker = broker_with_subscription();
    let url = emulator(broker.clone()).await;
    let client = WebSocketClient::connect(&url, fast_policy(), WAIT).await.unwrap();

    let mut subscriber = client.subscribe("testSubscription", FlowControl::default()).await.unwrap();
    let request = OutboundRequest::new("testTopic", b"hello".to_vec()).with_attribute("k", "v");
    let message_id = client.publish(request).await.unwrap();

    let SubscriptionEvent::Message(delivery) = next_event(&mut subscriber.events).await else {
        panic!("expected a delivery");
    };
    assert_eq!(delivery.message_id, message_id);
    assert_eq!(delivery.payload, b"hello".to_vec());
    assert_eq!(delivery.attributes["k"], "v");
    assert_eq!(delivery.delivery_attempt, 1);
    assert_eq!(delivery.ack_deadline, Duration::from_secs(10));
    assert_eq!(lock(&broker).leased_len("testSubscription"), Some(1));

    subscriber.acker.ack("testSubscription", &delivery.ack_id).unwrap();
    timeout(WAIT, async {
        while lock(&broker).leased_len("testSubscription") != Some(0) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("ack reaches the broker");

    client.close();
}

#[tokio::test]
async fn test_nack_over_websocket_redelivers() {
    let broker = broker_with_subscription();
    let url = emulator(broker.clone()).await;
    let client = WebSocketClient::connect(&url, fast_policy(), WAIT).await.unwrap();
    let mut subscriber = client.subscribe("testSubscription", FlowControl::default()).await.unwrap();
    client
        .publish(OutboundRequest::new("testTopic", b"again".to_vec()))
        .await
        .unwrap();

    let SubscriptionEvent::Message(first) = next_event(&mut subscriber.events).await else {
        panic!("expected a delivery");
    };
    subscriber.acker.nack("testSubscription", &first.ack_id).unwrap();

    let SubscriptionEvent::Message(second) = next_event(&mut subscriber.events).await else {
        panic!("expected a redelivery");
    };
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.delivery_attempt, 2);
    assert_ne!(second.ack_id, first.ack_id);
}

#[tokio::test]
async fn test_broker_rejections_reach_the_caller() {
    let url = emulator(broker_with_subscription()).await;
    let client = WebSocketClient::connect(&url, fast_policy(), WAIT).await.unwrap();

    let err = client.subscribe("missing", FlowControl::default()).await.unwrap_err();
    assert_eq!(err, BrokerError::SubscriptionNotFound("missing".to_string()));

    let err = client
        .publish(OutboundRequest::new("missing", b"x".to_vec()))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::TopicNotFound("missing".to_string()));
}

#[tokio::test]
async fn test_connect_to_nothing_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = WebSocketClient::connect(&format!("ws://{addr}"), fast_policy(), WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Connection(_)));
}

#[tokio::test]
async fn test_unanswered_publish_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        // read and ignore everything
        while let Some(Ok(_)) = ws.next().await {}
    });

    let client = WebSocketClient::connect(&format!("ws://{addr}"), fast_policy(), Duration::from_millis(50))
        .await
        .unwrap();
    let err = client
        .publish(OutboundRequest::new("testTopic", b"x".to_vec()))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::Timeout);
}

#[tokio::test]
async fn test_server_answers_garbage_with_protocol_error() {
    let url = emulator(broker_with_subscription()).await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(WsMessage::text("{\"type\":\"teleport\"}")).await.unwrap();

    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let parsed: ServerMessage = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert!(matches!(
        parsed,
        ServerMessage::Error {
            request_id: None,
            error: BrokerError::Protocol(_)
        }
    ));
}

#[tokio::test]
async fn test_client_reconnects_and_resubscribes() {
    let broker = broker_with_subscription();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    // The first connection answers the subscribe and then drops; after that
    // the real emulator takes over the same listener.
    let server_broker = broker.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            let Ok(ClientMessage::Subscribe { request_id, .. }) =
                serde_json::from_str::<ClientMessage>(msg.to_text().unwrap())
            else {
                continue;
            };
            let reply = serde_json::to_string(&ServerMessage::Subscribed { request_id }).unwrap();
            ws.send(WsMessage::text(reply)).await.unwrap();
            break;
        }
        drop(ws);
        serve(listener, server_broker).await;
    });

    let client = WebSocketClient::connect(&url, fast_policy(), WAIT).await.unwrap();
    let mut subscriber = client.subscribe("testSubscription", FlowControl::default()).await.unwrap();

    let mut states = Vec::new();
    while states.last() != Some(&ConnectionState::Connected) {
        match next_event(&mut subscriber.events).await {
            SubscriptionEvent::Connection(state) => states.push(state),
            SubscriptionEvent::Message(_) => panic!("no deliveries expected yet"),
        }
    }
    assert_eq!(states[0], ConnectionState::Disconnected);
    assert_eq!(states[1], ConnectionState::Reconnecting { attempt: 1 });

    let message_id = client
        .publish(OutboundRequest::new("testTopic", b"after".to_vec()))
        .await
        .unwrap();
    let SubscriptionEvent::Message(delivery) = next_event(&mut subscriber.events).await else {
        panic!("expected a delivery after resubscribing");
    };
    assert_eq!(delivery.message_id, message_id);
    assert_eq!(delivery.payload, b"after".to_vec());
}

#[tokio::test]
async fn test_close_ends_subscription_streams() {
    let url = emulator(broker_with_subscription()).await;
    let client = WebSocketClient::connect(&url, fast_policy(), WAIT).await.unwrap();
    let mut subscriber = client.subscribe("testSubscription", FlowControl::default()).await.unwrap();

    client.close();
    let end = timeout(WAIT, subscriber.events.recv()).await.unwrap();
    assert!(end.is_none());
    assert_eq!(
        client.publish(OutboundRequest::new("testTopic", b"x".to_vec())).await,
        Err(BrokerError::Disconnected)
    );
}

#[test]
fn test_subscribe_frame_carries_flow_control() {
    let frame = ClientMessage::Subscribe {
        request_id: "r-2".to_string(),
        subscription: "testSubscription".to_string(),
        max_outstanding_messages: 1,
    };
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["max_outstanding_messages"], 1);

    let parsed: ClientMessage = serde_json::from_value(json!({
        "type": "subscribe",
        "request_id": "r-2",
        "subscription": "testSubscription"
    }))
    .unwrap();
    let ClientMessage::Subscribe {
        max_outstanding_messages,
        ..
    } = parsed
    else {
        panic!("expected a subscribe frame");
    };
    assert_eq!(
        max_outstanding_messages,
        FlowControl::default().max_outstanding_messages
    );
}

#[tokio::test]
async fn test_abandoned_publishes_are_forgotten() {
    let (_commands, command_rx) = mpsc::unbounded_channel();
    let mut task = ConnectionTask::new("ws://127.0.0.1:1", fast_policy(), command_rx);

    // a caller that already gave up waiting
    let (reply, abandoned) = oneshot::channel();
    drop(abandoned);
    let frame = task.outgoing(Some(Command::Publish {
        request: OutboundRequest::new("testTopic", b"late".to_vec()),
        reply,
    }));
    assert!(matches!(frame, Some(ClientMessage::Publish { .. })));
    assert_eq!(task.pending_publishes(), 1);

    let (reply, _waiting) = oneshot::channel();
    task.outgoing(Some(Command::Publish {
        request: OutboundRequest::new("testTopic", b"fresh".to_vec()),
        reply,
    }));
    assert_eq!(task.pending_publishes(), 1);
}
