//! WebSocket emulator server
//!
//! Puts a `SharedBroker` behind a WebSocket endpoint. Responsibilities:
//! - Accept TCP/WebSocket connections, one task per connection
//! - Translate protocol JSON into broker operations and answer requests
//! - Forward deliveries of every subscription a connection opened
//!
//! Each connection has a writer task fed by an unbounded channel, so broker
//! calls never wait on the socket. When a connection goes away its
//! subscriptions are dropped; unacked deliveries come back once their leases
//! expire.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::client::{FlowControl, SubscriptionEvent};
use crate::broker::engine::SharedBroker;
use crate::message::OutboundRequest;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::BrokerError;
use crate::utils::lock;

pub async fn start_websocket_server(addr: &str, broker: SharedBroker) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Emulator listening on ws://{}", listener.local_addr()?);
    serve(listener, broker).await;
    Ok(())
}

/// Accepts connections on `listener` until accepting fails.
pub async fn serve(listener: TcpListener, broker: SharedBroker) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                spawn(handle_connection(stream, broker.clone()));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                return;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, broker: SharedBroker) {
    let conn_id = format!("conn-{}", Uuid::new_v4());
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    info!("{conn_id} connected");

    let writer = {
        let conn_id = conn_id.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("Failed to send message to {conn_id}: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        })
    };

    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();

    while let Some(Ok(msg)) = ws_receiver.next().await {
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };

        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Subscribe {
                request_id,
                subscription,
                max_outstanding_messages,
            }) => {
                let flow = FlowControl::new(max_outstanding_messages);
                let attached = lock(&broker).attach(&subscription, flow);
                match attached {
                    Ok(events) => {
                        reply(&tx, &ServerMessage::Subscribed { request_id });
                        forwarders.push(spawn(forward_deliveries(
                            subscription.clone(),
                            events,
                            tx.clone(),
                        )));
                        info!("{conn_id} subscribed to {subscription}");
                    }
                    Err(error) => {
                        warn!("{conn_id} failed to subscribe to {subscription}: {error}");
                        reply(
                            &tx,
                            &ServerMessage::Error {
                                request_id: Some(request_id),
                                error,
                            },
                        );
                    }
                }
            }
            Ok(ClientMessage::Publish {
                request_id,
                topic,
                payload,
                attributes,
            }) => {
                let result = lock(&broker).publish(OutboundRequest {
                    payload,
                    attributes,
                    destination_topic: topic,
                });
                let response = match result {
                    Ok(message_id) => ServerMessage::Published {
                        request_id,
                        message_id,
                    },
                    Err(error) => ServerMessage::Error {
                        request_id: Some(request_id),
                        error,
                    },
                };
                reply(&tx, &response);
            }
            Ok(ClientMessage::Ack {
                subscription,
                ack_id,
            }) => {
                let result = lock(&broker).ack(&subscription, &ack_id);
                report(&tx, &conn_id, result);
            }
            Ok(ClientMessage::Nack {
                subscription,
                ack_id,
            }) => {
                let result = lock(&broker).nack(&subscription, &ack_id);
                report(&tx, &conn_id, result);
            }
            Err(err) => {
                warn!(
                    "Invalid client message from {conn_id}: {err} | {}",
                    &text.chars().take(100).collect::<String>()
                );
                reply(
                    &tx,
                    &ServerMessage::Error {
                        request_id: None,
                        error: BrokerError::Protocol(err.to_string()),
                    },
                );
            }
        }
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
    drop(tx);
    let _ = writer.await;
    info!("{conn_id} disconnected");
}

async fn forward_deliveries(
    subscription: String,
    mut events: UnboundedReceiver<SubscriptionEvent>,
    tx: UnboundedSender<WsMessage>,
) {
    while let Some(event) = events.recv().await {
        let SubscriptionEvent::Message(message) = event else {
            continue;
        };
        let frame = ServerMessage::delivery(&subscription, message);
        if !reply(&tx, &frame) {
            break;
        }
    }
}

/// Queues `message` for the connection's writer. Returns `false` once the
/// writer is gone.
fn reply(tx: &UnboundedSender<WsMessage>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => tx.send(WsMessage::text(json)).is_ok(),
        Err(e) => {
            error!("Failed to serialize server message: {e}");
            true
        }
    }
}

fn report(tx: &UnboundedSender<WsMessage>, conn_id: &str, result: Result<(), BrokerError>) {
    if let Err(error) = result {
        warn!("{conn_id}: {error}");
        reply(
            tx,
            &ServerMessage::Error {
                request_id: None,
                error,
            },
        );
    }
}
