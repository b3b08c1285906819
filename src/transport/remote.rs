//! Remote broker client
//!
//! `WebSocketClient` speaks the emulator protocol over a single connection
//! owned by a background task. Callers talk to that task through a command
//! channel and get answers back on oneshot channels keyed by request id.
//!
//! Connection handling:
//! - The first connection is made in `connect`; failing it is a startup error.
//! - When the connection drops, every request in flight fails with
//!   `BrokerError::Disconnected` and every open subscription receives
//!   `ConnectionState::Disconnected`.
//! - The task then reconnects with exponential backoff, reporting each
//!   `Reconnecting { attempt }`, and re-subscribes everything once it is back.
//! - While disconnected, publishes and subscribes fail right away and acks
//!   are dropped; the broker redelivers those messages after their lease.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::client::{
    Acknowledger, BrokerClient, ConnectionState, FlowControl, Subscriber, SubscriptionEvent,
};
use crate::message::OutboundRequest;
use crate::transport::message::{ClientMessage, ServerMessage, into_delivery};
use crate::utils::error::BrokerError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// capped at `max_backoff`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub(super) enum Command {
    Subscribe {
        subscription: String,
        flow: FlowControl,
        events: UnboundedSender<SubscriptionEvent>,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Publish {
        request: OutboundRequest,
        reply: oneshot::Sender<Result<String, BrokerError>>,
    },
    Ack {
        subscription: String,
        ack_id: String,
    },
    Nack {
        subscription: String,
        ack_id: String,
    },
    Close,
}

#[derive(Debug, Clone)]
pub struct WebSocketClient {
    url: Arc<str>,
    commands: UnboundedSender<Command>,
    publish_timeout: Duration,
}

impl WebSocketClient {
    /// Connects to the emulator at `url` and starts the connection task.
    pub async fn connect(
        url: &str,
        policy: ReconnectPolicy,
        publish_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| BrokerError::Connection(format!("{url}: {e}")))?;
        info!(url = %url, "Connected to broker");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask::new(url, policy, command_rx);
        tokio::spawn(task.run(ws));

        Ok(Self {
            url: Arc::from(url),
            commands,
            publish_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Closes the connection. Open subscriptions see their stream end.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    fn send(&self, command: Command) -> Result<(), BrokerError> {
        self.commands
            .send(command)
            .map_err(|_| BrokerError::Disconnected)
    }
}

#[async_trait]
impl BrokerClient for WebSocketClient {
    async fn subscribe(
        &self,
        subscription: &str,
        flow: FlowControl,
    ) -> Result<Subscriber, BrokerError> {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Subscribe {
            subscription: subscription.to_string(),
            flow,
            events,
            reply,
        })?;
        reply_rx.await.map_err(|_| BrokerError::Disconnected)??;

        Ok(Subscriber {
            subscription: subscription.to_string(),
            events: event_rx,
            acker: Arc::new(self.clone()),
        })
    }

    async fn publish(&self, request: OutboundRequest) -> Result<String, BrokerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Publish { request, reply })?;
        match tokio::time::timeout(self.publish_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Disconnected),
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}

impl Acknowledger for WebSocketClient {
    fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), BrokerError> {
        self.send(Command::Ack {
            subscription: subscription.to_string(),
            ack_id: ack_id.to_string(),
        })
    }

    fn nack(&self, subscription: &str, ack_id: &str) -> Result<(), BrokerError> {
        self.send(Command::Nack {
            subscription: subscription.to_string(),
            ack_id: ack_id.to_string(),
        })
    }
}

enum SessionEnd {
    Closed,
    Lost,
}

/// A re-subscribe after reconnecting has nobody waiting for the answer.
type SubscribeReply = Option<oneshot::Sender<Result<(), BrokerError>>>;

struct OpenSubscription {
    events: UnboundedSender<SubscriptionEvent>,
    flow: FlowControl,
}

pub(super) struct ConnectionTask {
    url: String,
    policy: ReconnectPolicy,
    commands: UnboundedReceiver<Command>,
    subscriptions: HashMap<String, OpenSubscription>,
    pending_subscribes: HashMap<String, (String, SubscribeReply)>,
    pending_publishes: HashMap<String, oneshot::Sender<Result<String, BrokerError>>>,
}

impl ConnectionTask {
    pub(super) fn new(
        url: &str,
        policy: ReconnectPolicy,
        commands: UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            url: url.to_string(),
            policy,
            commands,
            subscriptions: HashMap::new(),
            pending_subscribes: HashMap::new(),
            pending_publishes: HashMap::new(),
        }
    }

    async fn run(mut self, mut ws: WsStream) {
        loop {
            if let SessionEnd::Closed = self.session(ws).await {
                break;
            }

            warn!(url = %self.url, "Broker connection lost");
            self.fail_pending();
            self.broadcast(ConnectionState::Disconnected);

            ws = match self.reconnect().await {
                Some(ws) => ws,
                None => break,
            };
            info!(url = %self.url, "Reconnected to broker");
            self.broadcast(ConnectionState::Connected);
        }

        self.fail_pending();
        debug!(url = %self.url, "Connection task finished");
    }

    /// Retries until connected. Returns `None` if the client was closed meanwhile.
    async fn reconnect(&mut self) -> Option<WsStream> {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            self.broadcast(ConnectionState::Reconnecting { attempt });

            let sleep = tokio::time::sleep(self.policy.delay(attempt));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => {
                        if !self.reject_while_disconnected(command) {
                            return None;
                        }
                    }
                }
            }

            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => return Some(ws),
                Err(e) => warn!(url = %self.url, attempt, error = %e, "Reconnect failed"),
            }
        }
    }

    /// Answers a command received while there is no connection. Returns
    /// `false` if the client asked to close.
    fn reject_while_disconnected(&mut self, command: Option<Command>) -> bool {
        match command {
            None | Some(Command::Close) => false,
            Some(Command::Subscribe { reply, .. }) => {
                let _ = reply.send(Err(BrokerError::Disconnected));
                true
            }
            Some(Command::Publish { reply, .. }) => {
                let _ = reply.send(Err(BrokerError::Disconnected));
                true
            }
            Some(Command::Ack { ack_id, .. }) | Some(Command::Nack { ack_id, .. }) => {
                debug!(ack_id = %ack_id, "Dropping resolution while disconnected");
                true
            }
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut source): (WsSink, WsSource) = ws.split();

        let open: Vec<(String, FlowControl)> = self
            .subscriptions
            .iter()
            .map(|(name, open)| (name.clone(), open.flow))
            .collect();
        for (subscription, flow) in open {
            let request_id = Uuid::new_v4().to_string();
            self.pending_subscribes
                .insert(request_id.clone(), (subscription.clone(), None));
            let frame = ClientMessage::Subscribe {
                request_id,
                subscription,
                max_outstanding_messages: flow.max_outstanding_messages,
            };
            if !write(&mut sink, &frame).await {
                return SessionEnd::Lost;
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(frame) = self.outgoing(command) else {
                        let _ = sink.close().await;
                        return SessionEnd::Closed;
                    };
                    if !write(&mut sink, &frame).await {
                        return SessionEnd::Lost;
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(msg)) if msg.is_text() => {
                            if let Ok(text) = msg.to_text() {
                                self.incoming(text);
                            }
                        }
                        Some(Ok(msg)) if msg.is_close() => return SessionEnd::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "WebSocket read failed");
                            return SessionEnd::Lost;
                        }
                        None => return SessionEnd::Lost,
                    }
                }
            }
        }
    }

    /// Turns a command into the frame to write, registering whatever waits
    /// for the answer. `None` means the client is closing.
    pub(super) fn outgoing(&mut self, command: Option<Command>) -> Option<ClientMessage> {
        let frame = match command? {
            Command::Close => return None,
            Command::Subscribe {
                subscription,
                flow,
                events,
                reply,
            } => {
                let request_id = Uuid::new_v4().to_string();
                self.subscriptions
                    .insert(subscription.clone(), OpenSubscription { events, flow });
                self.pending_subscribes
                    .insert(request_id.clone(), (subscription.clone(), Some(reply)));
                ClientMessage::Subscribe {
                    request_id,
                    subscription,
                    max_outstanding_messages: flow.max_outstanding_messages,
                }
            }
            Command::Publish { request, reply } => {
                // callers that timed out have dropped their receiver
                self.pending_publishes.retain(|_, waiting| !waiting.is_closed());
                let request_id = Uuid::new_v4().to_string();
                self.pending_publishes.insert(request_id.clone(), reply);
                ClientMessage::Publish {
                    request_id,
                    topic: request.destination_topic,
                    payload: request.payload,
                    attributes: request.attributes,
                }
            }
            Command::Ack {
                subscription,
                ack_id,
            } => ClientMessage::Ack {
                subscription,
                ack_id,
            },
            Command::Nack {
                subscription,
                ack_id,
            } => ClientMessage::Nack {
                subscription,
                ack_id,
            },
        };
        Some(frame)
    }

    fn incoming(&mut self, text: &str) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Unreadable server message");
                return;
            }
        };

        match message {
            ServerMessage::Subscribed { request_id } => {
                if let Some((subscription, reply)) = self.pending_subscribes.remove(&request_id) {
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(Ok(()));
                        }
                        None => info!(subscription = %subscription, "Re-subscribed"),
                    }
                }
            }
            ServerMessage::Published {
                request_id,
                message_id,
            } => {
                if let Some(reply) = self.pending_publishes.remove(&request_id) {
                    let _ = reply.send(Ok(message_id));
                }
            }
            ServerMessage::Error {
                request_id: Some(request_id),
                error,
            } => {
                if let Some(reply) = self.pending_publishes.remove(&request_id) {
                    let _ = reply.send(Err(error));
                } else if let Some((subscription, reply)) =
                    self.pending_subscribes.remove(&request_id)
                {
                    self.subscriptions.remove(&subscription);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(Err(error));
                        }
                        None => {
                            error!(subscription = %subscription, error = %error, "Re-subscribe failed; subscription closed")
                        }
                    }
                }
            }
            ServerMessage::Error {
                request_id: None,
                error,
            } => warn!(error = %error, "Broker reported an error"),
            delivery @ ServerMessage::Message { .. } => {
                let Some((subscription, received)) = into_delivery(delivery) else {
                    return;
                };
                match self.subscriptions.get(&subscription) {
                    Some(open) => {
                        if open.events.send(SubscriptionEvent::Message(received)).is_err() {
                            debug!(subscription = %subscription, "Subscriber went away");
                            self.subscriptions.remove(&subscription);
                        }
                    }
                    None => debug!(subscription = %subscription, "Delivery for a closed subscription"),
                }
            }
        }
    }

    fn broadcast(&mut self, state: ConnectionState) {
        self.subscriptions
            .retain(|_, open| open.events.send(SubscriptionEvent::Connection(state)).is_ok());
    }

    /// Publish requests still waiting for the broker's answer.
    pub(super) fn pending_publishes(&self) -> usize {
        self.pending_publishes.len()
    }

    fn fail_pending(&mut self) {
        for (_, reply) in self.pending_publishes.drain() {
            let _ = reply.send(Err(BrokerError::Disconnected));
        }
        for (_, (_, reply)) in self.pending_subscribes.drain() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(BrokerError::Disconnected));
            }
        }
    }
}

async fn write(sink: &mut WsSink, frame: &ClientMessage) -> bool {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "Failed to serialize client message");
            return true;
        }
    };
    match sink.send(WsMessage::text(json)).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "WebSocket write failed");
            false
        }
    }
}
