//! Inbound bridge
//!
//! `InboundBridge` opens a broker subscription and turns every delivery into
//! exactly one `InboundMessage` on a delivery channel. Acknowledgement is
//! manual: the bridge never acks or nacks, it only tracks which handles are
//! still outstanding. Stopping the bridge leaves those handles alone; they get
//! resolved by their handlers or expire and are redelivered by the broker.
//!
//! The bridge state is observable through a `watch` channel so a lost broker
//! connection shows up as `Reconnecting` or `Disconnected` instead of a silent
//! stall. A receive loop that dies on a panic leaves the bridge `Failed`.
//!
//! The broker is asked for no more open leases than the channel can work on
//! at once, and every handle shares the broker's lease deadline. A message
//! that waits in the broker's backlog therefore does not lose lease time.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::client::{
    BrokerClient, ConnectionState, FlowControl, Subscriber, SubscriptionEvent,
};
use crate::channel::DeliveryChannel;
use crate::message::InboundMessage;
use crate::message::ack::{AckHandle, AckTracker};
use crate::utils::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not started yet.
    Idle,
    Running,
    Reconnecting { attempt: u32 },
    /// The broker connection is gone and nothing is being delivered.
    Disconnected,
    /// The receive loop died unexpectedly; nothing is being delivered.
    Failed,
    Stopped,
}

pub struct InboundBridge {
    client: Arc<dyn BrokerClient>,
    tracker: Arc<AckTracker>,
    state: Arc<watch::Sender<BridgeState>>,
    running: Option<Running>,
}

struct Running {
    subscription: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl InboundBridge {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        let (state, _) = watch::channel(BridgeState::Idle);
        Self {
            client,
            tracker: Arc::new(AckTracker::new()),
            state: Arc::new(state),
            running: None,
        }
    }

    /// Opens `subscription` and starts delivering onto `channel_name` of
    /// `channel`. Fails if the subscription cannot be opened, which callers
    /// should treat as fatal at startup.
    pub async fn start(
        &mut self,
        subscription: &str,
        channel: Arc<DeliveryChannel>,
        channel_name: impl Into<String>,
    ) -> Result<(), BridgeError> {
        if let Some(running) = &self.running {
            return Err(BridgeError::AlreadyRunning(running.subscription.clone()));
        }

        let channel_name = channel_name.into();
        let flow = FlowControl::new(channel.max_outstanding());
        let subscriber = self.client.subscribe(subscription, flow).await?;
        if channel.handler_count(&channel_name) == 0 {
            warn!(
                subscription = %subscription,
                channel = %channel_name,
                "No handlers on the output channel; deliveries will expire and be redelivered"
            );
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        self.state.send_replace(BridgeState::Running);
        let worker = tokio::spawn(receive_loop(
            subscriber,
            channel,
            channel_name.clone(),
            self.tracker.clone(),
            self.state.clone(),
            shutdown_rx,
        ));
        let task = tokio::spawn(supervise(
            subscription.to_string(),
            worker,
            self.state.clone(),
        ));

        info!(
            subscription = %subscription,
            channel = %channel_name,
            max_outstanding = flow.max_outstanding_messages,
            "Inbound bridge started"
        );
        self.running = Some(Running {
            subscription: subscription.to_string(),
            shutdown,
            task,
        });
        Ok(())
    }

    /// Stops accepting deliveries and waits for the receive loop to finish the
    /// message it is currently dispatching.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
            if let Err(e) = running.task.await {
                warn!(subscription = %running.subscription, error = %e, "Receive loop ended abnormally");
            }
            info!(
                subscription = %running.subscription,
                outstanding = self.tracker.outstanding(),
                "Inbound bridge stopped"
            );
        }
        self.state.send_replace(BridgeState::Stopped);
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Deliveries whose handles are still pending and within their lease.
    pub fn outstanding(&self) -> usize {
        self.tracker.outstanding()
    }

    pub fn subscription(&self) -> Option<&str> {
        self.running.as_ref().map(|r| r.subscription.as_str())
    }
}

impl Drop for InboundBridge {
    // Dropping the shutdown sender ends the receive loop.
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}

impl std::fmt::Debug for InboundBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundBridge")
            .field("subscription", &self.subscription())
            .field("state", &self.state())
            .finish()
    }
}

pub(super) async fn supervise(
    subscription: String,
    worker: JoinHandle<()>,
    state: Arc<watch::Sender<BridgeState>>,
) {
    match worker.await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            error!(subscription = %subscription, error = %e, "Receive loop panicked; bridge failed");
            state.send_replace(BridgeState::Failed);
        }
        Err(e) => debug!(subscription = %subscription, error = %e, "Receive loop cancelled"),
    }
}

async fn receive_loop(
    mut subscriber: Subscriber,
    channel: Arc<DeliveryChannel>,
    channel_name: String,
    tracker: Arc<AckTracker>,
    state: Arc<watch::Sender<BridgeState>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let subscription = subscriber.subscription.clone();

    loop {
        let event = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = subscriber.events.recv() => event,
        };

        match event {
            Some(SubscriptionEvent::Message(received)) => {
                if received.lease_expires_at <= Instant::now() {
                    debug!(
                        subscription = %subscription,
                        message_id = %received.message_id,
                        "Delivery arrived after its lease ran out; skipped"
                    );
                    continue;
                }
                let handle = AckHandle::tracked(
                    Uuid::new_v4().to_string(),
                    subscription.clone(),
                    received.ack_id.clone(),
                    received.lease_expires_at,
                    subscriber.acker.clone(),
                    tracker.clone(),
                );
                let message = Arc::new(InboundMessage::new(received, handle));
                debug!(
                    subscription = %subscription,
                    delivery_id = %message.delivery_id(),
                    message_id = %message.message_id(),
                    "Delivery received"
                );
                channel.dispatch(&channel_name, message).await;
            }
            Some(SubscriptionEvent::Connection(connection)) => {
                let next = match connection {
                    ConnectionState::Connected => {
                        info!(subscription = %subscription, "Broker connection established");
                        BridgeState::Running
                    }
                    ConnectionState::Reconnecting { attempt } => {
                        warn!(subscription = %subscription, attempt, "Reconnecting to broker");
                        BridgeState::Reconnecting { attempt }
                    }
                    ConnectionState::Disconnected => {
                        warn!(subscription = %subscription, "Broker connection lost");
                        BridgeState::Disconnected
                    }
                };
                state.send_replace(next);
            }
            None => {
                error!(subscription = %subscription, "Delivery stream ended; no further messages will arrive");
                state.send_replace(BridgeState::Disconnected);
                return;
            }
        }
    }

    debug!(subscription = %subscription, "Receive loop stopped");
}
