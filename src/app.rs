//! Application wiring
//!
//! Builds the sample pipeline from `Settings`: an input delivery channel with
//! `LogAndAck` on it, an inbound bridge feeding that channel from the configured
//! subscription, and an outbound gateway publishing to the configured topic.

use std::sync::Arc;

use tracing::info;

use crate::bridge::{InboundBridge, OutboundGateway};
use crate::broker::client::BrokerClient;
use crate::broker::engine::SharedBroker;
use crate::channel::{DeliveryChannel, LogAndAck};
use crate::config::Settings;
use crate::utils::error::{BridgeError, BrokerError};
use crate::utils::lock;

pub struct Application {
    bridge: InboundBridge,
    gateway: OutboundGateway,
    channel: Arc<DeliveryChannel>,
}

impl Application {
    /// Wires the default pipeline, logging and acking every inbound message.
    pub async fn start(
        settings: &Settings,
        client: Arc<dyn BrokerClient>,
    ) -> Result<Self, BridgeError> {
        let mut channel = DeliveryChannel::with_mode(settings.dispatch_mode());
        channel.register(settings.bridge.input_channel.clone(), LogAndAck);
        Self::start_with_channel(settings, client, channel).await
    }

    /// Like `start`, with handlers registered by the caller on `channel`.
    pub async fn start_with_channel(
        settings: &Settings,
        client: Arc<dyn BrokerClient>,
        channel: DeliveryChannel,
    ) -> Result<Self, BridgeError> {
        settings.validate()?;
        let channel = Arc::new(channel);

        let mut bridge = InboundBridge::new(client.clone());
        bridge
            .start(
                &settings.pubsub.subscription,
                channel.clone(),
                settings.bridge.input_channel.clone(),
            )
            .await?;

        let gateway = OutboundGateway::new(client, settings.pubsub.topic.clone())
            .with_channel_name(settings.bridge.output_channel.clone())
            .with_max_message_bytes(settings.pubsub.max_message_bytes);

        info!(
            subscription = %settings.pubsub.subscription,
            topic = %settings.pubsub.topic,
            "Application started"
        );
        Ok(Self {
            bridge,
            gateway,
            channel,
        })
    }

    pub fn gateway(&self) -> &OutboundGateway {
        &self.gateway
    }

    pub fn bridge(&self) -> &InboundBridge {
        &self.bridge
    }

    pub fn channel(&self) -> &DeliveryChannel {
        &self.channel
    }

    pub async fn stop(&mut self) {
        self.bridge.stop().await;
        info!("Application stopped");
    }
}

/// Creates the configured topic and subscription on an in-process broker.
/// Existing ones are left as they are.
pub fn provision(broker: &SharedBroker, settings: &Settings) -> Result<(), BrokerError> {
    let mut broker = lock(broker);
    match broker.create_topic(&settings.pubsub.topic) {
        Ok(()) | Err(BrokerError::TopicAlreadyExists(_)) => {}
        Err(e) => return Err(e),
    }
    match broker.create_subscription(
        &settings.pubsub.subscription,
        &settings.pubsub.topic,
        settings.ack_deadline(),
    ) {
        Ok(()) | Err(BrokerError::SubscriptionAlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
