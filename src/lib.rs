//! # pubsub_bridge
//!
//! `pubsub_bridge` connects an application to a topic/subscription message
//! broker. Deliveries from a subscription are wrapped into `InboundMessage`s
//! carrying a manual `AckHandle` and dispatched to handlers on an in-process
//! delivery channel; application values go out through an `OutboundGateway`.
//!
//! ## Core Modules
//!
//! - `message`: inbound/outbound envelopes and the ack handle state machine.
//! - `channel`: named delivery channels and consumer handlers.
//! - `bridge`: the inbound bridge and the outbound gateway.
//! - `broker`: the broker client seam and an in-memory broker engine.
//! - `transport`: a WebSocket emulator for the engine and a reconnecting client for it.
//! - `config`: layered configuration from files and the environment.
//! - `app`: wiring of the sample application.
//! - `utils`: error types, logging setup and small helpers.

pub mod app;
pub mod bridge;
pub mod broker;
pub mod channel;
pub mod config;
pub mod message;
pub mod transport;
pub mod utils;

pub use app::Application;
pub use bridge::{BridgeState, InboundBridge, OutboundGateway};
pub use channel::{ConsumerHandler, DeliveryChannel};
pub use message::{AckHandle, AckState, InboundMessage};

#[cfg(test)]
mod testing;
