//! The `bridge` module connects the broker to the application: the inbound
//! bridge feeds broker deliveries onto a delivery channel and the outbound
//! gateway publishes application values to a topic.

pub mod gateway;
pub mod inbound;

pub use gateway::OutboundGateway;
pub use inbound::{BridgeState, InboundBridge};
