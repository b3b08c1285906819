//! The `message` module defines the envelopes that cross the bridge.
//!
//! - `ack`: the `AckHandle` an inbound message carries and its state machine.
//! - `inbound`: `InboundMessage`, the immutable delivery envelope.
//! - `outbound`: `OutboundRequest` and the `ToPayload` conversions used by the gateway.

pub mod ack;
pub mod inbound;
pub mod outbound;

pub use ack::{AckHandle, AckState};
pub use inbound::InboundMessage;
pub use outbound::{Json, OutboundRequest, PublishReceipt, ToPayload};

#[cfg(test)]
mod tests;
