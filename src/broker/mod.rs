//! The `broker` module holds everything on the far side of the bridge.
//!
//! - `client`: the `BrokerClient` / `Acknowledger` seam the bridge talks to.
//! - `engine`: an in-memory broker engine with topics, subscriptions and leases,
//!   used as the emulator and as the fake broker in tests.
//! - `topic`: per-topic and per-subscription state of the engine.
//! - `local`: a `BrokerClient` that drives an in-process engine directly.

pub mod client;
pub mod engine;
pub mod local;
pub mod topic;

pub use client::{
    Acknowledger, BrokerClient, ConnectionState, FlowControl, ReceivedMessage, Subscriber,
    SubscriptionEvent,
};
pub use engine::{Broker, SharedBroker};
pub use local::LocalClient;
