//! The `channel` module is the in-process side of the bridge: named delivery
//! channels and the handlers registered on them.

pub mod delivery;
pub mod handler;

pub use delivery::{DeliveryChannel, DispatchMode};
pub use handler::{AckOnSuccess, ConsumerHandler, FnHandler, LogAndAck, handler_fn};
