//! The `transport` module puts the broker engine on the network.
//!
//! - `message`: the JSON protocol spoken between emulator and clients.
//! - `websocket`: the emulator server, one task per connection.
//! - `remote`: `WebSocketClient`, a reconnecting `BrokerClient` for the server.

pub mod message;
pub mod remote;
pub mod websocket;

pub use message::{ClientMessage, ServerMessage};
pub use remote::{ReconnectPolicy, WebSocketClient};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;
