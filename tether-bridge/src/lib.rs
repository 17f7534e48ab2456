//! Tether Bridge
//!
//! The in-agent side of the broker: keeps one authenticated WebSocket
//! alive per connection, refreshing credentials ahead of expiry and
//! reconnecting with jittered backoff, without the embedding agent ever
//! touching token material.

pub mod auth;
pub mod backoff;
pub mod broker;
pub mod connection;
pub mod error;
pub mod handler;
pub mod metrics;

// Re-export commonly used types for convenience
pub use auth::AuthStrategy;
pub use backoff::BackoffPolicy;
pub use broker::{BrokerClient, TokenInfo};
pub use connection::{maintain_websocket, WebSocketConfig};
pub use error::BridgeError;
pub use handler::{ConnectionHandler, DisconnectReason, MessageSender};

/// Re-exported so embedders can match on inbound frames without naming
/// the websocket crate themselves.
pub use tokio_tungstenite::tungstenite::Message;
