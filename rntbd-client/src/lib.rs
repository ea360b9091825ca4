//! # rntbd-client
//!
//! Client transport for RNTBD replica endpoints.
//!
//! This crate provides:
//! - Physical connections with health heuristics and local port pooling
//! - A dispatcher multiplexing concurrent calls over one connection
//! - Channels adding open and request deadlines
//! - Optional TLS support

pub mod call;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod listener;
pub mod port_pool;
pub mod stream;
pub mod tls;

#[cfg(test)]
mod testing;

pub use call::{CallStage, PreparedCall, StoreResponse};
pub use channel::{Channel, ChannelState};
pub use config::{
    ConfigError, ConnectionConfig, KeepaliveConfig, TlsClientConfig, TransitTimeoutConfig,
    TransportConfig,
};
pub use connection::Connection;
pub use dispatcher::{Dispatcher, ServerProperties};
pub use error::{ClientError, NegotiationError, TransportError, TransportErrorCode};
pub use listener::{ConnectionEvent, ConnectionStateListener};
pub use port_pool::{AddressFamily, SimplePortPool, UserPortPool};
