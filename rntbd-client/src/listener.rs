//! Connection event notifications for upstream health tracking.

use chrono::{DateTime, Utc};
use std::fmt;

/// Why a connection stopped delivering responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The server closed the stream.
    ReadEof,
    /// Reading from the stream failed.
    ReadFailure,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::ReadEof => write!(f, "ReadEof"),
            ConnectionEvent::ReadFailure => write!(f, "ReadFailure"),
        }
    }
}

/// Receives connection events. Invoked on a spawned task; panics are logged
/// and otherwise ignored.
pub trait ConnectionStateListener: Send + Sync {
    fn on_connection_event(&self, event: ConnectionEvent, timestamp: DateTime<Utc>, server: &str);
}
