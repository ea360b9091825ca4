//! Client error types.

use rntbd_protocol::{ProtocolError, ServerError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Sub-code of a transport fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    Unknown,
    ChannelMultiplexerClosed,
    ChannelOpenFailed,
    ChannelOpenTimeout,
    ChannelWaitingToOpenTimeout,
    ConnectFailed,
    ConnectTimeout,
    ConnectionBroken,
    DnsResolutionFailed,
    DnsResolutionTimeout,
    InvalidResponseLength,
    ReceiveFailed,
    ReceiveStreamClosed,
    ReceiveTimeout,
    SendFailed,
    SendLockTimeout,
    SendTimeout,
    SslNegotiationFailed,
    SslNegotiationTimeout,
    TransportNegotiationTimeout,
}

impl TransportErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorCode::Unknown => "Unknown",
            TransportErrorCode::ChannelMultiplexerClosed => "ChannelMultiplexerClosed",
            TransportErrorCode::ChannelOpenFailed => "ChannelOpenFailed",
            TransportErrorCode::ChannelOpenTimeout => "ChannelOpenTimeout",
            TransportErrorCode::ChannelWaitingToOpenTimeout => "ChannelWaitingToOpenTimeout",
            TransportErrorCode::ConnectFailed => "ConnectFailed",
            TransportErrorCode::ConnectTimeout => "ConnectTimeout",
            TransportErrorCode::ConnectionBroken => "ConnectionBroken",
            TransportErrorCode::DnsResolutionFailed => "DnsResolutionFailed",
            TransportErrorCode::DnsResolutionTimeout => "DnsResolutionTimeout",
            TransportErrorCode::InvalidResponseLength => "InvalidResponseLength",
            TransportErrorCode::ReceiveFailed => "ReceiveFailed",
            TransportErrorCode::ReceiveStreamClosed => "ReceiveStreamClosed",
            TransportErrorCode::ReceiveTimeout => "ReceiveTimeout",
            TransportErrorCode::SendFailed => "SendFailed",
            TransportErrorCode::SendLockTimeout => "SendLockTimeout",
            TransportErrorCode::SendTimeout => "SendTimeout",
            TransportErrorCode::SslNegotiationFailed => "SslNegotiationFailed",
            TransportErrorCode::SslNegotiationTimeout => "SslNegotiationTimeout",
            TransportErrorCode::TransportNegotiationTimeout => "TransportNegotiationTimeout",
        }
    }

    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            TransportErrorCode::ChannelOpenTimeout
                | TransportErrorCode::ChannelWaitingToOpenTimeout
                | TransportErrorCode::ConnectTimeout
                | TransportErrorCode::DnsResolutionTimeout
                | TransportErrorCode::ReceiveTimeout
                | TransportErrorCode::SendLockTimeout
                | TransportErrorCode::SendTimeout
                | TransportErrorCode::SslNegotiationTimeout
                | TransportErrorCode::TransportNegotiationTimeout
        )
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport fault.
///
/// `user_payload` and `payload_sent` tell an upstream retry policy whether the
/// request may already have reached the server.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub activity_id: Uuid,
    pub target: String,
    pub connection: String,
    pub user_payload: bool,
    pub payload_sent: bool,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new(
        code: TransportErrorCode,
        activity_id: Uuid,
        target: impl Into<String>,
        connection: impl Into<String>,
    ) -> Self {
        Self {
            code,
            activity_id,
            target: target.into(),
            connection: connection.into(),
            user_payload: false,
            payload_sent: false,
            source: None,
        }
    }

    pub fn with_payload(mut self, user_payload: bool, payload_sent: bool) -> Self {
        self.user_payload = user_payload;
        self.payload_sent = payload_sent;
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn with_shared_source(mut self, source: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether resending the request cannot duplicate a write on the server.
    pub fn is_safe_to_retry(&self) -> bool {
        !self.user_payload || !self.payload_sent
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on connection {} to {} (activity {})",
            self.code, self.connection, self.target, self.activity_id
        )?;
        if let Some(ref source) = self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// A negotiation response that refused the connection.
#[derive(Debug, Clone, Error)]
#[error("connection negotiation with {target} failed with status {status}: {message}")]
pub struct NegotiationError {
    pub status: u32,
    pub message: String,
    pub activity_id: Uuid,
    pub target: String,
    /// Server-advertised requirements, keyed by header name.
    pub headers: BTreeMap<&'static str, String>,
}

impl NegotiationError {
    pub const REQUIRED_CLIENT_VERSION: &'static str = "RequiredClientVersion";
    pub const REQUIRED_PROTOCOL_VERSION: &'static str = "RequiredProtocolVersion";
    pub const SERVER_AGENT: &'static str = "ServerAgent";
    pub const SERVER_VERSION: &'static str = "x-ms-serviceversion";

    pub fn required_protocol_version(&self) -> Option<u32> {
        self.headers
            .get(Self::REQUIRED_PROTOCOL_VERSION)
            .and_then(|v| v.parse().ok())
    }

    pub fn required_client_version(&self) -> Option<&str> {
        self.headers
            .get(Self::REQUIRED_CLIENT_VERSION)
            .map(String::as_str)
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A caller bug: double dispose, double send completion, use after dispose.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("call cancelled")]
    Cancelled,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(err) => err.is_safe_to_retry(),
            ClientError::Server(err) => err.kind.is_retryable(),
            _ => false,
        }
    }

    pub fn transport_code(&self) -> Option<TransportErrorCode> {
        match self {
            ClientError::Transport(err) => Some(err.code),
            _ => None,
        }
    }
}
