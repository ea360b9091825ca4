//! Connection negotiation frames.
//!
//! The first exchange on every connection is a context request carrying the
//! client's protocol version and user agent, answered by a context response
//! with the server's identity and optional timeout hints.

use crate::catalogue::{ContextRequestToken, ContextResponseToken};
use crate::error::ProtocolError;
use crate::frame::{RequestHeader, ResponseHeader, BODY_LENGTH_SIZE, FRAME_HEADER_SIZE};
use crate::message::{OperationType, ResourceType};
use crate::token::{TokenStream, TokenValue};
use crate::{CURRENT_PROTOCOL_VERSION, RESPONSE_LENGTH_LIMIT};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use uuid::Uuid;

/// Version string the client reports during negotiation.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity of the caller, sent in the context request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CallerId {
    #[default]
    Anonymous = 0x00,
    Gateway = 0x01,
    BackgroundTask = 0x02,
    ManagementWorker = 0x03,
}

impl TryFrom<u8> for CallerId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CallerId::Anonymous),
            0x01 => Ok(CallerId::Gateway),
            0x02 => Ok(CallerId::BackgroundTask),
            0x03 => Ok(CallerId::ManagementWorker),
            other => Err(ProtocolError::UnknownEnumValue {
                kind: "CallerId",
                value: other as u16,
            }),
        }
    }
}

/// Negotiation request sent once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    pub protocol_version: u32,
    pub client_version: String,
    pub user_agent: String,
    pub caller_id: CallerId,
    pub enable_channel_multiplexing: bool,
}

impl ContextRequest {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            client_version: CLIENT_VERSION.to_string(),
            user_agent: user_agent.into(),
            caller_id: CallerId::Anonymous,
            enable_channel_multiplexing: false,
        }
    }

    pub fn with_caller_id(mut self, caller_id: CallerId) -> Self {
        self.caller_id = caller_id;
        self
    }

    pub fn with_channel_multiplexing(mut self, enabled: bool) -> Self {
        self.enable_channel_multiplexing = enabled;
        self
    }

    fn tokens(&self) -> Result<TokenStream<ContextRequestToken>, ProtocolError> {
        let mut tokens = TokenStream::new();
        tokens
            .set(
                ContextRequestToken::ProtocolVersion,
                TokenValue::ULong(self.protocol_version),
            )?
            .set_string(ContextRequestToken::ClientVersion, self.client_version.as_str())?
            .set_string(ContextRequestToken::UserAgent, self.user_agent.as_str())?;
        // Only the gateway identifies itself.
        if self.caller_id == CallerId::Gateway {
            tokens.set(
                ContextRequestToken::CallerId,
                TokenValue::Byte(self.caller_id as u8),
            )?;
        }
        if self.enable_channel_multiplexing {
            tokens.set(ContextRequestToken::EnableChannelMultiplexing, TokenValue::Byte(1))?;
        }
        Ok(tokens)
    }

    /// Encodes the request as a Connection/Connection frame.
    pub fn encode(&self, activity_id: Uuid) -> Result<BytesMut, ProtocolError> {
        let tokens = self.tokens()?;
        let total_length = FRAME_HEADER_SIZE + tokens.encoded_len()?;
        let mut buf = BytesMut::with_capacity(total_length);
        RequestHeader {
            total_length: total_length as u32,
            resource_type: ResourceType::Connection.value(),
            operation_type: OperationType::Connection.value(),
            activity_id,
        }
        .encode(&mut buf);
        tokens.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a context request from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<(Uuid, Self)>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = RequestHeader::decode(&buf[..FRAME_HEADER_SIZE])?;
        let total = header.total_length as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let tokens = TokenStream::<ContextRequestToken>::decode(Bytes::copy_from_slice(
            &buf[FRAME_HEADER_SIZE..total],
        ))?;
        buf.advance(total);

        let caller_id = match tokens.get_u8(ContextRequestToken::CallerId) {
            Some(value) => CallerId::try_from(value)?,
            None => CallerId::Anonymous,
        };
        let request = Self {
            protocol_version: tokens
                .get_u32(ContextRequestToken::ProtocolVersion)
                .unwrap_or_default(),
            client_version: tokens
                .get_str(ContextRequestToken::ClientVersion)
                .unwrap_or_default()
                .to_string(),
            user_agent: tokens
                .get_str(ContextRequestToken::UserAgent)
                .unwrap_or_default()
                .to_string(),
            caller_id,
            enable_channel_multiplexing: tokens
                .get_u8(ContextRequestToken::EnableChannelMultiplexing)
                .is_some_and(|v| v != 0),
        };
        Ok(Some((header.activity_id, request)))
    }
}

/// Negotiation response.
///
/// A failed negotiation (status outside `200..400`) is followed on the wire by
/// a length-prefixed error body.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextResponse {
    pub status: u32,
    pub activity_id: Uuid,
    pub tokens: TokenStream<ContextResponseToken>,
}

impl ContextResponse {
    pub fn new(status: u32, activity_id: Uuid) -> Self {
        Self {
            status,
            activity_id,
            tokens: TokenStream::new(),
        }
    }

    /// Builds a response from a decoded header and its metadata block.
    pub fn from_parts(header: ResponseHeader, metadata: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: header.status,
            activity_id: header.activity_id,
            tokens: TokenStream::decode(metadata)?,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn server_agent(&self) -> Option<&str> {
        self.tokens.get_str(ContextResponseToken::ServerAgent)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.tokens.get_str(ContextResponseToken::ServerVersion)
    }

    /// Protocol version the server requires, if it advertised one.
    pub fn protocol_version(&self) -> Option<u32> {
        self.tokens.get_u32(ContextResponseToken::ProtocolVersion)
    }

    /// Client version the server requires, if it advertised one.
    pub fn client_version(&self) -> Option<&str> {
        self.tokens.get_str(ContextResponseToken::ClientVersion)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.tokens
            .get_u32(ContextResponseToken::IdleTimeoutInSeconds)
            .map(|secs| Duration::from_secs(secs.into()))
    }

    pub fn unauthenticated_timeout(&self) -> Option<Duration> {
        self.tokens
            .get_u32(ContextResponseToken::UnauthenticatedTimeoutInSeconds)
            .map(|secs| Duration::from_secs(secs.into()))
    }

    /// Encodes the response, appending `error_body` when negotiation failed.
    pub fn encode(&self, error_body: Option<&[u8]>) -> Result<BytesMut, ProtocolError> {
        let total_length = FRAME_HEADER_SIZE + self.tokens.encoded_len()?;
        let mut buf = BytesMut::with_capacity(total_length);
        ResponseHeader {
            total_length: total_length as u32,
            status: self.status,
            activity_id: self.activity_id,
        }
        .encode(&mut buf);
        self.tokens.encode(&mut buf)?;
        if let Some(body) = error_body {
            let length =
                u32::try_from(body.len()).map_err(|_| ProtocolError::BodyTooLarge(body.len()))?;
            buf.reserve(BODY_LENGTH_SIZE + body.len());
            buf.put_u32_le(length);
            buf.put_slice(body);
        }
        Ok(buf)
    }

    /// Decodes a response header and metadata from the front of `buf`.
    ///
    /// The error body of a failed negotiation is left in `buf`.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = ResponseHeader::decode(&buf[..FRAME_HEADER_SIZE], RESPONSE_LENGTH_LIMIT)?;
        let total = header.total_length as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let response =
            Self::from_parts(header, Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total]))?;
        buf.advance(total);
        Ok(Some(response))
    }
}
