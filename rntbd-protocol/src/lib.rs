//! # rntbd-protocol
//!
//! Wire format of the RNTBD replica protocol.
//!
//! This crate provides:
//! - Sparse tagged-field token streams and the four token catalogues
//! - 24-byte request/response frame headers with length validation
//! - Request, response and connection-negotiation frames
//! - Mapping of failed statuses to typed server errors
//!
//! It performs no I/O.

pub mod catalogue;
pub mod codec;
pub mod context;
pub mod error;
pub mod frame;
pub mod message;
pub mod status;
pub mod token;

pub use catalogue::{ContextRequestToken, ContextResponseToken, RequestToken, ResponseToken};
pub use codec::Decoder;
pub use context::{CallerId, ContextRequest, ContextResponse, CLIENT_VERSION};
pub use error::ProtocolError;
pub use frame::{RequestHeader, ResponseHeader, BODY_LENGTH_SIZE, FRAME_HEADER_SIZE};
pub use message::{
    ConsistencyLevel, ContentSerializationFormat, IndexingDirective, OperationType, RequestFrame,
    ResourceType, ResponseFrame,
};
pub use status::{map_status, ServerError, ServerErrorKind};
pub use token::{Token, TokenStream, TokenType, TokenValue};

/// Protocol version sent during negotiation.
pub const CURRENT_PROTOCOL_VERSION: u32 = 1;

/// Largest total length a response header may declare.
pub const RESPONSE_LENGTH_LIMIT: u32 = i32::MAX as u32;
