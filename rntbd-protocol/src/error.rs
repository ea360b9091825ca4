//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding RNTBD frames and token streams.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame length: {length} bytes (min {min}, max {max})")]
    InvalidLength { length: u32, min: u32, max: u32 },

    #[error("truncated {what}: need {needed} more bytes")]
    Truncated { what: &'static str, needed: usize },

    #[error("unknown token type: {0:#06x}")]
    UnknownTokenType(u16),

    #[error("token {catalogue}.{token} has wire type {actual:?}, expected {expected:?}")]
    TokenTypeMismatch {
        catalogue: &'static str,
        token: &'static str,
        expected: crate::token::TokenType,
        actual: crate::token::TokenType,
    },

    #[error("required token {catalogue}.{token} is missing")]
    MissingRequiredToken {
        catalogue: &'static str,
        token: &'static str,
    },

    #[error("token {token} is {length} bytes long, {token_type:?} holds at most {max}")]
    ValueTooLong {
        token: &'static str,
        token_type: crate::token::TokenType,
        length: usize,
        max: usize,
    },

    #[error("body too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("invalid UTF-8 in token {0}")]
    InvalidUtf8(&'static str),

    #[error("unknown {kind} value: {value:#06x}")]
    UnknownEnumValue { kind: &'static str, value: u16 },
}
