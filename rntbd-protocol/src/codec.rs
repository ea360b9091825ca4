//! Buffering decoder for RNTBD byte streams.

use crate::context::{ContextRequest, ContextResponse};
use crate::error::ProtocolError;
use crate::message::{RequestFrame, ResponseFrame};
use bytes::{Bytes, BytesMut};
use uuid::Uuid;

/// Accumulates arbitrary chunks and yields whole frames.
///
/// A peer first exchanges one context frame and then per-call frames, so the
/// decoder offers both flavours and leaves the choice to the caller.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    pub fn decode_context_request(
        &mut self,
    ) -> Result<Option<(Uuid, ContextRequest)>, ProtocolError> {
        ContextRequest::decode(&mut self.buffer)
    }

    pub fn decode_context_response(&mut self) -> Result<Option<ContextResponse>, ProtocolError> {
        ContextResponse::decode(&mut self.buffer)
    }

    pub fn decode_request(&mut self) -> Result<Option<RequestFrame>, ProtocolError> {
        RequestFrame::decode(&mut self.buffer)
    }

    pub fn decode_response(&mut self) -> Result<Option<ResponseFrame>, ProtocolError> {
        ResponseFrame::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
