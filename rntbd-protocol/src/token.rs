//! Sparse tagged token streams.
//!
//! Metadata blocks are a sequence of tokens, each laid out as:
//!
//! ```text
//! +-----------+-----------+---------------------------------+
//! | type (LE) | id (LE)   | payload                         |
//! | 2 bytes   | 2 bytes   | fixed width or length + bytes   |
//! +-----------+-----------+---------------------------------+
//! ```
//!
//! Only tokens that are present are written. A catalogue (see [`Token`])
//! fixes the identifier, wire type and required flag of every known token.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::marker::PhantomData;
use uuid::Uuid;

/// Size of the type + identifier prefix of every token.
pub const TOKEN_HEADER_SIZE: usize = 4;

/// Wire type of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TokenType {
    Byte = 0x00,
    UShort = 0x01,
    ULong = 0x02,
    Long = 0x03,
    ULongLong = 0x04,
    LongLong = 0x05,
    Guid = 0x06,
    SmallString = 0x07,
    String = 0x08,
    ULongString = 0x09,
    SmallBytes = 0x0A,
    Bytes = 0x0B,
    ULongBytes = 0x0C,
    Float = 0x0D,
    Double = 0x0E,
}

impl TokenType {
    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x00 => TokenType::Byte,
            0x01 => TokenType::UShort,
            0x02 => TokenType::ULong,
            0x03 => TokenType::Long,
            0x04 => TokenType::ULongLong,
            0x05 => TokenType::LongLong,
            0x06 => TokenType::Guid,
            0x07 => TokenType::SmallString,
            0x08 => TokenType::String,
            0x09 => TokenType::ULongString,
            0x0A => TokenType::SmallBytes,
            0x0B => TokenType::Bytes,
            0x0C => TokenType::ULongBytes,
            0x0D => TokenType::Float,
            0x0E => TokenType::Double,
            other => return Err(ProtocolError::UnknownTokenType(other)),
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Payload size of fixed-width types.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            TokenType::Byte => Some(1),
            TokenType::UShort => Some(2),
            TokenType::ULong | TokenType::Long | TokenType::Float => Some(4),
            TokenType::ULongLong | TokenType::LongLong | TokenType::Double => Some(8),
            TokenType::Guid => Some(16),
            _ => None,
        }
    }

    /// Width of the length prefix of string and blob types.
    pub fn length_prefix(self) -> Option<usize> {
        match self {
            TokenType::SmallString | TokenType::SmallBytes => Some(1),
            TokenType::String | TokenType::Bytes => Some(2),
            TokenType::ULongString | TokenType::ULongBytes => Some(4),
            _ => None,
        }
    }

    /// Largest value length the length prefix can represent.
    pub fn max_length(self) -> Option<usize> {
        self.length_prefix().map(|width| match width {
            1 => u8::MAX as usize,
            2 => u16::MAX as usize,
            _ => u32::MAX as usize,
        })
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            TokenType::SmallString | TokenType::String | TokenType::ULongString
        )
    }

    pub fn is_bytes(self) -> bool {
        matches!(
            self,
            TokenType::SmallBytes | TokenType::Bytes | TokenType::ULongBytes
        )
    }
}

/// A decoded token value, tagged with its wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    Byte(u8),
    UShort(u16),
    ULong(u32),
    Long(i32),
    ULongLong(u64),
    LongLong(i64),
    Guid(Uuid),
    SmallString(String),
    String(String),
    ULongString(String),
    SmallBytes(Bytes),
    Bytes(Bytes),
    ULongBytes(Bytes),
    Float(f32),
    Double(f64),
}

impl TokenValue {
    /// Builds a string value of the given string wire type.
    pub fn string(token_type: TokenType, value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        match token_type {
            TokenType::SmallString => Some(TokenValue::SmallString(value)),
            TokenType::String => Some(TokenValue::String(value)),
            TokenType::ULongString => Some(TokenValue::ULongString(value)),
            _ => None,
        }
    }

    /// Builds a blob value of the given blob wire type.
    pub fn bytes(token_type: TokenType, value: impl Into<Bytes>) -> Option<Self> {
        let value = value.into();
        match token_type {
            TokenType::SmallBytes => Some(TokenValue::SmallBytes(value)),
            TokenType::Bytes => Some(TokenValue::Bytes(value)),
            TokenType::ULongBytes => Some(TokenValue::ULongBytes(value)),
            _ => None,
        }
    }

    pub fn token_type(&self) -> TokenType {
        match self {
            TokenValue::Byte(_) => TokenType::Byte,
            TokenValue::UShort(_) => TokenType::UShort,
            TokenValue::ULong(_) => TokenType::ULong,
            TokenValue::Long(_) => TokenType::Long,
            TokenValue::ULongLong(_) => TokenType::ULongLong,
            TokenValue::LongLong(_) => TokenType::LongLong,
            TokenValue::Guid(_) => TokenType::Guid,
            TokenValue::SmallString(_) => TokenType::SmallString,
            TokenValue::String(_) => TokenType::String,
            TokenValue::ULongString(_) => TokenType::ULongString,
            TokenValue::SmallBytes(_) => TokenType::SmallBytes,
            TokenValue::Bytes(_) => TokenType::Bytes,
            TokenValue::ULongBytes(_) => TokenType::ULongBytes,
            TokenValue::Float(_) => TokenType::Float,
            TokenValue::Double(_) => TokenType::Double,
        }
    }

    /// Length of the variable part for strings and blobs.
    fn variable_len(&self) -> Option<usize> {
        match self {
            TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => {
                Some(s.len())
            }
            TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => {
                Some(b.len())
            }
            _ => None,
        }
    }

    /// Encoded payload size, excluding the token header.
    pub fn payload_len(&self) -> usize {
        let token_type = self.token_type();
        match token_type.fixed_size() {
            Some(size) => size,
            None => token_type.length_prefix().unwrap_or(0) + self.variable_len().unwrap_or(0),
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            TokenValue::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            TokenValue::UShort(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            TokenValue::ULong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TokenValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            TokenValue::ULongLong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TokenValue::LongLong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TokenValue::Double(v) => Some(*v),
            TokenValue::Float(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            TokenValue::Guid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => {
                Some(s)
            }
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => {
                Some(b)
            }
            _ => None,
        }
    }

    /// Renders the value the way response headers carry it.
    pub fn to_header_value(&self) -> String {
        match self {
            TokenValue::Byte(v) => v.to_string(),
            TokenValue::UShort(v) => v.to_string(),
            TokenValue::ULong(v) => v.to_string(),
            TokenValue::Long(v) => v.to_string(),
            TokenValue::ULongLong(v) => v.to_string(),
            TokenValue::LongLong(v) => v.to_string(),
            TokenValue::Guid(v) => v.to_string(),
            TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => {
                s.clone()
            }
            TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => {
                b.iter().map(|byte| format!("{:02x}", byte)).collect()
            }
            TokenValue::Float(v) => v.to_string(),
            TokenValue::Double(v) => v.to_string(),
        }
    }

    fn check_length(&self, token: &'static str) -> Result<(), ProtocolError> {
        let token_type = self.token_type();
        if let (Some(length), Some(max)) = (self.variable_len(), token_type.max_length()) {
            if length > max {
                return Err(ProtocolError::ValueTooLong {
                    token,
                    token_type,
                    length,
                    max,
                });
            }
        }
        Ok(())
    }

    fn put_length(buf: &mut BytesMut, token_type: TokenType, length: usize) {
        match token_type.length_prefix() {
            Some(1) => buf.put_u8(length as u8),
            Some(2) => buf.put_u16_le(length as u16),
            _ => buf.put_u32_le(length as u32),
        }
    }

    /// Writes the payload. Lengths must already be checked.
    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            TokenValue::Byte(v) => buf.put_u8(*v),
            TokenValue::UShort(v) => buf.put_u16_le(*v),
            TokenValue::ULong(v) => buf.put_u32_le(*v),
            TokenValue::Long(v) => buf.put_i32_le(*v),
            TokenValue::ULongLong(v) => buf.put_u64_le(*v),
            TokenValue::LongLong(v) => buf.put_i64_le(*v),
            TokenValue::Guid(v) => buf.put_slice(&v.to_bytes_le()),
            TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => {
                Self::put_length(buf, self.token_type(), s.len());
                buf.put_slice(s.as_bytes());
            }
            TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => {
                Self::put_length(buf, self.token_type(), b.len());
                buf.put_slice(b);
            }
            TokenValue::Float(v) => buf.put_f32_le(*v),
            TokenValue::Double(v) => buf.put_f64_le(*v),
        }
    }

    /// Reads a payload of the given wire type.
    fn decode_payload(
        token_type: TokenType,
        buf: &mut Bytes,
        token: &'static str,
    ) -> Result<Self, ProtocolError> {
        if let Some(size) = token_type.fixed_size() {
            ensure(buf, size, "token payload")?;
            return Ok(match token_type {
                TokenType::Byte => TokenValue::Byte(buf.get_u8()),
                TokenType::UShort => TokenValue::UShort(buf.get_u16_le()),
                TokenType::ULong => TokenValue::ULong(buf.get_u32_le()),
                TokenType::Long => TokenValue::Long(buf.get_i32_le()),
                TokenType::ULongLong => TokenValue::ULongLong(buf.get_u64_le()),
                TokenType::LongLong => TokenValue::LongLong(buf.get_i64_le()),
                TokenType::Float => TokenValue::Float(buf.get_f32_le()),
                TokenType::Double => TokenValue::Double(buf.get_f64_le()),
                _ => {
                    let mut raw = [0u8; 16];
                    buf.copy_to_slice(&mut raw);
                    TokenValue::Guid(Uuid::from_bytes_le(raw))
                }
            });
        }

        let raw = read_variable(token_type, buf)?;
        let utf8 = |raw: Bytes| {
            String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(token))
        };
        Ok(match token_type {
            TokenType::SmallString => TokenValue::SmallString(utf8(raw)?),
            TokenType::String => TokenValue::String(utf8(raw)?),
            TokenType::ULongString => TokenValue::ULongString(utf8(raw)?),
            TokenType::SmallBytes => TokenValue::SmallBytes(raw),
            TokenType::Bytes => TokenValue::Bytes(raw),
            _ => TokenValue::ULongBytes(raw),
        })
    }

    /// Skips a payload of the given wire type without interpreting it.
    fn skip_payload(token_type: TokenType, buf: &mut Bytes) -> Result<(), ProtocolError> {
        match token_type.fixed_size() {
            Some(size) => {
                ensure(buf, size, "token payload")?;
                buf.advance(size);
            }
            None => {
                read_variable(token_type, buf)?;
            }
        }
        Ok(())
    }
}

fn ensure(buf: &Bytes, needed: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            what,
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

fn read_variable(token_type: TokenType, buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let width = token_type.length_prefix().unwrap_or(4);
    ensure(buf, width, "token length")?;
    let length = match width {
        1 => buf.get_u8() as usize,
        2 => buf.get_u16_le() as usize,
        _ => buf.get_u32_le() as usize,
    };
    ensure(buf, length, "token value")?;
    Ok(buf.split_to(length))
}

/// A fixed catalogue of tokens.
///
/// Implemented through [`token_catalogue!`] for each direction of the
/// protocol.
pub trait Token: Copy + Eq + fmt::Debug + 'static {
    /// Catalogue name used in error messages.
    const CATALOGUE: &'static str;
    /// Every token of the catalogue, in identifier order.
    const ALL: &'static [Self];
    /// One past the largest identifier.
    const SLOTS: usize;

    fn id(self) -> u16;
    fn from_id(id: u16) -> Option<Self>;
    fn name(self) -> &'static str;
    fn token_type(self) -> TokenType;
    fn is_required(self) -> bool;
}

/// Declares a token catalogue enum and its [`Token`] implementation.
macro_rules! token_catalogue {
    (@required required) => {
        true
    };
    (@required) => {
        false
    };
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident ($catalogue:literal) {
            $( $variant:ident = $id:literal, $ty:ident $(, $req:ident)? ; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        $vis enum $name {
            $( $variant = $id, )*
        }

        impl $crate::token::Token for $name {
            const CATALOGUE: &'static str = $catalogue;
            const ALL: &'static [Self] = &[ $( $name::$variant, )* ];
            const SLOTS: usize = {
                let mut slots = 0usize;
                $(
                    if $id as usize + 1 > slots {
                        slots = $id as usize + 1;
                    }
                )*
                slots
            };

            fn id(self) -> u16 {
                self as u16
            }

            fn from_id(id: u16) -> Option<Self> {
                match id {
                    $( $id => Some($name::$variant), )*
                    _ => None,
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => stringify!($variant), )*
                }
            }

            fn token_type(self) -> $crate::token::TokenType {
                match self {
                    $( $name::$variant => $crate::token::TokenType::$ty, )*
                }
            }

            fn is_required(self) -> bool {
                match self {
                    $( $name::$variant => $crate::token::token_catalogue!(@required $($req)?), )*
                }
            }
        }
    };
}

pub(crate) use token_catalogue;

/// A sparse set of token values drawn from catalogue `T`.
///
/// Slots are indexed by identifier so a stream can be cleared and reused
/// across frames without reallocating.
#[derive(Clone, PartialEq)]
pub struct TokenStream<T: Token> {
    slots: Vec<Option<TokenValue>>,
    _catalogue: PhantomData<T>,
}

impl<T: Token> TokenStream<T> {
    pub fn new() -> Self {
        Self {
            slots: vec![None; T::SLOTS],
            _catalogue: PhantomData,
        }
    }

    /// Sets a token. The value's wire type must match the catalogue.
    pub fn set(&mut self, token: T, value: TokenValue) -> Result<&mut Self, ProtocolError> {
        let expected = token.token_type();
        let actual = value.token_type();
        if expected != actual {
            return Err(ProtocolError::TokenTypeMismatch {
                catalogue: T::CATALOGUE,
                token: token.name(),
                expected,
                actual,
            });
        }
        self.slots[token.id() as usize] = Some(value);
        Ok(self)
    }

    /// Sets a string token using whichever string width the catalogue declares.
    pub fn set_string(
        &mut self,
        token: T,
        value: impl Into<String>,
    ) -> Result<&mut Self, ProtocolError> {
        let value = TokenValue::string(token.token_type(), value)
            .ok_or_else(|| self.mismatch(token, TokenType::String))?;
        self.set(token, value)
    }

    /// Sets a blob token using whichever blob width the catalogue declares.
    pub fn set_bytes(
        &mut self,
        token: T,
        value: impl Into<Bytes>,
    ) -> Result<&mut Self, ProtocolError> {
        let value = TokenValue::bytes(token.token_type(), value)
            .ok_or_else(|| self.mismatch(token, TokenType::Bytes))?;
        self.set(token, value)
    }

    fn mismatch(&self, token: T, actual: TokenType) -> ProtocolError {
        ProtocolError::TokenTypeMismatch {
            catalogue: T::CATALOGUE,
            token: token.name(),
            expected: token.token_type(),
            actual,
        }
    }

    pub fn get(&self, token: T) -> Option<&TokenValue> {
        self.slots.get(token.id() as usize).and_then(Option::as_ref)
    }

    pub fn is_present(&self, token: T) -> bool {
        self.get(token).is_some()
    }

    pub fn remove(&mut self, token: T) -> Option<TokenValue> {
        self.slots.get_mut(token.id() as usize).and_then(Option::take)
    }

    /// Marks every token absent, keeping the allocation.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Number of present tokens.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Present tokens in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (T, &TokenValue)> + '_ {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            let value = slot.as_ref()?;
            T::from_id(id as u16).map(|token| (token, value))
        })
    }

    /// Size of the encoded stream. Fails if any value overflows its length prefix.
    pub fn encoded_len(&self) -> Result<usize, ProtocolError> {
        let mut total = 0;
        for (token, value) in self.iter() {
            value.check_length(token.name())?;
            total += TOKEN_HEADER_SIZE + value.payload_len();
        }
        Ok(total)
    }

    /// Appends the present tokens to `buf`.
    ///
    /// Nothing is written if any value is too long for its length prefix.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = self.encoded_len()?;
        buf.reserve(len);
        for (token, value) in self.iter() {
            buf.put_u16_le(value.token_type().as_u16());
            buf.put_u16_le(token.id());
            value.encode_payload(buf);
        }
        Ok(())
    }

    /// Decodes a complete metadata block.
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let mut stream = Self::new();
        stream.decode_into(&mut buf)?;
        Ok(stream)
    }

    /// Clears this stream and decodes a complete metadata block into it.
    pub fn decode_into(&mut self, buf: &mut Bytes) -> Result<(), ProtocolError> {
        self.clear();
        while buf.has_remaining() {
            ensure(buf, TOKEN_HEADER_SIZE, "token header")?;
            let token_type = TokenType::from_u16(buf.get_u16_le())?;
            let id = buf.get_u16_le();

            match T::from_id(id) {
                Some(token) => {
                    if token.token_type() != token_type {
                        return Err(ProtocolError::TokenTypeMismatch {
                            catalogue: T::CATALOGUE,
                            token: token.name(),
                            expected: token.token_type(),
                            actual: token_type,
                        });
                    }
                    let value = TokenValue::decode_payload(token_type, buf, token.name())?;
                    self.slots[id as usize] = Some(value);
                }
                None => TokenValue::skip_payload(token_type, buf)?,
            }
        }
        self.validate_required()
    }

    /// Fails on the first required token that is absent.
    pub fn validate_required(&self) -> Result<(), ProtocolError> {
        match T::ALL
            .iter()
            .find(|token| token.is_required() && !self.is_present(**token))
        {
            Some(token) => Err(ProtocolError::MissingRequiredToken {
                catalogue: T::CATALOGUE,
                token: token.name(),
            }),
            None => Ok(()),
        }
    }

    pub fn get_u8(&self, token: T) -> Option<u8> {
        self.get(token).and_then(TokenValue::as_u8)
    }

    pub fn get_u32(&self, token: T) -> Option<u32> {
        self.get(token).and_then(TokenValue::as_u32)
    }

    pub fn get_i64(&self, token: T) -> Option<i64> {
        self.get(token).and_then(TokenValue::as_i64)
    }

    pub fn get_str(&self, token: T) -> Option<&str> {
        self.get(token).and_then(TokenValue::as_str)
    }
}

impl<T: Token> Default for TokenStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Token> fmt::Debug for TokenStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(token, value)| (token.name(), value)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    token_catalogue! {
        enum Sample("Sample") {
            Flag = 0x0000, Byte, required;
            Count = 0x0001, ULong;
            Offset = 0x0002, LongLong;
            Name = 0x0003, SmallString;
            Path = 0x0004, String;
            Blob = 0x0005, Bytes;
            Charge = 0x0006, Double;
            Activity = 0x0007, Guid;
            Doc = 0x0009, ULongString;
            Small = 0x000A, SmallBytes;
            Port = 0x000B, UShort;
            Delta = 0x000C, Long;
            Checksum = 0x000D, ULongLong;
            Ratio = 0x000E, Float;
            Large = 0x000F, ULongBytes;
        }
    }

    fn roundtrip(stream: &TokenStream<Sample>) -> TokenStream<Sample> {
        let mut buf = BytesMut::new();
        stream.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), stream.encoded_len().unwrap());
        TokenStream::decode(buf.freeze()).unwrap()
    }

    #[test]
    fn test_catalogue_metadata() {
        assert_eq!(Sample::SLOTS, 0x10);
        assert_eq!(Sample::ALL.len(), 15);
        assert_eq!(Sample::from_id(0x0003), Some(Sample::Name));
        assert_eq!(Sample::from_id(0x0008), None);
        assert!(Sample::Flag.is_required());
        assert!(!Sample::Count.is_required());
        assert_eq!(Sample::Path.token_type(), TokenType::String);
        assert_eq!(Sample::Blob.name(), "Blob");
    }

    #[test]
    fn test_token_wire_layout() {
        let mut stream = TokenStream::<Sample>::new();
        stream.set(Sample::Flag, TokenValue::Byte(1)).unwrap();
        stream.set_string(Sample::Name, "ab").unwrap();

        let mut buf = BytesMut::new();
        stream.encode(&mut buf).unwrap();

        assert_eq!(
            &buf[..],
            &[
                0x00, 0x00, 0x00, 0x00, 0x01, // Byte, id 0, value 1
                0x07, 0x00, 0x03, 0x00, 0x02, b'a', b'b', // SmallString, id 3, "ab"
            ]
        );
    }

    #[test]
    fn test_only_required_tokens() {
        let mut stream = TokenStream::<Sample>::new();
        stream.set(Sample::Flag, TokenValue::Byte(0)).unwrap();

        let decoded = roundtrip(&stream);
        assert_eq!(decoded, stream);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_every_token_present() {
        let activity = Uuid::new_v4();
        let mut stream = TokenStream::<Sample>::new();
        stream.set(Sample::Flag, TokenValue::Byte(1)).unwrap();
        stream.set(Sample::Count, TokenValue::ULong(u32::MAX)).unwrap();
        stream.set(Sample::Offset, TokenValue::LongLong(-42)).unwrap();
        stream.set_string(Sample::Name, "replica").unwrap();
        stream.set_string(Sample::Path, "/apps/x/partitions/y").unwrap();
        stream.set_bytes(Sample::Blob, vec![1u8, 2, 3]).unwrap();
        stream.set(Sample::Charge, TokenValue::Double(2.5)).unwrap();
        stream.set(Sample::Activity, TokenValue::Guid(activity)).unwrap();
        stream.set_string(Sample::Doc, "x".repeat(70_000)).unwrap();
        stream.set_bytes(Sample::Small, vec![9u8]).unwrap();
        stream.set(Sample::Port, TokenValue::UShort(443)).unwrap();
        stream.set(Sample::Delta, TokenValue::Long(-7)).unwrap();
        stream.set(Sample::Checksum, TokenValue::ULongLong(u64::MAX)).unwrap();
        stream.set(Sample::Ratio, TokenValue::Float(0.5)).unwrap();
        stream.set_bytes(Sample::Large, vec![0u8; 300]).unwrap();

        let decoded = roundtrip(&stream);
        assert_eq!(decoded, stream);
        assert_eq!(decoded.get(Sample::Activity).and_then(TokenValue::as_uuid), Some(activity));
    }

    #[test]
    fn test_missing_required_token() {
        let mut stream = TokenStream::<Sample>::new();
        stream.set(Sample::Count, TokenValue::ULong(3)).unwrap();

        let mut buf = BytesMut::new();
        stream.encode(&mut buf).unwrap();
        let err = TokenStream::<Sample>::decode(buf.freeze()).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingRequiredToken { token: "Flag", .. }
        ));
    }

    #[test]
    fn test_unknown_token_is_skipped() {
        let mut buf = BytesMut::new();
        // Unknown id 0x0008 carrying a String.
        buf.put_u16_le(TokenType::String.as_u16());
        buf.put_u16_le(0x0008);
        buf.put_u16_le(3);
        buf.put_slice(b"xyz");
        // Unknown id 0x0100 carrying a ULong.
        buf.put_u16_le(TokenType::ULong.as_u16());
        buf.put_u16_le(0x0100);
        buf.put_u32_le(7);
        // Known required flag.
        buf.put_u16_le(TokenType::Byte.as_u16());
        buf.put_u16_le(0x0000);
        buf.put_u8(1);

        let decoded = TokenStream::<Sample>::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get_u8(Sample::Flag), Some(1));
    }

    #[test]
    fn test_type_mismatch_on_set() {
        let mut stream = TokenStream::<Sample>::new();
        let err = stream.set(Sample::Count, TokenValue::Byte(1)).unwrap_err();
        assert!(matches!(err, ProtocolError::TokenTypeMismatch { .. }));

        let err = stream.set_string(Sample::Count, "1").unwrap_err();
        assert!(matches!(err, ProtocolError::TokenTypeMismatch { .. }));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_type_mismatch_on_decode() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(TokenType::ULong.as_u16());
        buf.put_u16_le(0x0000);
        buf.put_u32_le(1);

        let err = TokenStream::<Sample>::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::TokenTypeMismatch { .. }));
    }

    #[test]
    fn test_unknown_token_type() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0x00FF);
        buf.put_u16_le(0x0000);

        let err = TokenStream::<Sample>::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTokenType(0x00FF)));
    }

    #[test]
    fn test_truncated_token() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(TokenType::String.as_u16());
        buf.put_u16_le(0x0004);
        buf.put_u16_le(10);
        buf.put_slice(b"abc");

        let err = TokenStream::<Sample>::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 7, .. }));
    }

    #[test]
    fn test_oversize_value_rejected_before_writing() {
        let mut stream = TokenStream::<Sample>::new();
        stream.set(Sample::Flag, TokenValue::Byte(1)).unwrap();
        stream.set_string(Sample::Name, "n".repeat(256)).unwrap();

        let mut buf = BytesMut::from(&b"prefix"[..]);
        let err = stream.encode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ValueTooLong {
                length: 256,
                max: 255,
                ..
            }
        ));
        assert_eq!(&buf[..], b"prefix");
    }

    #[test]
    fn test_decode_into_reuses_stream() {
        let mut first = TokenStream::<Sample>::new();
        first.set(Sample::Flag, TokenValue::Byte(1)).unwrap();
        first.set(Sample::Count, TokenValue::ULong(5)).unwrap();
        let mut second = TokenStream::<Sample>::new();
        second.set(Sample::Flag, TokenValue::Byte(0)).unwrap();

        let mut reused = TokenStream::<Sample>::new();
        let mut buf = BytesMut::new();
        first.encode(&mut buf).unwrap();
        reused.decode_into(&mut buf.split().freeze()).unwrap();
        assert_eq!(reused.get_u32(Sample::Count), Some(5));

        second.encode(&mut buf).unwrap();
        reused.decode_into(&mut buf.split().freeze()).unwrap();
        assert_eq!(reused, second);
        assert!(!reused.is_present(Sample::Count));
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(TokenType::Byte.as_u16());
        buf.put_u16_le(0x0000);
        buf.put_u8(1);
        buf.put_u16_le(TokenType::SmallString.as_u16());
        buf.put_u16_le(0x0003);
        buf.put_u8(2);
        buf.put_slice(&[0xC3, 0x28]);

        let err = TokenStream::<Sample>::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUtf8("Name")));
    }

    #[test]
    fn test_debug_lists_present_tokens() {
        let mut stream = TokenStream::<Sample>::new();
        stream.set(Sample::Count, TokenValue::ULong(9)).unwrap();
        let rendered = format!("{:?}", stream);
        assert!(rendered.contains("Count"));
        assert!(!rendered.contains("Flag"));
    }

    proptest! {
        #[test]
        fn prop_sparse_streams_roundtrip(
            flag in any::<u8>(),
            count in proptest::option::of(any::<u32>()),
            offset in proptest::option::of(any::<i64>()),
            name in proptest::option::of("[a-zA-Z0-9/._-]{0,255}"),
            path in proptest::option::of(".{0,64}"),
            blob in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..512)),
            charge in proptest::option::of(-1.0e9f64..1.0e9f64),
        ) {
            let mut stream = TokenStream::<Sample>::new();
            stream.set(Sample::Flag, TokenValue::Byte(flag)).unwrap();
            if let Some(count) = count {
                stream.set(Sample::Count, TokenValue::ULong(count)).unwrap();
            }
            if let Some(offset) = offset {
                stream.set(Sample::Offset, TokenValue::LongLong(offset)).unwrap();
            }
            if let Some(name) = name {
                stream.set_string(Sample::Name, name).unwrap();
            }
            if let Some(path) = path {
                stream.set_string(Sample::Path, path).unwrap();
            }
            if let Some(blob) = blob {
                stream.set_bytes(Sample::Blob, blob).unwrap();
            }
            if let Some(charge) = charge {
                stream.set(Sample::Charge, TokenValue::Double(charge)).unwrap();
            }

            let decoded = roundtrip(&stream);
            prop_assert_eq!(decoded, stream);
        }
    }
}
