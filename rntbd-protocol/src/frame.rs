//! Fixed RNTBD frame headers.
//!
//! Every frame starts with a 24-byte header followed by a token metadata
//! block and, when the PayloadPresent token is set, a length-prefixed body:
//!
//! ```text
//! request:
//! +--------------+---------------+----------------+-------------+
//! | total length | resource type | operation type | activity id |
//! | 4 bytes LE   | 2 bytes LE    | 2 bytes LE     | 16 bytes    |
//! +--------------+---------------+----------------+-------------+
//!
//! response:
//! +--------------+---------------+------------------------------+
//! | total length | status        | activity id                  |
//! | 4 bytes LE   | 4 bytes LE    | 16 bytes                     |
//! +--------------+---------------+------------------------------+
//!
//! | metadata (total length - 24 bytes) | [body length | body]    |
//! ```
//!
//! The total length covers the header and metadata, never the body.

use crate::error::ProtocolError;
use crate::RESPONSE_LENGTH_LIMIT;
use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

/// Size of the fixed frame header in bytes (4 + 4 + 16 = 24).
pub const FRAME_HEADER_SIZE: usize = 24;

/// Size of the body length prefix.
pub const BODY_LENGTH_SIZE: usize = 4;

/// Validates a declared total length against the header size and a ceiling.
pub fn check_total_length(length: u32, max: u32) -> Result<(), ProtocolError> {
    if (length as usize) < FRAME_HEADER_SIZE || length > max {
        return Err(ProtocolError::InvalidLength {
            length,
            min: FRAME_HEADER_SIZE as u32,
            max,
        });
    }
    Ok(())
}

/// Header of a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub total_length: u32,
    pub resource_type: u16,
    pub operation_type: u16,
    pub activity_id: Uuid,
}

impl RequestHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.total_length);
        buf.put_u16_le(self.resource_type);
        buf.put_u16_le(self.operation_type);
        buf.put_slice(&self.activity_id.to_bytes_le());
    }

    /// Decodes a header from exactly [`FRAME_HEADER_SIZE`] bytes.
    pub fn decode(mut raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                what: "request header",
                needed: FRAME_HEADER_SIZE - raw.len(),
            });
        }
        let total_length = raw.get_u32_le();
        check_total_length(total_length, u32::MAX)?;
        let resource_type = raw.get_u16_le();
        let operation_type = raw.get_u16_le();
        Ok(Self {
            total_length,
            resource_type,
            operation_type,
            activity_id: read_activity_id(&mut raw),
        })
    }

    pub fn metadata_len(&self) -> usize {
        self.total_length as usize - FRAME_HEADER_SIZE
    }
}

/// Header of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub total_length: u32,
    pub status: u32,
    pub activity_id: Uuid,
}

impl ResponseHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.total_length);
        buf.put_u32_le(self.status);
        buf.put_slice(&self.activity_id.to_bytes_le());
    }

    /// Decodes a header, rejecting total lengths outside `24..=max`.
    ///
    /// The check happens before the caller reads any metadata, so a bogus
    /// length is never used to size a read.
    pub fn decode(mut raw: &[u8], max: u32) -> Result<Self, ProtocolError> {
        if raw.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                what: "response header",
                needed: FRAME_HEADER_SIZE - raw.len(),
            });
        }
        let total_length = raw.get_u32_le();
        check_total_length(total_length, max)?;
        let status = raw.get_u32_le();
        Ok(Self {
            total_length,
            status,
            activity_id: read_activity_id(&mut raw),
        })
    }

    /// Decodes with the default response ceiling.
    pub fn decode_default(raw: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(raw, RESPONSE_LENGTH_LIMIT)
    }

    pub fn metadata_len(&self) -> usize {
        self.total_length as usize - FRAME_HEADER_SIZE
    }
}

fn read_activity_id(raw: &mut &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    raw.copy_to_slice(&mut bytes);
    Uuid::from_bytes_le(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_header_layout() {
        let activity_id = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let header = ResponseHeader {
            total_length: 30,
            status: 404,
            activity_id,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), FRAME_HEADER_SIZE);
        assert_eq!(&buf[0..4], &30u32.to_le_bytes());
        assert_eq!(&buf[4..8], &404u32.to_le_bytes());
        // GUIDs travel in their mixed-endian byte layout.
        assert_eq!(&buf[8..12], &[0x33, 0x22, 0x11, 0x00]);
        assert_eq!(&buf[12..14], &[0x55, 0x44]);
        assert_eq!(&buf[14..16], &[0x77, 0x66]);
        assert_eq!(&buf[16..24], &[0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        let decoded = ResponseHeader::decode_default(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.metadata_len(), 6);
    }

    #[test]
    fn test_request_header_roundtrip() {
        let header = RequestHeader {
            total_length: 64,
            resource_type: 3,
            operation_type: 1,
            activity_id: Uuid::new_v4(),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(RequestHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_length_below_header_size() {
        let header = ResponseHeader {
            total_length: 23,
            status: 200,
            activity_id: Uuid::nil(),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let err = ResponseHeader::decode_default(&buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidLength { length: 23, .. }
        ));
    }

    #[test]
    fn test_length_above_ceiling() {
        let header = ResponseHeader {
            total_length: 4097,
            status: 200,
            activity_id: Uuid::nil(),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert!(ResponseHeader::decode(&buf, 4097).is_ok());
        let err = ResponseHeader::decode(&buf, 4096).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidLength {
                length: 4097,
                max: 4096,
                ..
            }
        ));
    }

    #[test]
    fn test_default_ceiling_is_i32_max() {
        assert!(check_total_length(i32::MAX as u32, RESPONSE_LENGTH_LIMIT).is_ok());
        assert!(check_total_length(i32::MAX as u32 + 1, RESPONSE_LENGTH_LIMIT).is_err());
    }

    #[test]
    fn test_short_header() {
        let err = ResponseHeader::decode_default(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 14, .. }));
    }
}
