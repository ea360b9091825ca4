//! Mapping of backend status codes to typed server errors.

use crate::message::ResponseFrame;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Sub-status codes that refine a 410 Gone.
pub mod sub_status {
    pub const NAME_CACHE_IS_STALE: u32 = 1000;
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    pub const COMPLETING_SPLIT: u32 = 1007;
    pub const COMPLETING_PARTITION_MIGRATION: u32 = 1008;
}

/// The typed error a failed status maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    Conflict,
    Gone,
    /// Gone because the caller's routing cache is stale.
    InvalidPartition,
    PartitionKeyRangeGone,
    PartitionKeyRangeIsSplitting,
    PartitionIsMigrating,
    PreconditionFailed,
    RequestEntityTooLarge,
    Locked,
    RequestRateTooLarge,
    RetryWith,
    InternalServerError,
    ServiceUnavailable,
}

impl ServerErrorKind {
    /// Maps a status (and for 410 its sub-status) to an error kind.
    ///
    /// Returns `None` for success statuses and 304.
    pub fn from_status(status: u32, sub_status: Option<u32>) -> Option<Self> {
        if status < 300 || status == 304 {
            return None;
        }
        Some(match status {
            400 => ServerErrorKind::BadRequest,
            401 => ServerErrorKind::Unauthorized,
            403 => ServerErrorKind::Forbidden,
            404 => ServerErrorKind::NotFound,
            405 => ServerErrorKind::MethodNotAllowed,
            408 => ServerErrorKind::RequestTimeout,
            409 => ServerErrorKind::Conflict,
            410 => match sub_status {
                Some(sub_status::NAME_CACHE_IS_STALE) => ServerErrorKind::InvalidPartition,
                Some(sub_status::PARTITION_KEY_RANGE_GONE) => {
                    ServerErrorKind::PartitionKeyRangeGone
                }
                Some(sub_status::COMPLETING_SPLIT) => ServerErrorKind::PartitionKeyRangeIsSplitting,
                Some(sub_status::COMPLETING_PARTITION_MIGRATION) => {
                    ServerErrorKind::PartitionIsMigrating
                }
                _ => ServerErrorKind::Gone,
            },
            412 => ServerErrorKind::PreconditionFailed,
            413 => ServerErrorKind::RequestEntityTooLarge,
            423 => ServerErrorKind::Locked,
            429 => ServerErrorKind::RequestRateTooLarge,
            449 => ServerErrorKind::RetryWith,
            500 => ServerErrorKind::InternalServerError,
            503 => ServerErrorKind::ServiceUnavailable,
            _ => ServerErrorKind::InternalServerError,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ServerErrorKind::BadRequest => "BadRequest",
            ServerErrorKind::Unauthorized => "Unauthorized",
            ServerErrorKind::Forbidden => "Forbidden",
            ServerErrorKind::NotFound => "NotFound",
            ServerErrorKind::MethodNotAllowed => "MethodNotAllowed",
            ServerErrorKind::RequestTimeout => "RequestTimeout",
            ServerErrorKind::Conflict => "Conflict",
            ServerErrorKind::Gone => "Gone",
            ServerErrorKind::InvalidPartition => "InvalidPartition",
            ServerErrorKind::PartitionKeyRangeGone => "PartitionKeyRangeGone",
            ServerErrorKind::PartitionKeyRangeIsSplitting => "PartitionKeyRangeIsSplitting",
            ServerErrorKind::PartitionIsMigrating => "PartitionIsMigrating",
            ServerErrorKind::PreconditionFailed => "PreconditionFailed",
            ServerErrorKind::RequestEntityTooLarge => "RequestEntityTooLarge",
            ServerErrorKind::Locked => "Locked",
            ServerErrorKind::RequestRateTooLarge => "RequestRateTooLarge",
            ServerErrorKind::RetryWith => "RetryWith",
            ServerErrorKind::InternalServerError => "InternalServerError",
            ServerErrorKind::ServiceUnavailable => "ServiceUnavailable",
        }
    }

    /// Message used when the response body carries none.
    pub fn default_message(self) -> &'static str {
        match self {
            ServerErrorKind::BadRequest => "The request is malformed.",
            ServerErrorKind::Unauthorized => "The request is not authorized.",
            ServerErrorKind::Forbidden => "The request is forbidden.",
            ServerErrorKind::NotFound => "The requested resource was not found.",
            ServerErrorKind::MethodNotAllowed => "The operation is not allowed on this resource.",
            ServerErrorKind::RequestTimeout => "The request timed out on the server.",
            ServerErrorKind::Conflict => "The resource already exists.",
            ServerErrorKind::Gone => "The requested resource is no longer available at this replica.",
            ServerErrorKind::InvalidPartition => "The partition address is stale.",
            ServerErrorKind::PartitionKeyRangeGone => "The partition key range is gone.",
            ServerErrorKind::PartitionKeyRangeIsSplitting => "The partition key range is splitting.",
            ServerErrorKind::PartitionIsMigrating => "The partition is migrating.",
            ServerErrorKind::PreconditionFailed => "A precondition of the request failed.",
            ServerErrorKind::RequestEntityTooLarge => "The request entity is too large.",
            ServerErrorKind::Locked => "The resource is locked.",
            ServerErrorKind::RequestRateTooLarge => "The request rate is too large.",
            ServerErrorKind::RetryWith => "The operation should be retried with different parameters.",
            ServerErrorKind::InternalServerError => "Invalid backend response.",
            ServerErrorKind::ServiceUnavailable => "The service is unavailable.",
        }
    }

    /// True for 410 and its refinements.
    pub fn is_gone_family(self) -> bool {
        matches!(
            self,
            ServerErrorKind::Gone
                | ServerErrorKind::InvalidPartition
                | ServerErrorKind::PartitionKeyRangeGone
                | ServerErrorKind::PartitionKeyRangeIsSplitting
                | ServerErrorKind::PartitionIsMigrating
        )
    }

    /// True when a caller may reasonably retry the same request.
    pub fn is_retryable(self) -> bool {
        self.is_gone_family()
            || matches!(
                self,
                ServerErrorKind::RequestTimeout
                    | ServerErrorKind::RequestRateTooLarge
                    | ServerErrorKind::RetryWith
                    | ServerErrorKind::ServiceUnavailable
            )
    }
}

impl fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed backend response.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} (status {status}, activity {activity_id}): {message}")]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub status: u32,
    pub sub_status: Option<u32>,
    pub lsn: Option<i64>,
    pub partition_key_range_id: Option<String>,
    pub resource_address: String,
    pub activity_id: Uuid,
    pub message: String,
    pub headers: BTreeMap<&'static str, String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Derives the error message from a response body.
pub fn error_message(body: Option<&[u8]>, kind: ServerErrorKind) -> String {
    let body = match body {
        Some(body) if !body.is_empty() => body,
        _ => return kind.default_message().to_string(),
    };
    if let Ok(ErrorBody {
        message: Some(message),
    }) = serde_json::from_slice::<ErrorBody>(body)
    {
        if !message.is_empty() {
            return message;
        }
    }
    match std::str::from_utf8(body) {
        Ok(text) if !text.trim().is_empty() => text.to_string(),
        _ => kind.default_message().to_string(),
    }
}

/// Maps a decoded response to a server error, or `None` when it succeeded.
pub fn map_status(response: &ResponseFrame, resource_address: &str) -> Option<ServerError> {
    let sub_status = response.sub_status();
    let kind = ServerErrorKind::from_status(response.status, sub_status)?;
    Some(ServerError {
        kind,
        status: response.status,
        sub_status,
        lsn: response.lsn(),
        partition_key_range_id: response.partition_key_range_id().map(str::to_string),
        resource_address: resource_address.to_string(),
        activity_id: response.activity_id,
        message: error_message(response.body.as_deref(), kind),
        headers: response.headers(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::ResponseToken;
    use crate::token::TokenValue;

    #[test]
    fn test_success_statuses_map_to_none() {
        for status in [200, 201, 204, 299, 304] {
            assert_eq!(ServerErrorKind::from_status(status, None), None, "{}", status);
        }
        assert!(ServerErrorKind::from_status(300, None).is_some());
    }

    #[test]
    fn test_documented_statuses() {
        let cases = [
            (400, ServerErrorKind::BadRequest),
            (401, ServerErrorKind::Unauthorized),
            (403, ServerErrorKind::Forbidden),
            (404, ServerErrorKind::NotFound),
            (405, ServerErrorKind::MethodNotAllowed),
            (408, ServerErrorKind::RequestTimeout),
            (409, ServerErrorKind::Conflict),
            (410, ServerErrorKind::Gone),
            (412, ServerErrorKind::PreconditionFailed),
            (413, ServerErrorKind::RequestEntityTooLarge),
            (423, ServerErrorKind::Locked),
            (429, ServerErrorKind::RequestRateTooLarge),
            (449, ServerErrorKind::RetryWith),
            (500, ServerErrorKind::InternalServerError),
            (503, ServerErrorKind::ServiceUnavailable),
            (418, ServerErrorKind::InternalServerError),
        ];
        for (status, kind) in cases {
            assert_eq!(ServerErrorKind::from_status(status, None), Some(kind), "{}", status);
        }
    }

    #[test]
    fn test_gone_sub_statuses() {
        let cases = [
            (1000, ServerErrorKind::InvalidPartition),
            (1002, ServerErrorKind::PartitionKeyRangeGone),
            (1007, ServerErrorKind::PartitionKeyRangeIsSplitting),
            (1008, ServerErrorKind::PartitionIsMigrating),
            (1001, ServerErrorKind::Gone),
        ];
        for (sub, kind) in cases {
            let mapped = ServerErrorKind::from_status(410, Some(sub)).unwrap();
            assert_eq!(mapped, kind);
            assert!(mapped.is_gone_family());
        }
        // Sub-status only refines 410.
        assert_eq!(
            ServerErrorKind::from_status(404, Some(1002)),
            Some(ServerErrorKind::NotFound)
        );
    }

    #[test]
    fn test_map_status_copies_context() {
        let activity_id = Uuid::new_v4();
        let mut response = ResponseFrame::new(410, activity_id)
            .with_body(&br#"{"code":"Gone","message":"range moved"}"#[..]);
        response
            .tokens
            .set(ResponseToken::SubStatus, TokenValue::ULong(1002))
            .unwrap()
            .set(ResponseToken::Lsn, TokenValue::LongLong(512))
            .unwrap()
            .set_string(ResponseToken::PartitionKeyRangeId, "7")
            .unwrap();

        let err = map_status(&response, "dbs/a/colls/b").unwrap();
        assert_eq!(err.kind, ServerErrorKind::PartitionKeyRangeGone);
        assert_eq!(err.lsn, Some(512));
        assert_eq!(err.partition_key_range_id.as_deref(), Some("7"));
        assert_eq!(err.resource_address, "dbs/a/colls/b");
        assert_eq!(err.activity_id, activity_id);
        assert_eq!(err.message, "range moved");
        assert_eq!(err.headers["x-ms-substatus"], "1002");
        assert!(err.to_string().contains("PartitionKeyRangeGone"));
    }

    #[test]
    fn test_map_status_success() {
        let response = ResponseFrame::new(201, Uuid::nil());
        assert!(map_status(&response, "dbs/a").is_none());
    }

    #[test]
    fn test_error_message_fallbacks() {
        let kind = ServerErrorKind::NotFound;
        assert_eq!(error_message(None, kind), kind.default_message());
        assert_eq!(error_message(Some(b""), kind), kind.default_message());
        assert_eq!(error_message(Some(b"plain text"), kind), "plain text");
        assert_eq!(error_message(Some(&[0xff, 0xfe]), kind), kind.default_message());
        assert_eq!(
            error_message(Some(br#"{"code":"NotFound","message":"no such doc"}"#), kind),
            "no such doc"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ServerErrorKind::RequestRateTooLarge.is_retryable());
        assert!(ServerErrorKind::PartitionIsMigrating.is_retryable());
        assert!(!ServerErrorKind::Conflict.is_retryable());
        assert!(!ServerErrorKind::NotFound.is_gone_family());
    }
}
