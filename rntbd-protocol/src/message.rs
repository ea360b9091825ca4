//! Request and response frames.

use crate::catalogue::{RequestToken, ResponseToken};
use crate::error::ProtocolError;
use crate::frame::{RequestHeader, ResponseHeader, BODY_LENGTH_SIZE, FRAME_HEADER_SIZE};
use crate::token::{TokenStream, TokenValue};
use crate::RESPONSE_LENGTH_LIMIT;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Declares a fieldless wire enum with a fallible conversion from its integer.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident : $repr:ty {
            $( $variant:ident = $value:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        pub enum $name {
            $( $variant = $value, )*
        }

        impl $name {
            pub fn value(self) -> $repr {
                self as $repr
            }
        }

        impl TryFrom<$repr> for $name {
            type Error = ProtocolError;

            fn try_from(value: $repr) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok($name::$variant), )*
                    other => Err(ProtocolError::UnknownEnumValue {
                        kind: stringify!($name),
                        value: other as u16,
                    }),
                }
            }
        }
    };
}

wire_enum! {
    /// Resource type carried in the request header.
    pub enum ResourceType: u16 {
        Connection = 0x0000,
        Database = 0x0001,
        Collection = 0x0002,
        Document = 0x0003,
        Attachment = 0x0004,
        User = 0x0005,
        Permission = 0x0006,
        StoredProcedure = 0x0007,
        Conflict = 0x0008,
        Trigger = 0x0009,
        UserDefinedFunction = 0x000A,
        Module = 0x000B,
        Replica = 0x000C,
        ModuleCommand = 0x000D,
        Record = 0x000E,
        Offer = 0x000F,
        PartitionSetInformation = 0x0010,
        XpReplicatorAddress = 0x0011,
        MasterPartition = 0x0012,
        ServerPartition = 0x0013,
        DatabaseAccount = 0x0014,
        Topology = 0x0015,
        PartitionKeyRange = 0x0016,
        Schema = 0x0018,
        BatchApply = 0x0019,
        RestoreMetadata = 0x001A,
        ComputeGatewayCharges = 0x001B,
        RidRange = 0x001C,
        UserDefinedType = 0x001D,
        VectorClock = 0x001F,
        PartitionKey = 0x0020,
        Snapshot = 0x0021,
        ClientEncryptionKey = 0x0023,
        Transaction = 0x0025,
        PartitionedSystemDocument = 0x0026,
        RoleDefinition = 0x0027,
        RoleAssignment = 0x0028,
        SystemDocument = 0x0029,
        InteropUser = 0x002A,
        TransportControlCommand = 0x002B,
        AuthPolicyElement = 0x002C,
        StorageAuthToken = 0x002D,
        RetriableWriteCachedResponse = 0x002E,
    }
}

wire_enum! {
    /// Operation type carried in the request header.
    pub enum OperationType: u16 {
        Connection = 0x0000,
        Create = 0x0001,
        Patch = 0x0002,
        Read = 0x0003,
        ReadFeed = 0x0004,
        Delete = 0x0005,
        Replace = 0x0006,
        ExecuteJavaScript = 0x0008,
        SqlQuery = 0x0009,
        Pause = 0x000A,
        Resume = 0x000B,
        Stop = 0x000C,
        Recycle = 0x000D,
        Crash = 0x000E,
        Query = 0x000F,
        ForceConfigRefresh = 0x0010,
        Head = 0x0011,
        HeadFeed = 0x0012,
        Upsert = 0x0013,
        Recreate = 0x0014,
        Throttle = 0x0015,
        GetSplitPoint = 0x0016,
        PreCreateValidation = 0x0017,
        BatchApply = 0x0018,
        AbortSplit = 0x0019,
        CompleteSplit = 0x001A,
        OfferUpdateOperation = 0x001B,
        OfferPreGrowValidation = 0x001C,
        BatchReportThroughputUtilization = 0x001D,
        CompletePartitionMigration = 0x001E,
        AbortPartitionMigration = 0x001F,
        PreReplaceValidation = 0x0020,
        AddComputeGatewayRequestCharges = 0x0021,
        MigratePartition = 0x0022,
        MasterReplaceOfferOperation = 0x0023,
        ProvisionedCollectionOfferUpdateOperation = 0x0024,
        Batch = 0x0025,
        InitiateDatabaseOfferPartitionShrink = 0x0026,
        CompleteDatabaseOfferPartitionShrink = 0x0027,
        EnsureSnapshotOperation = 0x0028,
        GetSplitPoints = 0x0029,
        CompleteMergeOnTarget = 0x002A,
        CompleteMergeOnMaster = 0x002C,
        ForcePartitionBackup = 0x002E,
        CompleteUserTransaction = 0x002F,
        MasterInitiatedProgressCoordination = 0x0030,
        MetadataCheckAccess = 0x0031,
        CreateSystemSnapshot = 0x0032,
        UpdateFailoverPriorityList = 0x0033,
        GetStorageAuthToken = 0x0034,
    }
}

impl OperationType {
    /// Operations that never mutate server state.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            OperationType::Read
                | OperationType::ReadFeed
                | OperationType::Head
                | OperationType::HeadFeed
                | OperationType::Query
                | OperationType::SqlQuery
        )
    }
}

wire_enum! {
    /// Value of the ConsistencyLevel request token.
    pub enum ConsistencyLevel: u8 {
        Strong = 0x00,
        BoundedStaleness = 0x01,
        Session = 0x02,
        Eventual = 0x03,
        ConsistentPrefix = 0x04,
    }
}

wire_enum! {
    /// Value of the IndexingDirective tokens.
    pub enum IndexingDirective: u8 {
        Default = 0x00,
        Include = 0x01,
        Exclude = 0x02,
    }
}

wire_enum! {
    /// Value of the ContentSerializationFormat request token.
    pub enum ContentSerializationFormat: u8 {
        JsonText = 0x00,
        CosmosBinary = 0x01,
        HybridRow = 0x02,
    }
}

/// Reads a length-prefixed body following a frame's metadata.
///
/// Returns `Ok(None)` when `buf` does not yet hold the whole body.
fn peek_body(buf: &[u8]) -> Option<(usize, Bytes)> {
    if buf.len() < BODY_LENGTH_SIZE {
        return None;
    }
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < BODY_LENGTH_SIZE + length {
        return None;
    }
    let body = Bytes::copy_from_slice(&buf[BODY_LENGTH_SIZE..BODY_LENGTH_SIZE + length]);
    Some((BODY_LENGTH_SIZE + length, body))
}

fn put_body(buf: &mut BytesMut, body: &Bytes) -> Result<(), ProtocolError> {
    let length = u32::try_from(body.len()).map_err(|_| ProtocolError::BodyTooLarge(body.len()))?;
    buf.put_u32_le(length);
    buf.put_slice(body);
    Ok(())
}

/// A per-call request: header fields, tokens and an optional body.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
    pub activity_id: Uuid,
    pub tokens: TokenStream<RequestToken>,
    pub body: Option<Bytes>,
}

impl RequestFrame {
    pub fn new(
        resource_type: ResourceType,
        operation_type: OperationType,
        activity_id: Uuid,
    ) -> Self {
        Self {
            resource_type,
            operation_type,
            activity_id,
            tokens: TokenStream::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the Date token in RFC 1123 form.
    pub fn set_date(&mut self, date: DateTime<Utc>) -> Result<&mut Self, ProtocolError> {
        self.tokens.set_string(
            RequestToken::Date,
            date.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        )?;
        Ok(self)
    }

    /// Encodes the frame, keeping PayloadPresent in step with the body.
    pub fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        self.tokens.set(
            RequestToken::PayloadPresent,
            TokenValue::Byte(u8::from(self.body.is_some())),
        )?;

        let metadata_len = self.tokens.encoded_len()?;
        let total_length = u32::try_from(FRAME_HEADER_SIZE + metadata_len).map_err(|_| {
            ProtocolError::InvalidLength {
                length: u32::MAX,
                min: FRAME_HEADER_SIZE as u32,
                max: u32::MAX,
            }
        })?;
        let body_len = self.body.as_ref().map_or(0, |b| BODY_LENGTH_SIZE + b.len());
        let mut buf = BytesMut::with_capacity(total_length as usize + body_len);

        RequestHeader {
            total_length,
            resource_type: self.resource_type.value(),
            operation_type: self.operation_type.value(),
            activity_id: self.activity_id,
        }
        .encode(&mut buf);
        self.tokens.encode(&mut buf)?;
        if let Some(ref body) = self.body {
            put_body(&mut buf, body)?;
        }
        Ok(buf)
    }

    /// Decodes a request frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = RequestHeader::decode(&buf[..FRAME_HEADER_SIZE])?;
        let total = header.total_length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let tokens = TokenStream::<RequestToken>::decode(Bytes::copy_from_slice(
            &buf[FRAME_HEADER_SIZE..total],
        ))?;
        let (consumed, body) = if tokens.get_u8(RequestToken::PayloadPresent) == Some(0) {
            (total, None)
        } else {
            match peek_body(&buf[total..]) {
                Some((body_len, body)) => (total + body_len, Some(body)),
                None => return Ok(None),
            }
        };

        let resource_type = ResourceType::try_from(header.resource_type)?;
        let operation_type = OperationType::try_from(header.operation_type)?;
        buf.advance(consumed);

        Ok(Some(Self {
            resource_type,
            operation_type,
            activity_id: header.activity_id,
            tokens,
            body,
        }))
    }
}

/// A per-call response: status, tokens and an optional body.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub status: u32,
    pub activity_id: Uuid,
    pub tokens: TokenStream<ResponseToken>,
    pub body: Option<Bytes>,
}

impl ResponseFrame {
    pub fn new(status: u32, activity_id: Uuid) -> Self {
        Self {
            status,
            activity_id,
            tokens: TokenStream::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Encodes the frame, keeping PayloadPresent in step with the body.
    pub fn encode(&mut self) -> Result<BytesMut, ProtocolError> {
        self.tokens.set(
            ResponseToken::PayloadPresent,
            TokenValue::Byte(u8::from(self.body.is_some())),
        )?;

        let metadata_len = self.tokens.encoded_len()?;
        let total_length = (FRAME_HEADER_SIZE + metadata_len) as u32;
        let mut buf = BytesMut::with_capacity(total_length as usize);
        ResponseHeader {
            total_length,
            status: self.status,
            activity_id: self.activity_id,
        }
        .encode(&mut buf);
        self.tokens.encode(&mut buf)?;
        if let Some(ref body) = self.body {
            put_body(&mut buf, body)?;
        }
        Ok(buf)
    }

    /// Decodes a response frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = ResponseHeader::decode(&buf[..FRAME_HEADER_SIZE], RESPONSE_LENGTH_LIMIT)?;
        let total = header.total_length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = Self::from_parts(
            header,
            Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total]),
        )?;
        let consumed = if frame.payload_present() {
            match peek_body(&buf[total..]) {
                Some((body_len, body)) => {
                    frame.body = Some(body);
                    total + body_len
                }
                None => return Ok(None),
            }
        } else {
            total
        };
        buf.advance(consumed);
        Ok(Some(frame))
    }

    /// Builds a frame from a decoded header and its metadata block.
    pub fn from_parts(header: ResponseHeader, metadata: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: header.status,
            activity_id: header.activity_id,
            tokens: TokenStream::decode(metadata)?,
            body: None,
        })
    }

    pub fn payload_present(&self) -> bool {
        self.tokens
            .get_u8(ResponseToken::PayloadPresent)
            .is_some_and(|present| present != 0)
    }

    pub fn transport_request_id(&self) -> Option<u32> {
        self.tokens.get_u32(ResponseToken::TransportRequestId)
    }

    pub fn lsn(&self) -> Option<i64> {
        self.tokens.get_i64(ResponseToken::Lsn)
    }

    pub fn sub_status(&self) -> Option<u32> {
        self.tokens.get_u32(ResponseToken::SubStatus)
    }

    pub fn partition_key_range_id(&self) -> Option<&str> {
        self.tokens.get_str(ResponseToken::PartitionKeyRangeId)
    }

    pub fn session_token(&self) -> Option<&str> {
        self.tokens.get_str(ResponseToken::SessionToken)
    }

    pub fn request_charge(&self) -> Option<f64> {
        self.tokens
            .get(ResponseToken::RequestCharge)
            .and_then(TokenValue::as_f64)
    }

    /// Present tokens rendered under their backend header names.
    pub fn headers(&self) -> BTreeMap<&'static str, String> {
        let mut headers = BTreeMap::new();
        for (token, value) in self.tokens.iter() {
            let rendered = match token {
                ResponseToken::RequestCharge => value.as_f64().map(format_request_charge),
                ResponseToken::IndexingDirective => value
                    .as_u8()
                    .and_then(|v| IndexingDirective::try_from(v).ok())
                    .map(|d| format!("{:?}", d)),
                _ => Some(value.to_header_value()),
            };
            if let (Some(name), Some(rendered)) = (header_name(token), rendered) {
                headers.insert(name, rendered);
            }
        }
        headers.insert("x-ms-activity-id", self.activity_id.to_string());
        headers
    }
}

/// Formats a charge with at most two decimals and no trailing zeros.
fn format_request_charge(charge: f64) -> String {
    let fixed = format!("{:.2}", charge);
    fixed
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

fn header_name(token: ResponseToken) -> Option<&'static str> {
    use ResponseToken::*;
    Some(match token {
        LastStateChangeDateTime => "x-ms-last-state-change-utc",
        ContinuationToken => "x-ms-continuation",
        ETag => "etag",
        RetryAfterMilliseconds => "x-ms-retry-after-ms",
        StorageMaxResourceQuota => "x-ms-resource-quota",
        StorageResourceQuotaUsage => "x-ms-resource-usage",
        SchemaVersion => "x-ms-schemaversion",
        CollectionPartitionIndex => "collection-partition-index",
        CollectionServiceIndex => "collection-service-index",
        Lsn => "lsn",
        ItemCount => "x-ms-item-count",
        RequestCharge => "x-ms-request-charge",
        OwnerFullName => "x-ms-alt-content-path",
        OwnerId => "x-ms-content-path",
        DatabaseAccountId => "x-ms-database-account-id",
        QuorumAckedLsn => "x-ms-quorum-acked-lsn",
        RequestValidationFailure => "x-ms-request-validation-failure",
        SubStatus => "x-ms-substatus",
        CurrentWriteQuorum => "x-ms-current-write-quorum",
        CurrentReplicaSetSize => "x-ms-current-replica-set-size",
        PartitionKeyRangeId => "x-ms-documentdb-partitionkeyrangeid",
        LogResults => "x-ms-documentdb-script-log-results",
        XpRole => "x-ms-xp-role",
        QueryMetrics => "x-ms-documentdb-query-metrics",
        GlobalCommittedLsn => "x-ms-global-committed-lsn",
        NumberOfReadRegions => "x-ms-number-of-read-regions",
        ItemLsn => "x-ms-item-lsn",
        TransportRequestId => "x-ms-transport-request-id",
        ServerDateTimeUtc => "x-ms-date",
        LocalLsn => "x-ms-cosmos-llsn",
        QuorumAckedLocalLsn => "x-ms-cosmos-quorum-acked-llsn",
        ItemLocalLsn => "x-ms-cosmos-item-llsn",
        HasTentativeWrites => "x-ms-cosmosdb-has-tentative-writes",
        SessionToken => "x-ms-session-token",
        ResponseToken::IndexingDirective => "x-ms-indexing-directive",
        BackendRequestDurationMilliseconds => "x-ms-request-duration-ms",
        _ => return None,
    })
}
