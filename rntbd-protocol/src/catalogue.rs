//! Token catalogues for each direction of the protocol.

use crate::token::token_catalogue;

token_catalogue! {
    /// Tokens of the connection negotiation request.
    pub enum ContextRequestToken("ContextRequest") {
        ProtocolVersion = 0x0000, ULong, required;
        ClientVersion = 0x0001, SmallString, required;
        UserAgent = 0x0002, SmallString, required;
        CallerId = 0x0003, Byte;
        EnableChannelMultiplexing = 0x0004, Byte;
    }
}

token_catalogue! {
    /// Tokens of the connection negotiation response.
    pub enum ContextResponseToken("ContextResponse") {
        ProtocolVersion = 0x0000, ULong;
        ClientVersion = 0x0001, SmallString;
        ServerAgent = 0x0002, SmallString, required;
        ServerVersion = 0x0003, SmallString, required;
        IdleTimeoutInSeconds = 0x0004, ULong;
        UnauthenticatedTimeoutInSeconds = 0x0005, ULong;
    }
}

token_catalogue! {
    /// Tokens of a per-call request.
    pub enum RequestToken("Request") {
        ResourceId = 0x0000, Bytes;
        AuthorizationToken = 0x0001, String;
        PayloadPresent = 0x0002, Byte, required;
        Date = 0x0003, SmallString;
        PageSize = 0x0004, ULong;
        SessionToken = 0x0005, String;
        ContinuationToken = 0x0006, String;
        IndexingDirective = 0x0007, Byte;
        Match = 0x0008, String;
        PreTriggerInclude = 0x0009, String;
        PostTriggerInclude = 0x000a, String;
        IsFanout = 0x000b, Byte;
        CollectionPartitionIndex = 0x000c, ULong;
        CollectionServiceIndex = 0x000d, ULong;
        PreTriggerExclude = 0x000e, String;
        PostTriggerExclude = 0x000f, String;
        ConsistencyLevel = 0x0010, Byte;
        EntityId = 0x0011, String;
        ResourceSchemaName = 0x0012, SmallString;
        ReplicaPath = 0x0013, String, required;
        ResourceTokenExpiry = 0x0014, ULong;
        DatabaseName = 0x0015, String;
        CollectionName = 0x0016, String;
        DocumentName = 0x0017, String;
        AttachmentName = 0x0018, String;
        UserName = 0x0019, String;
        PermissionName = 0x001a, String;
        StoredProcedureName = 0x001b, String;
        UserDefinedFunctionName = 0x001c, String;
        TriggerName = 0x001d, String;
        EnableScanInQuery = 0x001e, Byte;
        EmitVerboseTracesInQuery = 0x001f, Byte;
        ConflictName = 0x0020, String;
        BindReplicaDirective = 0x0021, String;
        PrimaryMasterKey = 0x0022, String;
        SecondaryMasterKey = 0x0023, String;
        PrimaryReadonlyKey = 0x0024, String;
        SecondaryReadonlyKey = 0x0025, String;
        ProfileRequest = 0x0026, Byte;
        EnableLowPrecisionOrderBy = 0x0027, Byte;
        ClientVersion = 0x0028, SmallString;
        CanCharge = 0x0029, Byte;
        CanThrottle = 0x002a, Byte;
        PartitionKey = 0x002b, String;
        PartitionKeyRangeId = 0x002c, String;
        MigrateCollectionDirective = 0x0031, Byte;
        SupportSpatialLegacyCoordinates = 0x0033, Byte;
        PartitionCount = 0x0034, ULong;
        CollectionRid = 0x0035, String;
        PartitionKeyRangeName = 0x0036, String;
        SchemaName = 0x003a, String;
        FilterBySchemaRid = 0x003b, String;
        UsePolygonsSmallerThanAHemisphere = 0x003c, Byte;
        GatewaySignature = 0x003d, String;
        EnableLogging = 0x003e, Byte;
        AIm = 0x003f, String;
        IfModifiedSince = 0x0047, String;
        PopulateQuotaInfo = 0x0040, Byte;
        DisableRuPerMinuteUsage = 0x0041, Byte;
        PopulateQueryMetrics = 0x0042, Byte;
        ResponseContinuationTokenLimitInKb = 0x0043, ULong;
        PopulatePartitionStatistics = 0x0044, Byte;
        RemoteStorageType = 0x0045, Byte;
        CollectionRemoteStorageSecurityIdentifier = 0x0046, String;
        PopulateCollectionThroughputInfo = 0x0048, Byte;
        RemainingTimeInMsOnClientRequest = 0x0049, ULong;
        ClientRetryAttemptCount = 0x004a, ULong;
        TargetLsn = 0x004b, LongLong;
        TargetGlobalCommittedLsn = 0x004c, LongLong;
        TransportRequestId = 0x004d, ULong;
        RestoreMetadataFilter = 0x004e, String;
        RestoreParams = 0x004f, String;
        ShareThroughput = 0x0050, Byte;
        PartitionResourceFilter = 0x0051, String;
        IsReadOnlyScript = 0x0052, Byte;
        IsAutoScaleRequest = 0x0053, Byte;
        ForceQueryScan = 0x0054, Byte;
        CanOfferReplaceComplete = 0x0056, Byte;
        ExcludeSystemProperties = 0x0057, Byte;
        BinaryId = 0x0058, Bytes;
        TimeToLiveInSeconds = 0x0059, ULong;
        EffectivePartitionKey = 0x005a, Bytes;
        BinaryPassthroughRequest = 0x005b, Byte;
        UserDefinedTypeName = 0x005c, String;
        EnableDynamicRidRangeAllocation = 0x005d, Byte;
        EnumerationDirection = 0x005e, Byte;
        StartId = 0x005f, Bytes;
        EndId = 0x0060, Bytes;
        FanoutOperationState = 0x0061, Byte;
        StartEpk = 0x0062, Bytes;
        EndEpk = 0x0063, Bytes;
        ReadFeedKeyType = 0x0064, Byte;
        ContentSerializationFormat = 0x0065, Byte;
        AllowTentativeWrites = 0x0066, Byte;
        IsUserRequest = 0x0067, Byte;
        PreserveFullContent = 0x0069, Byte;
        IncludeTentativeWrites = 0x0070, Byte;
        PopulateResourceCount = 0x0071, Byte;
        MergeStaticId = 0x0072, Bytes;
        IsBatchAtomic = 0x0073, Byte;
        ShouldBatchContinueOnError = 0x0074, Byte;
        IsBatchOrdered = 0x0075, Byte;
        SchemaOwnerRid = 0x0076, String;
        SchemaHash = 0x0077, Bytes;
        IsRuPerGbEnforcementRequest = 0x0078, Byte;
        MaxPollingIntervalMilliseconds = 0x0079, ULong;
        SnapshotName = 0x007a, String;
        PopulateLogStoreInfo = 0x007b, Byte;
        GetAllPartitionKeyStatistics = 0x007c, Byte;
        ForceSideBySideIndexMigration = 0x007d, Byte;
        CollectionChildResourceNameLimitInBytes = 0x007e, Bytes;
        CollectionChildResourceContentLengthLimitInKb = 0x007f, Bytes;
        ClientEncryptionKeyName = 0x0080, String;
        MergeCheckpointGlsnKeyName = 0x0081, LongLong;
        ReturnPreference = 0x0082, Byte;
        UniqueIndexNameEncodingMode = 0x0083, Byte;
        PopulateUnflushedMergeEntryCount = 0x0084, Byte;
        MigrateOfferToManualThroughput = 0x0085, Byte;
        MigrateOfferToAutopilot = 0x0086, Byte;
        IsClientEncrypted = 0x0087, Byte;
        SystemDocumentType = 0x0088, Byte;
        IsOfferStorageRefreshRequest = 0x0089, Byte;
        ResourceTypes = 0x008a, String;
        TransactionId = 0x008b, Bytes;
        TransactionFirstRequest = 0x008c, Byte;
        TransactionCommit = 0x008d, Byte;
        SystemDocumentName = 0x008e, String;
        UpdateMaxThroughputEverProvisioned = 0x008f, ULong;
        UniqueIndexReIndexingState = 0x0090, Byte;
        RoleDefinitionName = 0x0091, String;
        RoleAssignmentName = 0x0092, String;
        UseSystemBudget = 0x0093, Byte;
        IgnoreSystemLoweringMaxThroughput = 0x0094, Byte;
        TruncateMergeLogRequest = 0x0095, Byte;
        RetriableWriteRequestId = 0x0096, Bytes;
        IsRetriedWriteRequest = 0x0097, Byte;
        RetriableWriteRequestStartTimestamp = 0x0098, ULongLong;
        AddResourcePropertiesToResponse = 0x0099, Byte;
        ChangeFeedStartFullFidelityIfNoneMatch = 0x009a, String;
        SystemRestoreOperation = 0x009b, Byte;
        SkipRefreshDatabaseAccountConfigs = 0x009c, Byte;
        IntendedCollectionRid = 0x009d, String;
        UseArchivalPartition = 0x009e, Byte;
        PopulateUniqueIndexReIndexProgress = 0x009f, Byte;
        CollectionSchemaId = 0x00a0, Long;
        CollectionTruncate = 0x00a1, Byte;
        SdkSupportedCapabilities = 0x00a2, ULong;
        IsMaterializedViewBuild = 0x00a3, Byte;
        BuilderClientIdentifier = 0x00a4, String;
        SourceCollectionIfMatch = 0x00a5, String;
        RequestedCollectionType = 0x00a6, Byte;
        InteropUserName = 0x00a8, String;
        PopulateIndexMetrics = 0x00a9, Byte;
        PopulateAnalyticalMigrationProgress = 0x00aa, Byte;
        AuthPolicyElementName = 0x00ab, String;
        ShouldReturnCurrentServerDateTime = 0x00ac, Byte;
        RbacUserId = 0x00ad, String;
        RbacAction = 0x00ae, String;
        RbacResource = 0x00af, String;
        CorrelatedActivityId = 0x00b0, Guid;
        IsThroughputCapRequest = 0x00b1, Byte;
        ChangeFeedWireFormatVersion = 0x00b2, String;
        PopulateByokEncryptionProgress = 0x00b3, Byte;
        UseUserBackgroundBudget = 0x00b4, Byte;
        IncludePhysicalPartitionThroughputInfo = 0x00b5, String;
        IsServerlessStorageRefreshRequest = 0x00b6, Byte;
        UpdateOfferStateToPending = 0x00b7, Byte;
        PopulateOldestActiveSchema = 0x00b8, Byte;
        IsInternalServerlessRequest = 0x00b9, Byte;
        OfferReplaceRuRedistribution = 0x00ba, Byte;
    }
}

token_catalogue! {
    /// Tokens of a per-call response.
    pub enum ResponseToken("Response") {
        PayloadPresent = 0x0000, Byte, required;
        LastStateChangeDateTime = 0x0002, SmallString;
        ContinuationToken = 0x0003, String;
        ETag = 0x0004, String;
        ReadsPerformed = 0x0007, ULong;
        WritesPerformed = 0x0008, ULong;
        QueriesPerformed = 0x0009, ULong;
        IndexTermsGenerated = 0x000a, ULong;
        ScriptsExecuted = 0x000b, ULong;
        RetryAfterMilliseconds = 0x000c, ULong;
        IndexingDirective = 0x000d, Byte;
        StorageMaxResourceQuota = 0x000e, String;
        StorageResourceQuotaUsage = 0x000f, String;
        SchemaVersion = 0x0010, SmallString;
        CollectionPartitionIndex = 0x0011, ULong;
        CollectionServiceIndex = 0x0012, ULong;
        Lsn = 0x0013, LongLong;
        ItemCount = 0x0014, ULong;
        RequestCharge = 0x0015, Double;
        OwnerFullName = 0x0017, String;
        OwnerId = 0x0018, String;
        DatabaseAccountId = 0x0019, String;
        QuorumAckedLsn = 0x001a, LongLong;
        RequestValidationFailure = 0x001b, Byte;
        SubStatus = 0x001c, ULong;
        CollectionUpdateProgress = 0x001d, ULong;
        CurrentWriteQuorum = 0x001e, ULong;
        CurrentReplicaSetSize = 0x001f, ULong;
        CollectionLazyIndexProgress = 0x0020, ULong;
        PartitionKeyRangeId = 0x0021, String;
        LogResults = 0x0025, String;
        XpRole = 0x0026, ULong;
        IsRuPerMinuteUsed = 0x0027, Byte;
        QueryMetrics = 0x0028, String;
        GlobalCommittedLsn = 0x0029, LongLong;
        NumberOfReadRegions = 0x0030, ULong;
        OfferReplacePending = 0x0031, Byte;
        ItemLsn = 0x0032, LongLong;
        RestoreState = 0x0033, String;
        CollectionSecurityIdentifier = 0x0034, String;
        TransportRequestId = 0x0035, ULong;
        ShareThroughput = 0x0036, Byte;
        DisableRntbdChannel = 0x0038, Byte;
        ServerDateTimeUtc = 0x0039, SmallString;
        LocalLsn = 0x003a, LongLong;
        QuorumAckedLocalLsn = 0x003b, LongLong;
        ItemLocalLsn = 0x003c, LongLong;
        HasTentativeWrites = 0x003d, Byte;
        SessionToken = 0x003e, String;
        ReplicatorLsnToGlsnDelta = 0x003f, LongLong;
        ReplicatorLsnToLlsnDelta = 0x0040, LongLong;
        VectorClockLocalProgress = 0x0041, LongLong;
        MinimumRusForOffer = 0x0042, ULong;
        XpConfigurationSessionsCount = 0x0043, ULong;
        IndexUtilization = 0x0044, String;
        QueryExecutionInfo = 0x0045, String;
        UnflushedMergeLogEntryCount = 0x0046, LongLong;
        ResourceName = 0x0047, String;
        TimeToLiveInSeconds = 0x0048, LongLong;
        ReplicaStatusRevoked = 0x0049, Byte;
        SoftMaxAllowedThroughput = 0x0050, ULong;
        BackendRequestDurationMilliseconds = 0x0051, Double;
        CorrelatedActivityId = 0x0052, Guid;
        ConfirmedStoreChecksum = 0x0053, ULongLong;
        TentativeStoreChecksum = 0x0054, ULongLong;
        PendingPkDelete = 0x0055, Byte;
        AadAppliedRoleAssignmentId = 0x0056, String;
        CollectionUniqueIndexReIndexProgress = 0x0057, ULong;
        CollectionUniqueKeysUnderReIndex = 0x0058, String;
        AnalyticalMigrationProgress = 0x0059, ULong;
        TotalAccountThroughput = 0x005a, LongLong;
        ByokEncryptionProgress = 0x005b, Long;
        AppliedPolicyElementId = 0x005c, String;
        MergeProgressBlocked = 0x005d, Byte;
        ChangeFeedInfo = 0x005e, String;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Token, TokenType};
    use std::collections::HashSet;

    fn assert_unique_ids<T: Token>() {
        let ids: HashSet<u16> = T::ALL.iter().map(|token| token.id()).collect();
        assert_eq!(ids.len(), T::ALL.len(), "duplicate id in {}", T::CATALOGUE);
        for token in T::ALL {
            assert_eq!(T::from_id(token.id()), Some(*token));
            assert!((token.id() as usize) < T::SLOTS);
        }
    }

    #[test]
    fn test_identifiers_are_unique() {
        assert_unique_ids::<ContextRequestToken>();
        assert_unique_ids::<ContextResponseToken>();
        assert_unique_ids::<RequestToken>();
        assert_unique_ids::<ResponseToken>();
    }

    #[test]
    fn test_catalogue_sizes() {
        assert_eq!(RequestToken::ALL.len(), 170);
        assert_eq!(ResponseToken::ALL.len(), 75);
        assert_eq!(RequestToken::SLOTS, 0xBB);
        assert_eq!(ResponseToken::SLOTS, 0x5F);
    }

    #[test]
    fn test_required_tokens() {
        let required: Vec<_> = RequestToken::ALL
            .iter()
            .filter(|token| token.is_required())
            .collect();
        assert_eq!(
            required,
            vec![&RequestToken::PayloadPresent, &RequestToken::ReplicaPath]
        );

        let required: Vec<_> = ResponseToken::ALL
            .iter()
            .filter(|token| token.is_required())
            .collect();
        assert_eq!(required, vec![&ResponseToken::PayloadPresent]);
    }

    #[test]
    fn test_well_known_definitions() {
        assert_eq!(RequestToken::TransportRequestId.id(), 0x004D);
        assert_eq!(RequestToken::TransportRequestId.token_type(), TokenType::ULong);
        assert_eq!(ResponseToken::TransportRequestId.id(), 0x0035);
        assert_eq!(ResponseToken::Lsn.token_type(), TokenType::LongLong);
        assert_eq!(ResponseToken::RequestCharge.token_type(), TokenType::Double);
        assert_eq!(ResponseToken::SubStatus.id(), 0x001C);
        assert_eq!(
            RequestToken::CorrelatedActivityId.token_type(),
            TokenType::Guid
        );
        assert_eq!(ContextResponseToken::ServerVersion.name(), "ServerVersion");
    }
}
