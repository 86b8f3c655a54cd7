#![forbid(unsafe_code)]

use avatar_kernel_contracts::avatar::{
    AgentId, AvatarRecord, AvatarRequest, CallerUserId, KnowledgeId, RecordFailure, RecordId,
};

use crate::records::{AvatarRecordStore, RecordStatusCounts, StorageError};

/// Typed repository interface for avatar provisioning records.
pub trait AvatarRecordRepo: Send + Sync {
    fn create_pending(
        &self,
        request: &AvatarRequest,
        caller_user_id: &CallerUserId,
    ) -> Result<RecordId, StorageError>;

    fn mark_created(
        &self,
        record_id: &RecordId,
        knowledge_id: KnowledgeId,
        agent_id: AgentId,
    ) -> Result<(), StorageError>;

    fn mark_failed(
        &self,
        record_id: &RecordId,
        failure: RecordFailure,
        knowledge_id: Option<KnowledgeId>,
    ) -> Result<(), StorageError>;

    fn get(&self, record_id: &RecordId) -> Result<Option<AvatarRecord>, StorageError>;

    fn status_counts(&self) -> Result<RecordStatusCounts, StorageError>;
}

impl AvatarRecordRepo for AvatarRecordStore {
    fn create_pending(
        &self,
        request: &AvatarRequest,
        caller_user_id: &CallerUserId,
    ) -> Result<RecordId, StorageError> {
        self.insert_pending_record(request, caller_user_id)
    }

    fn mark_created(
        &self,
        record_id: &RecordId,
        knowledge_id: KnowledgeId,
        agent_id: AgentId,
    ) -> Result<(), StorageError> {
        self.apply_created(record_id, knowledge_id, agent_id)
    }

    fn mark_failed(
        &self,
        record_id: &RecordId,
        failure: RecordFailure,
        knowledge_id: Option<KnowledgeId>,
    ) -> Result<(), StorageError> {
        self.apply_failed(record_id, failure, knowledge_id)
    }

    fn get(&self, record_id: &RecordId) -> Result<Option<AvatarRecord>, StorageError> {
        self.record(record_id)
    }

    fn status_counts(&self) -> Result<RecordStatusCounts, StorageError> {
        AvatarRecordStore::status_counts(self)
    }
}
