#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use avatar_kernel_contracts::avatar::{
    AgentId, AvatarRecord, AvatarRequest, AvatarStatus, CallerUserId, KnowledgeId, RecordFailure,
    RecordId,
};
use avatar_kernel_contracts::{ContractViolation, Validate};

use crate::sealer::{credential_fingerprint, CredentialSealer, SealError};

const JOURNAL_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("record not found: {record_id}")]
    NotFound { record_id: String },
    #[error("duplicate record key: {key}")]
    DuplicateKey { key: String },
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
    #[error("credential seal failed: {0}")]
    Seal(#[from] SealError),
    #[error("record journal: {0}")]
    Journal(String),
    #[error("record store lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct RecordStatusCounts {
    pub pending: u32,
    pub created: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RecordJournalEvent {
    Created {
        record: AvatarRecord,
    },
    MarkedCreated {
        record_id: RecordId,
        knowledge_id: KnowledgeId,
        agent_id: AgentId,
        at_unix_ms: u64,
    },
    MarkedFailed {
        record_id: RecordId,
        failure: RecordFailure,
        knowledge_id: Option<KnowledgeId>,
        at_unix_ms: u64,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RecordJournalEntry {
    schema_version: u8,
    event: RecordJournalEvent,
}

impl RecordJournalEntry {
    fn v1(event: RecordJournalEvent) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            event,
        }
    }
}

#[derive(Debug, Clone)]
struct StorePersistenceConfig {
    journal_path: PathBuf,
}

/// Avatar records held in memory, optionally backed by an append-only JSONL journal.
///
/// Every mutation is applied to a copy first, journaled, and only then committed
/// to the map, so a failed append leaves memory unchanged.
#[derive(Debug)]
pub struct AvatarRecordStore {
    records: Mutex<BTreeMap<RecordId, AvatarRecord>>,
    sealer: CredentialSealer,
    persistence: Option<StorePersistenceConfig>,
}

impl AvatarRecordStore {
    pub fn new_in_memory(sealer: CredentialSealer) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            sealer,
            persistence: None,
        }
    }

    pub fn new_with_persistence(
        sealer: CredentialSealer,
        journal_path: PathBuf,
    ) -> Result<Self, StorageError> {
        let store = Self {
            records: Mutex::new(BTreeMap::new()),
            sealer,
            persistence: Some(StorePersistenceConfig { journal_path }),
        };
        store.ensure_persistence_ready()?;
        store.replay_journal()?;
        Ok(store)
    }

    pub fn sealer(&self) -> &CredentialSealer {
        &self.sealer
    }

    pub fn insert_pending_record(
        &self,
        request: &AvatarRequest,
        caller_user_id: &CallerUserId,
    ) -> Result<RecordId, StorageError> {
        let record_id = RecordId::generate();
        let record = AvatarRecord::pending_v1(
            record_id.clone(),
            caller_user_id.clone(),
            request,
            self.sealer.seal(&request.api_key)?,
            credential_fingerprint(&request.api_key),
            now_unix_ms(),
        )?;

        let mut records = self.lock()?;
        if records.contains_key(&record_id) {
            return Err(StorageError::DuplicateKey {
                key: record_id.as_str().to_string(),
            });
        }
        self.append_journal_entry(RecordJournalEvent::Created {
            record: record.clone(),
        })?;
        records.insert(record_id.clone(), record);
        tracing::debug!(record_id = %record_id, caller = %caller_user_id, "avatar record pending");
        Ok(record_id)
    }

    pub fn apply_created(
        &self,
        record_id: &RecordId,
        knowledge_id: KnowledgeId,
        agent_id: AgentId,
    ) -> Result<(), StorageError> {
        let at_unix_ms = now_unix_ms();
        let mut records = self.lock()?;
        let current = records
            .get(record_id)
            .ok_or_else(|| StorageError::NotFound {
                record_id: record_id.as_str().to_string(),
            })?;
        let mut next = current.clone();
        next.mark_created(knowledge_id.clone(), agent_id.clone(), at_unix_ms)?;
        next.validate()?;
        self.append_journal_entry(RecordJournalEvent::MarkedCreated {
            record_id: record_id.clone(),
            knowledge_id,
            agent_id,
            at_unix_ms,
        })?;
        records.insert(record_id.clone(), next);
        Ok(())
    }

    pub fn apply_failed(
        &self,
        record_id: &RecordId,
        failure: RecordFailure,
        knowledge_id: Option<KnowledgeId>,
    ) -> Result<(), StorageError> {
        let at_unix_ms = now_unix_ms();
        let mut records = self.lock()?;
        let current = records
            .get(record_id)
            .ok_or_else(|| StorageError::NotFound {
                record_id: record_id.as_str().to_string(),
            })?;
        let mut next = current.clone();
        next.mark_failed(failure.clone(), knowledge_id.clone(), at_unix_ms)?;
        next.validate()?;
        self.append_journal_entry(RecordJournalEvent::MarkedFailed {
            record_id: record_id.clone(),
            failure,
            knowledge_id,
            at_unix_ms,
        })?;
        records.insert(record_id.clone(), next);
        Ok(())
    }

    pub fn record(&self, record_id: &RecordId) -> Result<Option<AvatarRecord>, StorageError> {
        Ok(self.lock()?.get(record_id).cloned())
    }

    pub fn record_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.len())
    }

    pub fn record_ids(&self) -> Result<Vec<RecordId>, StorageError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    pub fn status_counts(&self) -> Result<RecordStatusCounts, StorageError> {
        let records = self.lock()?;
        let mut out = RecordStatusCounts::default();
        for record in records.values() {
            match record.status {
                AvatarStatus::Pending => out.pending = out.pending.saturating_add(1),
                AvatarStatus::Created => out.created = out.created.saturating_add(1),
                AvatarStatus::Failed => out.failed = out.failed.saturating_add(1),
            }
        }
        Ok(out)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<RecordId, AvatarRecord>>, StorageError> {
        self.records.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn ensure_persistence_ready(&self) -> Result<(), StorageError> {
        let Some(persistence) = self.persistence.as_ref() else {
            return Ok(());
        };
        let path = &persistence.journal_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StorageError::Journal(format!(
                    "failed to create record store directory '{}': {}",
                    parent.display(),
                    err
                ))
            })?;
        }
        if !path.exists() {
            File::create(path).map_err(|err| {
                StorageError::Journal(format!(
                    "failed to create record journal '{}': {}",
                    path.display(),
                    err
                ))
            })?;
        }
        Ok(())
    }

    fn replay_journal(&self) -> Result<(), StorageError> {
        let Some(persistence) = self.persistence.as_ref() else {
            return Ok(());
        };
        let path = &persistence.journal_path;
        let file = File::open(path).map_err(|err| {
            StorageError::Journal(format!(
                "failed to open record journal '{}': {}",
                path.display(),
                err
            ))
        })?;
        let mut records = self.lock()?;
        let mut replayed = 0usize;
        for (line_no, line_result) in BufReader::new(file).lines().enumerate() {
            let line = line_result.map_err(|err| {
                StorageError::Journal(format!(
                    "failed reading record journal '{}' at line {}: {}",
                    path.display(),
                    line_no + 1,
                    err
                ))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: RecordJournalEntry = serde_json::from_str(&line).map_err(|err| {
                StorageError::Journal(format!(
                    "failed parsing record journal '{}' at line {}: {}",
                    path.display(),
                    line_no + 1,
                    err
                ))
            })?;
            if entry.schema_version != JOURNAL_SCHEMA_VERSION {
                return Err(StorageError::Journal(format!(
                    "unsupported record journal schema_version={} at line {}",
                    entry.schema_version,
                    line_no + 1
                )));
            }
            apply_replayed_event(&mut records, entry.event).map_err(|err| {
                StorageError::Journal(format!("journal replay failed at line {}: {}", line_no + 1, err))
            })?;
            replayed += 1;
        }
        tracing::info!(
            path = %path.display(),
            events = replayed,
            records = records.len(),
            "record journal replayed"
        );
        Ok(())
    }

    fn append_journal_entry(&self, event: RecordJournalEvent) -> Result<(), StorageError> {
        let Some(persistence) = self.persistence.as_ref() else {
            return Ok(());
        };
        let entry = RecordJournalEntry::v1(event);
        let json = serde_json::to_string(&entry).map_err(|err| {
            StorageError::Journal(format!("failed to encode record journal entry: {err}"))
        })?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&persistence.journal_path)
            .map_err(|err| {
                StorageError::Journal(format!(
                    "failed opening record journal '{}' for append: {}",
                    persistence.journal_path.display(),
                    err
                ))
            })?;
        append_journal_line(&mut file, &json).map_err(|err| {
            StorageError::Journal(format!(
                "failed writing record journal '{}': {}",
                persistence.journal_path.display(),
                err
            ))
        })?;
        Ok(())
    }
}

/// Writes one newline-terminated entry. On failure the file is cut back to its
/// previous length so a torn entry never prefixes the next one.
fn append_journal_line(file: &mut File, line: &str) -> std::io::Result<()> {
    let committed_len = file.metadata()?.len();
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    let result = file.write_all(&buf).and_then(|_| file.sync_data());
    if let Err(err) = &result {
        if let Err(trunc_err) = file.set_len(committed_len) {
            tracing::error!(
                error = %err,
                truncate_error = %trunc_err,
                "record journal append failed and torn entry could not be removed"
            );
        }
    }
    result
}

fn apply_replayed_event(
    records: &mut BTreeMap<RecordId, AvatarRecord>,
    event: RecordJournalEvent,
) -> Result<(), StorageError> {
    match event {
        RecordJournalEvent::Created { record } => {
            record.validate()?;
            if records.contains_key(&record.record_id) {
                return Err(StorageError::DuplicateKey {
                    key: record.record_id.as_str().to_string(),
                });
            }
            records.insert(record.record_id.clone(), record);
        }
        RecordJournalEvent::MarkedCreated {
            record_id,
            knowledge_id,
            agent_id,
            at_unix_ms,
        } => {
            let record = records
                .get_mut(&record_id)
                .ok_or_else(|| StorageError::NotFound {
                    record_id: record_id.as_str().to_string(),
                })?;
            record.mark_created(knowledge_id, agent_id, at_unix_ms)?;
        }
        RecordJournalEvent::MarkedFailed {
            record_id,
            failure,
            knowledge_id,
            at_unix_ms,
        } => {
            let record = records
                .get_mut(&record_id)
                .ok_or_else(|| StorageError::NotFound {
                    record_id: record_id.as_str().to_string(),
                })?;
            record.mark_failed(failure, knowledge_id, at_unix_ms)?;
        }
    }
    Ok(())
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatar_kernel_contracts::avatar::ProvisioningStage;
    use serde_json::json;

    fn request() -> AvatarRequest {
        AvatarRequest::from_json(&json!({
            "name": "Ava",
            "avatarImageUrl": "https://x/a.png",
            "coverImageUrl": "https://x/c.png",
            "voiceId": "3f8e5c1a-2b4d-4e6f-8a9b-0c1d2e3f4a5b",
            "knowledge": {"name": "K", "description": "D", "content": "text"},
            "apiKey": "secret"
        }))
        .unwrap()
    }

    fn caller() -> CallerUserId {
        CallerUserId::new("user_1").unwrap()
    }

    fn temp_journal(name: &str) -> PathBuf {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(1);
        std::env::temp_dir()
            .join(format!("avatar_records_{name}_{seed}"))
            .join("records.jsonl")
    }

    #[test]
    fn at_records_01_pending_record_seals_credential() {
        let store = AvatarRecordStore::new_in_memory(CredentialSealer::ephemeral());
        let id = store.insert_pending_record(&request(), &caller()).unwrap();
        let record = store.record(&id).unwrap().expect("record must exist");

        assert_eq!(record.status, AvatarStatus::Pending);
        assert_eq!(record.caller_user_id, caller());
        assert_eq!(record.knowledge.content, "text");
        assert!(record.created_at_unix_ms > 0);
        assert_ne!(record.api_key_sealed.ciphertext_b64, "secret");
        let unsealed = store.sealer().unseal(&record.api_key_sealed).unwrap();
        assert_eq!(unsealed.expose(), "secret");
    }

    #[test]
    fn at_records_02_mark_created_sets_ids_only() {
        let store = AvatarRecordStore::new_in_memory(CredentialSealer::ephemeral());
        let id = store.insert_pending_record(&request(), &caller()).unwrap();
        let before = store.record(&id).unwrap().unwrap();

        store
            .apply_created(
                &id,
                KnowledgeId::new("kn1").unwrap(),
                AgentId::new("ag1").unwrap(),
            )
            .unwrap();
        let after = store.record(&id).unwrap().unwrap();
        assert_eq!(after.status, AvatarStatus::Created);
        assert_eq!(after.knowledge_id, Some(KnowledgeId::new("kn1").unwrap()));
        assert_eq!(after.agent_id, Some(AgentId::new("ag1").unwrap()));
        assert_eq!(after.name, before.name);
        assert_eq!(after.api_key_sealed, before.api_key_sealed);
        assert_eq!(after.created_at_unix_ms, before.created_at_unix_ms);
    }

    #[test]
    fn at_records_03_unknown_record_is_not_found() {
        let store = AvatarRecordStore::new_in_memory(CredentialSealer::ephemeral());
        let err = store
            .apply_created(
                &RecordId::new("missing").unwrap(),
                KnowledgeId::new("kn1").unwrap(),
                AgentId::new("ag1").unwrap(),
            )
            .expect_err("missing record must fail");
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[test]
    fn at_records_04_terminal_record_rejects_second_transition() {
        let store = AvatarRecordStore::new_in_memory(CredentialSealer::ephemeral());
        let id = store.insert_pending_record(&request(), &caller()).unwrap();
        store
            .apply_failed(
                &id,
                RecordFailure::new(ProvisioningStage::Knowledge, "http_status_500"),
                None,
            )
            .unwrap();
        let err = store
            .apply_created(
                &id,
                KnowledgeId::new("kn1").unwrap(),
                AgentId::new("ag1").unwrap(),
            )
            .expect_err("failed record must stay failed");
        assert!(matches!(err, StorageError::ContractViolation(_)));
        assert_eq!(
            store.record(&id).unwrap().unwrap().status,
            AvatarStatus::Failed
        );
    }

    #[test]
    fn at_records_05_status_counts_track_lifecycle() {
        let store = AvatarRecordStore::new_in_memory(CredentialSealer::ephemeral());
        let a = store.insert_pending_record(&request(), &caller()).unwrap();
        let b = store.insert_pending_record(&request(), &caller()).unwrap();
        let _c = store.insert_pending_record(&request(), &caller()).unwrap();
        store
            .apply_created(
                &a,
                KnowledgeId::new("kn1").unwrap(),
                AgentId::new("ag1").unwrap(),
            )
            .unwrap();
        store
            .apply_failed(&b, RecordFailure::new(ProvisioningStage::Agent, "x"), None)
            .unwrap();
        assert_eq!(
            store.status_counts().unwrap(),
            RecordStatusCounts {
                pending: 1,
                created: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn at_records_06_journal_rejects_unknown_schema_version() {
        let path = temp_journal("bad_schema");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "{\"schema_version\":9,\"event\":{\"kind\":\"marked_created\",\"record_id\":\"r\",\"knowledge_id\":\"k\",\"agent_id\":\"a\",\"at_unix_ms\":1}}\n",
        )
        .unwrap();
        let err = AvatarRecordStore::new_with_persistence(CredentialSealer::ephemeral(), path.clone())
            .expect_err("unknown schema must fail");
        assert!(err.to_string().contains("schema_version=9"));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn at_records_07_failed_append_leaves_journal_replayable() {
        let path = temp_journal("torn_append");
        let store =
            AvatarRecordStore::new_with_persistence(CredentialSealer::ephemeral(), path.clone())
                .unwrap();
        let id = store.insert_pending_record(&request(), &caller()).unwrap();
        let before = fs::read(&path).unwrap();
        assert_eq!(before.last(), Some(&b'\n'));

        let mut read_only = File::open(&path).unwrap();
        assert!(append_journal_line(&mut read_only, "{\"torn\":").is_err());
        assert_eq!(fs::read(&path).unwrap(), before);

        store
            .apply_created(
                &id,
                KnowledgeId::new("kn1").unwrap(),
                AgentId::new("ag1").unwrap(),
            )
            .unwrap();
        let after = fs::read_to_string(&path).unwrap();
        assert_eq!(after.lines().count(), 2);
        assert!(after.ends_with('\n'));

        let reopened =
            AvatarRecordStore::new_with_persistence(CredentialSealer::ephemeral(), path.clone())
                .unwrap();
        assert_eq!(reopened.record_ids().unwrap(), vec![id.clone()]);
        assert_eq!(
            reopened.record(&id).unwrap().unwrap().status,
            AvatarStatus::Created
        );
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
