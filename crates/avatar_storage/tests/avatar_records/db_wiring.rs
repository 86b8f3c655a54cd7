#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use avatar_kernel_contracts::avatar::{
    AgentId, AvatarRequest, AvatarStatus, CallerUserId, KnowledgeId, ProvisioningStage,
    RecordFailure,
};
use avatar_storage::records::{AvatarRecordStore, StorageError};
use avatar_storage::repo::AvatarRecordRepo;
use avatar_storage::sealer::CredentialSealer;

const SENTINEL_KEY: &str = "DBW_API_KEY_SENTINEL_991";

fn request(name: &str) -> AvatarRequest {
    AvatarRequest::from_json(&serde_json::json!({
        "name": name,
        "avatarImageUrl": "https://x/a.png",
        "coverImageUrl": "",
        "voiceId": "3f8e5c1a-2b4d-4e6f-8a9b-0c1d2e3f4a5b",
        "knowledge": {"name": "K", "description": "D", "content": "text"},
        "apiKey": SENTINEL_KEY
    }))
    .unwrap()
}

fn caller() -> CallerUserId {
    CallerUserId::new("dbw_user_1").unwrap()
}

fn temp_dir(name: &str) -> PathBuf {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    std::env::temp_dir().join(format!("avatar_dbw_{name}_{seed}"))
}

fn journal_lines(path: &PathBuf) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

#[test]
fn at_dbw_avatar_01_journal_persists_and_replays_lifecycle() {
    let dir = temp_dir("replay");
    let journal = dir.join("records.jsonl");
    let sealer = CredentialSealer::load_or_create(&dir.join("records.seal.key")).unwrap();

    let (created_id, failed_id, pending_id) = {
        let store = AvatarRecordStore::new_with_persistence(sealer.clone(), journal.clone())
            .expect("store with persistence must construct");
        let a = store.create_pending(&request("A"), &caller()).unwrap();
        let b = store.create_pending(&request("B"), &caller()).unwrap();
        let c = store.create_pending(&request("C"), &caller()).unwrap();
        store
            .mark_created(
                &a,
                KnowledgeId::new("kn1").unwrap(),
                AgentId::new("ag1").unwrap(),
            )
            .unwrap();
        store
            .mark_failed(
                &b,
                RecordFailure::new(ProvisioningStage::Agent, "http_status_502"),
                Some(KnowledgeId::new("kn2").unwrap()),
            )
            .unwrap();
        (a, b, c)
    };
    assert_eq!(journal_lines(&journal).len(), 5);

    let reopened = AvatarRecordStore::new_with_persistence(
        CredentialSealer::load_or_create(&dir.join("records.seal.key")).unwrap(),
        journal.clone(),
    )
    .expect("second store should replay prior journal");

    let created = reopened.get(&created_id).unwrap().unwrap();
    assert_eq!(created.status, AvatarStatus::Created);
    assert_eq!(created.agent_id, Some(AgentId::new("ag1").unwrap()));

    let failed = reopened.get(&failed_id).unwrap().unwrap();
    assert_eq!(failed.status, AvatarStatus::Failed);
    assert_eq!(failed.knowledge_id, Some(KnowledgeId::new("kn2").unwrap()));
    assert_eq!(failed.failure.as_ref().unwrap().stage, ProvisioningStage::Agent);

    let pending = reopened.get(&pending_id).unwrap().unwrap();
    assert_eq!(pending.status, AvatarStatus::Pending);

    let unsealed = reopened.sealer().unseal(&created.api_key_sealed).unwrap();
    assert_eq!(unsealed.expose(), SENTINEL_KEY);

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn at_dbw_avatar_02_plaintext_api_key_never_reaches_disk() {
    let dir = temp_dir("plaintext");
    let journal = dir.join("records.jsonl");
    let store =
        AvatarRecordStore::new_with_persistence(CredentialSealer::ephemeral(), journal.clone())
            .unwrap();
    store.create_pending(&request("Ava"), &caller()).unwrap();

    let raw = fs::read_to_string(&journal).unwrap();
    assert!(raw.contains("\"apiKeySealed\""));
    assert!(raw.contains("\"apiKeyFingerprint\""));
    assert!(!raw.contains(SENTINEL_KEY));

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn at_dbw_avatar_03_corrupt_journal_line_fails_construction() {
    let dir = temp_dir("corrupt");
    let journal = dir.join("records.jsonl");
    fs::create_dir_all(&dir).unwrap();
    fs::write(&journal, "{not json}\n").unwrap();

    let err = AvatarRecordStore::new_with_persistence(CredentialSealer::ephemeral(), journal)
        .expect_err("corrupt journal must fail");
    match err {
        StorageError::Journal(msg) => assert!(msg.contains("line 1")),
        other => panic!("unexpected error: {other:?}"),
    }

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn at_dbw_avatar_04_repo_is_usable_as_shared_trait_object() {
    let repo: Arc<dyn AvatarRecordRepo> = Arc::new(AvatarRecordStore::new_in_memory(
        CredentialSealer::ephemeral(),
    ));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let repo = Arc::clone(&repo);
            std::thread::spawn(move || {
                repo.create_pending(&request(&format!("avatar_{i}")), &caller())
                    .unwrap()
            })
        })
        .collect();
    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(repo.status_counts().unwrap().pending, 8);
    for id in ids {
        assert_eq!(repo.get(&id).unwrap().unwrap().status, AvatarStatus::Pending);
    }
}
