#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use avatar_engines::identity::StaticTokenVerifier;
use avatar_engines::provisioning::{AgentSpec, ProvisioningClient, ProvisioningError};
use avatar_kernel_contracts::avatar::{
    AgentId, ApiCredential, CallerUserId, KnowledgeDocument, KnowledgeId,
};
use avatar_storage::records::AvatarRecordStore;
use avatar_storage::sealer::CredentialSealer;
use serde_json::{json, Value};

use crate::context::AppContext;

pub(crate) const VALID_TOKEN: (&str, &str) = ("good-token", "user_good");

#[derive(Debug, Clone)]
pub(crate) enum FakeStep {
    Ok(&'static str),
    Fail(ProvisioningError),
}

#[derive(Debug, Default)]
struct FakeLog {
    calls: Vec<&'static str>,
    credentials: Vec<String>,
    last_agent: Option<AgentSpec>,
}

/// Scripted provisioning client that records every call it receives.
#[derive(Debug)]
pub(crate) struct FakeProvisioning {
    knowledge: FakeStep,
    agent: FakeStep,
    log: Mutex<FakeLog>,
}

impl FakeProvisioning {
    pub(crate) fn new(knowledge: FakeStep, agent: FakeStep) -> Self {
        Self {
            knowledge,
            agent,
            log: Mutex::new(FakeLog::default()),
        }
    }

    pub(crate) fn ok(knowledge_id: &'static str, agent_id: &'static str) -> Self {
        Self::new(FakeStep::Ok(knowledge_id), FakeStep::Ok(agent_id))
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().calls.clone()
    }

    pub(crate) fn credentials_seen(&self) -> Vec<String> {
        self.log.lock().unwrap().credentials.clone()
    }

    pub(crate) fn last_agent_spec(&self) -> Option<AgentSpec> {
        self.log.lock().unwrap().last_agent.clone()
    }
}

impl ProvisioningClient for FakeProvisioning {
    fn create_knowledge(
        &self,
        credential: &ApiCredential,
        _knowledge: &KnowledgeDocument,
    ) -> Result<KnowledgeId, ProvisioningError> {
        let mut log = self.log.lock().unwrap();
        log.calls.push("knowledge");
        log.credentials.push(credential.expose().to_string());
        match &self.knowledge {
            FakeStep::Ok(id) => Ok(KnowledgeId::new(*id).unwrap()),
            FakeStep::Fail(err) => Err(err.clone()),
        }
    }

    fn create_agent(
        &self,
        credential: &ApiCredential,
        agent: &AgentSpec,
    ) -> Result<AgentId, ProvisioningError> {
        let mut log = self.log.lock().unwrap();
        log.calls.push("agent");
        log.credentials.push(credential.expose().to_string());
        log.last_agent = Some(agent.clone());
        match &self.agent {
            FakeStep::Ok(id) => Ok(AgentId::new(*id).unwrap()),
            FakeStep::Fail(err) => Err(err.clone()),
        }
    }
}

pub(crate) fn ava_body() -> Value {
    json!({
        "name": "Ava",
        "avatarImageUrl": "https://x/a.png",
        "coverImageUrl": "https://x/c.png",
        "voiceId": "3f8e5c1a-2b4d-4e6f-8a9b-0c1d2e3f4a5b",
        "knowledge": {"name": "K", "description": "D", "content": "text"},
        "apiKey": "secret"
    })
}

pub(crate) fn context_with(
    provisioning: FakeProvisioning,
) -> (AppContext, Arc<AvatarRecordStore>, Arc<FakeProvisioning>) {
    let store = Arc::new(AvatarRecordStore::new_in_memory(CredentialSealer::ephemeral()));
    let provisioning = Arc::new(provisioning);
    let identity = StaticTokenVerifier::new()
        .with_token(VALID_TOKEN.0, CallerUserId::new(VALID_TOKEN.1).unwrap())
        .with_token("other-token", CallerUserId::new("user_other").unwrap());
    let ctx = AppContext::new(store.clone(), provisioning.clone(), Arc::new(identity));
    (ctx, store, provisioning)
}
