#![forbid(unsafe_code)]

use serde_json::{Map, Value};

use crate::{ContractViolation, FieldViolations, SchemaVersion, Validate};

pub const AVATAR_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

const ID_MAX_LEN: usize = 128;
const FAILURE_REASON_MAX_LEN: usize = 256;

macro_rules! string_id {
    ($name:ident, $field:literal) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
                let id = Self(id.into());
                id.validate()?;
                Ok(id)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Validate for $name {
            fn validate(&self) -> Result<(), ContractViolation> {
                if self.0.trim().is_empty() {
                    return Err(ContractViolation::InvalidValue {
                        field: $field,
                        reason: "must not be empty",
                    });
                }
                if self.0.len() > ID_MAX_LEN {
                    return Err(ContractViolation::InvalidValue {
                        field: $field,
                        reason: "must be <= 128 chars",
                    });
                }
                Ok(())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(RecordId, "record_id");
string_id!(CallerUserId, "caller_user_id");
string_id!(KnowledgeId, "knowledge_id");
string_id!(AgentId, "agent_id");

impl RecordId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Caller-supplied key for the avatar API. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential(String);

impl ApiCredential {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let key = key.into();
        if key.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "api_key",
                reason: "must not be empty",
            });
        }
        Ok(Self(key))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiCredential(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KnowledgeDocument {
    pub name: String,
    pub description: String,
    pub content: String,
}

/// A validated provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarRequest {
    pub name: String,
    pub avatar_image_url: String,
    pub cover_image_url: String,
    pub voice_id: String,
    pub knowledge: KnowledgeDocument,
    pub api_key: ApiCredential,
}

impl AvatarRequest {
    /// Checks an untyped body against the camelCase request contract.
    ///
    /// Every field is inspected even after the first failure, so the returned
    /// violations name each offending field exactly once.
    pub fn from_json(body: &Value) -> Result<Self, FieldViolations> {
        let mut violations = FieldViolations::new();
        let Some(obj) = body.as_object() else {
            violations.push("body", "must be a JSON object");
            return Err(violations);
        };

        let name = non_empty_text(obj, "name", "name", "name is required", &mut violations);
        let avatar_image_url = non_empty_text(
            obj,
            "avatarImageUrl",
            "avatarImageUrl",
            "avatarImageUrl is required",
            &mut violations,
        );
        let cover_image_url = text(
            obj,
            "coverImageUrl",
            "coverImageUrl",
            "coverImageUrl is required",
            &mut violations,
        );
        let voice_id = text(obj, "voiceId", "voiceId", "voiceId is required", &mut violations)
            .and_then(|v| {
                if is_hyphenated_uuid(&v) {
                    Some(v)
                } else {
                    violations.push("voiceId", "must be a valid UUID");
                    None
                }
            });
        let knowledge = knowledge_document(obj, &mut violations);
        let api_key = non_empty_text(obj, "apiKey", "apiKey", "apiKey is required", &mut violations)
            .and_then(|k| ApiCredential::new(k).ok());

        let (
            Some(name),
            Some(avatar_image_url),
            Some(cover_image_url),
            Some(voice_id),
            Some(knowledge),
            Some(api_key),
        ) = (
            name,
            avatar_image_url,
            cover_image_url,
            voice_id,
            knowledge,
            api_key,
        )
        else {
            return Err(violations);
        };
        violations.into_result(Self {
            name,
            avatar_image_url,
            cover_image_url,
            voice_id,
            knowledge,
            api_key,
        })
    }
}

fn knowledge_document(
    obj: &Map<String, Value>,
    violations: &mut FieldViolations,
) -> Option<KnowledgeDocument> {
    let knowledge = match obj.get("knowledge") {
        None | Some(Value::Null) => {
            violations.push("knowledge", "knowledge is required");
            return None;
        }
        Some(Value::Object(k)) => k,
        Some(_) => {
            violations.push("knowledge", "must be an object");
            return None;
        }
    };
    let name = non_empty_text(
        knowledge,
        "name",
        "knowledge.name",
        "knowledgeName is required",
        violations,
    );
    let description = non_empty_text(
        knowledge,
        "description",
        "knowledge.description",
        "knowledgeDescription is required",
        violations,
    );
    let content = non_empty_text(
        knowledge,
        "content",
        "knowledge.content",
        "knowledgeContent is required",
        violations,
    );
    Some(KnowledgeDocument {
        name: name?,
        description: description?,
        content: content?,
    })
}

fn text(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    missing: &str,
    violations: &mut FieldViolations,
) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => {
            violations.push(path, missing);
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            violations.push(path, "must be a string");
            None
        }
    }
}

fn non_empty_text(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    missing: &str,
    violations: &mut FieldViolations,
) -> Option<String> {
    let value = text(obj, key, path, missing, violations)?;
    if value.is_empty() {
        violations.push(path, missing);
        return None;
    }
    Some(value)
}

fn is_hyphenated_uuid(raw: &str) -> bool {
    raw.len() == 36 && uuid::Uuid::try_parse(raw).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarStatus {
    Pending,
    Created,
    Failed,
}

impl AvatarStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AvatarStatus::Pending => "pending",
            AvatarStatus::Created => "created",
            AvatarStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStage {
    Knowledge,
    Agent,
}

impl ProvisioningStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisioningStage::Knowledge => "knowledge",
            ProvisioningStage::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecordFailure {
    pub stage: ProvisioningStage,
    pub reason: String,
}

impl RecordFailure {
    pub fn new(stage: ProvisioningStage, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.len() > FAILURE_REASON_MAX_LEN {
            reason.chars().take(FAILURE_REASON_MAX_LEN).collect()
        } else {
            reason
        };
        Self { stage, reason }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedCredential {
    pub nonce_b64: String,
    pub ciphertext_b64: String,
}

/// Durable document tracking one provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarRecord {
    pub schema_version: SchemaVersion,
    pub record_id: RecordId,
    pub caller_user_id: CallerUserId,
    pub name: String,
    pub avatar_image_url: String,
    pub cover_image_url: String,
    pub voice_id: String,
    pub knowledge: KnowledgeDocument,
    pub api_key_sealed: SealedCredential,
    pub api_key_fingerprint: String,
    pub status: AvatarStatus,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_id: Option<KnowledgeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RecordFailure>,
}

impl AvatarRecord {
    pub fn pending_v1(
        record_id: RecordId,
        caller_user_id: CallerUserId,
        request: &AvatarRequest,
        api_key_sealed: SealedCredential,
        api_key_fingerprint: String,
        created_at_unix_ms: u64,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: AVATAR_CONTRACT_VERSION,
            record_id,
            caller_user_id,
            name: request.name.clone(),
            avatar_image_url: request.avatar_image_url.clone(),
            cover_image_url: request.cover_image_url.clone(),
            voice_id: request.voice_id.clone(),
            knowledge: request.knowledge.clone(),
            api_key_sealed,
            api_key_fingerprint,
            status: AvatarStatus::Pending,
            created_at_unix_ms,
            updated_at_unix_ms: created_at_unix_ms,
            knowledge_id: None,
            agent_id: None,
            failure: None,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn mark_created(
        &mut self,
        knowledge_id: KnowledgeId,
        agent_id: AgentId,
        now_unix_ms: u64,
    ) -> Result<(), ContractViolation> {
        self.ensure_pending(AvatarStatus::Created)?;
        self.knowledge_id = Some(knowledge_id);
        self.agent_id = Some(agent_id);
        self.status = AvatarStatus::Created;
        self.updated_at_unix_ms = now_unix_ms.max(self.created_at_unix_ms);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        failure: RecordFailure,
        knowledge_id: Option<KnowledgeId>,
        now_unix_ms: u64,
    ) -> Result<(), ContractViolation> {
        self.ensure_pending(AvatarStatus::Failed)?;
        self.knowledge_id = knowledge_id;
        self.failure = Some(failure);
        self.status = AvatarStatus::Failed;
        self.updated_at_unix_ms = now_unix_ms.max(self.created_at_unix_ms);
        Ok(())
    }

    fn ensure_pending(&self, to: AvatarStatus) -> Result<(), ContractViolation> {
        if self.status != AvatarStatus::Pending {
            return Err(ContractViolation::InvalidTransition {
                field: "avatar_record.status",
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        Ok(())
    }

    /// Caller-facing projection with the sealed credential stripped.
    pub fn view(&self) -> AvatarRecordView {
        AvatarRecordView {
            record_id: self.record_id.clone(),
            name: self.name.clone(),
            avatar_image_url: self.avatar_image_url.clone(),
            cover_image_url: self.cover_image_url.clone(),
            voice_id: self.voice_id.clone(),
            knowledge: self.knowledge.clone(),
            status: self.status,
            created_at_unix_ms: self.created_at_unix_ms,
            updated_at_unix_ms: self.updated_at_unix_ms,
            knowledge_id: self.knowledge_id.clone(),
            agent_id: self.agent_id.clone(),
            failure: self.failure.clone(),
        }
    }
}

impl Validate for AvatarRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != AVATAR_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "avatar_record.schema_version",
                reason: "must match AVATAR_CONTRACT_VERSION",
            });
        }
        self.record_id.validate()?;
        self.caller_user_id.validate()?;
        if self.created_at_unix_ms == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "avatar_record.created_at_unix_ms",
                reason: "must be > 0",
            });
        }
        if self.updated_at_unix_ms < self.created_at_unix_ms {
            return Err(ContractViolation::InvalidValue {
                field: "avatar_record.updated_at_unix_ms",
                reason: "must be >= created_at_unix_ms",
            });
        }
        if self.api_key_sealed.ciphertext_b64.is_empty() || self.api_key_sealed.nonce_b64.is_empty()
        {
            return Err(ContractViolation::InvalidValue {
                field: "avatar_record.api_key_sealed",
                reason: "must not be empty",
            });
        }
        match self.status {
            AvatarStatus::Pending => {
                if self.knowledge_id.is_some() || self.agent_id.is_some() || self.failure.is_some()
                {
                    return Err(ContractViolation::InvalidValue {
                        field: "avatar_record.status",
                        reason: "pending records carry no provisioning results",
                    });
                }
            }
            AvatarStatus::Created => {
                if self.knowledge_id.is_none() || self.agent_id.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "avatar_record.status",
                        reason: "created requires knowledge_id and agent_id",
                    });
                }
                if self.failure.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "avatar_record.failure",
                        reason: "must be absent when created",
                    });
                }
            }
            AvatarStatus::Failed => {
                if self.failure.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "avatar_record.failure",
                        reason: "required when failed",
                    });
                }
                if self.agent_id.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "avatar_record.agent_id",
                        reason: "must be absent when failed",
                    });
                }
            }
        }
        if let Some(k) = &self.knowledge_id {
            k.validate()?;
        }
        if let Some(a) = &self.agent_id {
            a.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarRecordView {
    pub record_id: RecordId,
    pub name: String,
    pub avatar_image_url: String,
    pub cover_image_url: String,
    pub voice_id: String,
    pub knowledge: KnowledgeDocument,
    pub status: AvatarStatus,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_id: Option<KnowledgeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RecordFailure>,
}
