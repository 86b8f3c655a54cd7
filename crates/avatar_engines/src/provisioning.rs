#![forbid(unsafe_code)]

use avatar_kernel_contracts::avatar::{AgentId, ApiCredential, KnowledgeDocument, KnowledgeId};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::http::{body_read_error_kind, build_http_agent, transport_error_kind, HttpTimeouts};

pub const DEFAULT_PROVISIONING_BASE_URL: &str = "https://api.d-id.com";
pub const DEFAULT_PROVISIONING_TIMEOUTS: HttpTimeouts = HttpTimeouts::new(5_000, 30_000);

const KNOWLEDGE_ENDPOINT: &str = "knowledge";
const AGENTS_ENDPOINT: &str = "agents";
const AGENT_PRESENTER_TYPE: &str = "talk";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("{endpoint} returned http status {status}")]
    HttpStatus { endpoint: &'static str, status: u16 },
    #[error("{endpoint} transport failure ({kind})")]
    Transport {
        endpoint: &'static str,
        kind: &'static str,
    },
    #[error("{endpoint} response invalid: {detail}")]
    InvalidResponse {
        endpoint: &'static str,
        detail: &'static str,
    },
}

impl ProvisioningError {
    /// Stable code that is safe to persist on a failed record.
    pub fn reason_code(&self) -> String {
        match self {
            Self::HttpStatus { status, .. } => format!("http_status_{status}"),
            Self::Transport { kind, .. } => format!("transport_{kind}"),
            Self::InvalidResponse { detail, .. } => format!("invalid_response_{detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub source_url: String,
    pub thumbnail_url: String,
    pub knowledge_id: KnowledgeId,
}

/// The two calls against the external avatar API. Neither call retries.
pub trait ProvisioningClient: Send + Sync {
    fn create_knowledge(
        &self,
        credential: &ApiCredential,
        knowledge: &KnowledgeDocument,
    ) -> Result<KnowledgeId, ProvisioningError>;

    fn create_agent(
        &self,
        credential: &ApiCredential,
        agent: &AgentSpec,
    ) -> Result<AgentId, ProvisioningError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProvisioningConfig {
    pub base_url: String,
    pub timeouts: HttpTimeouts,
}

impl Default for HttpProvisioningConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PROVISIONING_BASE_URL.to_string(),
            timeouts: DEFAULT_PROVISIONING_TIMEOUTS,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct KnowledgeCreateBody<'a> {
    name: &'a str,
    description: &'a str,
    content: &'a str,
}

#[derive(Debug, serde::Serialize)]
struct AgentCreateBody<'a> {
    #[serde(rename = "type")]
    presenter_type: &'static str,
    source_url: &'a str,
    thumbnail: &'a str,
    knowledge: KnowledgeRef<'a>,
}

#[derive(Debug, serde::Serialize)]
struct KnowledgeRef<'a> {
    id: &'a str,
}

#[derive(Debug)]
pub struct HttpProvisioningClient {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpProvisioningClient {
    pub fn new(config: HttpProvisioningConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            agent: build_http_agent(config.timeouts),
        }
    }

    fn post_for_id(
        &self,
        endpoint: &'static str,
        credential: &ApiCredential,
        body: impl serde::Serialize,
    ) -> Result<String, ProvisioningError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .set("Authorization", &basic_auth_header(credential))
            .send_json(body)
            .map_err(|err| provisioning_error_from_ureq(endpoint, err))?;
        let status = response.status();
        if !(200..=299).contains(&status) {
            return Err(ProvisioningError::HttpStatus { endpoint, status });
        }
        let payload: Value = response
            .into_json()
            .map_err(|err| match body_read_error_kind(&err) {
                Some(kind) => ProvisioningError::Transport { endpoint, kind },
                None => ProvisioningError::InvalidResponse {
                    endpoint,
                    detail: "json_parse",
                },
            })?;
        extract_resource_id(endpoint, &payload)
    }
}

impl ProvisioningClient for HttpProvisioningClient {
    fn create_knowledge(
        &self,
        credential: &ApiCredential,
        knowledge: &KnowledgeDocument,
    ) -> Result<KnowledgeId, ProvisioningError> {
        let body = KnowledgeCreateBody {
            name: &knowledge.name,
            description: &knowledge.description,
            content: &knowledge.content,
        };
        let id = self.post_for_id(KNOWLEDGE_ENDPOINT, credential, body)?;
        tracing::debug!(knowledge_id = %id, "knowledge created");
        KnowledgeId::new(id).map_err(|_| ProvisioningError::InvalidResponse {
            endpoint: KNOWLEDGE_ENDPOINT,
            detail: "id_out_of_bounds",
        })
    }

    fn create_agent(
        &self,
        credential: &ApiCredential,
        agent: &AgentSpec,
    ) -> Result<AgentId, ProvisioningError> {
        let body = AgentCreateBody {
            presenter_type: AGENT_PRESENTER_TYPE,
            source_url: &agent.source_url,
            thumbnail: &agent.thumbnail_url,
            knowledge: KnowledgeRef {
                id: agent.knowledge_id.as_str(),
            },
        };
        let id = self.post_for_id(AGENTS_ENDPOINT, credential, body)?;
        tracing::debug!(agent_id = %id, "agent created");
        AgentId::new(id).map_err(|_| ProvisioningError::InvalidResponse {
            endpoint: AGENTS_ENDPOINT,
            detail: "id_out_of_bounds",
        })
    }
}

pub fn basic_auth_header(credential: &ApiCredential) -> String {
    format!("Basic {}", BASE64.encode(credential.expose()))
}

fn extract_resource_id(endpoint: &'static str, payload: &Value) -> Result<String, ProvisioningError> {
    match payload.get("id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
        _ => Err(ProvisioningError::InvalidResponse {
            endpoint,
            detail: "missing_id",
        }),
    }
}

fn provisioning_error_from_ureq(endpoint: &'static str, err: ureq::Error) -> ProvisioningError {
    match err {
        ureq::Error::Status(status, _) => ProvisioningError::HttpStatus { endpoint, status },
        ureq::Error::Transport(transport) => ProvisioningError::Transport {
            endpoint,
            kind: transport_error_kind(&transport),
        },
    }
}
