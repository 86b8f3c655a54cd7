#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use avatar_kernel_contracts::avatar::CallerUserId;
use serde_json::{json, Value};

use crate::http::{body_read_error_kind, build_http_agent, transport_error_kind, HttpTimeouts};

pub const DEFAULT_IDENTITY_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:lookup";
pub const DEFAULT_IDENTITY_TIMEOUTS: HttpTimeouts = HttpTimeouts::new(3_000, 10_000);

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingHeader,
    #[error("authorization scheme must be Bearer")]
    InvalidScheme,
    #[error("bearer token is empty")]
    EmptyToken,
    #[error("identity token rejected ({0})")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: CallerUserId,
}

/// Exchanges a bearer token for the caller's subject id.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError>;
}

/// Extracts the token from an `Authorization` header value.
///
/// The prefix match is exact and case-sensitive: `bearer abc` is rejected.
pub fn bearer_token_from_header(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::MissingHeader)?;
    let token = header
        .strip_prefix(BEARER_PREFIX)
        .ok_or(AuthError::InvalidScheme)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    Ok(token)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpIdentityConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeouts: HttpTimeouts,
}

impl Default for HttpIdentityConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_IDENTITY_ENDPOINT.to_string(),
            api_key: None,
            timeouts: DEFAULT_IDENTITY_TIMEOUTS,
        }
    }
}

/// Verifies ID tokens with an account-lookup call: `{"idToken"}` in,
/// `users[0].localId` out.
#[derive(Debug)]
pub struct HttpIdentityVerifier {
    endpoint: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl HttpIdentityVerifier {
    pub fn new(config: HttpIdentityConfig) -> Self {
        Self {
            endpoint: config.endpoint,
            api_key: config.api_key,
            agent: build_http_agent(config.timeouts),
        }
    }
}

impl IdentityVerifier for HttpIdentityVerifier {
    fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        let mut req = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json");
        if let Some(key) = self.api_key.as_deref() {
            req = req.query("key", key);
        }
        let response = match req.send_json(json!({ "idToken": token })) {
            Ok(resp) => resp,
            Err(ureq::Error::Status(status, _)) => {
                return Err(AuthError::Rejected(format!("http_status_{status}")));
            }
            Err(ureq::Error::Transport(transport)) => {
                let kind = transport_error_kind(&transport);
                tracing::warn!(kind, "identity lookup transport failure");
                return Err(AuthError::Rejected(format!("transport_{kind}")));
            }
        };
        let payload: Value = response.into_json().map_err(|err| {
            let reason = match body_read_error_kind(&err) {
                Some(kind) => format!("transport_{kind}"),
                None => "json_parse".to_string(),
            };
            AuthError::Rejected(reason)
        })?;
        subject_from_lookup(&payload)
    }
}

fn subject_from_lookup(payload: &Value) -> Result<CallerIdentity, AuthError> {
    let subject = payload
        .get("users")
        .and_then(Value::as_array)
        .and_then(|users| users.first())
        .and_then(|user| user.get("localId"))
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::Rejected("missing_subject".to_string()))?;
    let user_id =
        CallerUserId::new(subject).map_err(|_| AuthError::Rejected("invalid_subject".to_string()))?;
    Ok(CallerIdentity { user_id })
}

/// Fixed token table for local development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: BTreeMap<String, CallerUserId>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: CallerUserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }

    /// Parses `token=subject,token2=subject2`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut out = Self::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (token, subject) = pair
                .split_once('=')
                .ok_or_else(|| format!("static token entry '{pair}' must be token=subject"))?;
            let token = token.trim();
            if token.is_empty() {
                return Err("static token entry has an empty token".to_string());
            }
            let user_id = CallerUserId::new(subject.trim())
                .map_err(|err| format!("static token subject invalid: {err}"))?;
            out.tokens.insert(token.to_string(), user_id);
        }
        if out.tokens.is_empty() {
            return Err("static token table is empty".to_string());
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        self.tokens
            .get(token)
            .map(|user_id| CallerIdentity {
                user_id: user_id.clone(),
            })
            .ok_or_else(|| AuthError::Rejected("unknown_token".to_string()))
    }
}
