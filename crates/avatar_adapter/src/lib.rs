#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;

use avatar_engines::identity::{
    HttpIdentityConfig, HttpIdentityVerifier, IdentityVerifier, StaticTokenVerifier,
    DEFAULT_IDENTITY_ENDPOINT, DEFAULT_IDENTITY_TIMEOUTS,
};
use avatar_engines::provisioning::{
    HttpProvisioningClient, HttpProvisioningConfig, DEFAULT_PROVISIONING_BASE_URL,
    DEFAULT_PROVISIONING_TIMEOUTS,
};
use avatar_engines::http::HttpTimeouts;
use avatar_kernel_contracts::FieldViolations;
use avatar_os::context::AppContext;
use avatar_os::lookup::{fetch_record, status_counts};
use avatar_os::pipeline::{PipelineError, ProvisioningPipeline};
use avatar_storage::records::{AvatarRecordStore, RecordStatusCounts, StorageError};
use avatar_storage::sealer::{CredentialSealer, SealError};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::task::JoinError;
use tower_http::trace::TraceLayer;

pub const ENV_HTTP_BIND: &str = "AVATAR_HTTP_BIND";
pub const ENV_STORE_PATH: &str = "AVATAR_STORE_PATH";
pub const ENV_SEAL_KEY_PATH: &str = "AVATAR_SEAL_KEY_PATH";
pub const ENV_PROVISIONING_BASE_URL: &str = "AVATAR_PROVISIONING_BASE_URL";
pub const ENV_PROVISIONING_CONNECT_TIMEOUT_MS: &str = "AVATAR_PROVISIONING_CONNECT_TIMEOUT_MS";
pub const ENV_PROVISIONING_REQUEST_TIMEOUT_MS: &str = "AVATAR_PROVISIONING_REQUEST_TIMEOUT_MS";
pub const ENV_IDENTITY_ENDPOINT: &str = "AVATAR_IDENTITY_ENDPOINT";
pub const ENV_IDENTITY_API_KEY: &str = "AVATAR_IDENTITY_API_KEY";
pub const ENV_IDENTITY_CONNECT_TIMEOUT_MS: &str = "AVATAR_IDENTITY_CONNECT_TIMEOUT_MS";
pub const ENV_IDENTITY_REQUEST_TIMEOUT_MS: &str = "AVATAR_IDENTITY_REQUEST_TIMEOUT_MS";
pub const ENV_IDENTITY_STATIC_TOKENS: &str = "AVATAR_IDENTITY_STATIC_TOKENS";

const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
const DEFAULT_STORE_PATH: &str = ".avatar/avatar_records.jsonl";
const CONNECT_TIMEOUT_RANGE_MS: RangeInclusive<u64> = 100..=60_000;
const REQUEST_TIMEOUT_RANGE_MS: RangeInclusive<u64> = 100..=120_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is invalid: {reason}")]
    InvalidValue { var: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("seal key: {0}")]
    Seal(#[from] SealError),
    #[error("record store: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub enum IdentityConfig {
    Http(HttpIdentityConfig),
    /// Fixed token table. Local development only.
    Static(StaticTokenVerifier),
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub store_path: PathBuf,
    pub seal_key_path: PathBuf,
    pub provisioning: HttpProvisioningConfig,
    pub identity: IdentityConfig,
}

impl ServiceConfig {
    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let bind_raw = non_empty_var(&mut env_getter, ENV_HTTP_BIND)
            .unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let bind = bind_raw
            .parse::<SocketAddr>()
            .map_err(|err| invalid(ENV_HTTP_BIND, format!("'{bind_raw}': {err}")))?;

        let store_path = non_empty_var(&mut env_getter, ENV_STORE_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));
        let seal_key_path = non_empty_var(&mut env_getter, ENV_SEAL_KEY_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_seal_key_path(&store_path));

        let provisioning = HttpProvisioningConfig {
            base_url: http_url_var(
                &mut env_getter,
                ENV_PROVISIONING_BASE_URL,
                DEFAULT_PROVISIONING_BASE_URL,
            )?,
            timeouts: HttpTimeouts::new(
                timeout_ms_var(
                    &mut env_getter,
                    ENV_PROVISIONING_CONNECT_TIMEOUT_MS,
                    DEFAULT_PROVISIONING_TIMEOUTS.connect_timeout_ms,
                    CONNECT_TIMEOUT_RANGE_MS,
                )?,
                timeout_ms_var(
                    &mut env_getter,
                    ENV_PROVISIONING_REQUEST_TIMEOUT_MS,
                    DEFAULT_PROVISIONING_TIMEOUTS.request_timeout_ms,
                    REQUEST_TIMEOUT_RANGE_MS,
                )?,
            ),
        };

        let identity = match non_empty_var(&mut env_getter, ENV_IDENTITY_STATIC_TOKENS) {
            Some(table) => IdentityConfig::Static(
                StaticTokenVerifier::parse(&table)
                    .map_err(|reason| invalid(ENV_IDENTITY_STATIC_TOKENS, reason))?,
            ),
            None => IdentityConfig::Http(HttpIdentityConfig {
                endpoint: http_url_var(
                    &mut env_getter,
                    ENV_IDENTITY_ENDPOINT,
                    DEFAULT_IDENTITY_ENDPOINT,
                )?,
                api_key: non_empty_var(&mut env_getter, ENV_IDENTITY_API_KEY),
                timeouts: HttpTimeouts::new(
                    timeout_ms_var(
                        &mut env_getter,
                        ENV_IDENTITY_CONNECT_TIMEOUT_MS,
                        DEFAULT_IDENTITY_TIMEOUTS.connect_timeout_ms,
                        CONNECT_TIMEOUT_RANGE_MS,
                    )?,
                    timeout_ms_var(
                        &mut env_getter,
                        ENV_IDENTITY_REQUEST_TIMEOUT_MS,
                        DEFAULT_IDENTITY_TIMEOUTS.request_timeout_ms,
                        REQUEST_TIMEOUT_RANGE_MS,
                    )?,
                ),
            }),
        };

        Ok(Self {
            bind,
            store_path,
            seal_key_path,
            provisioning,
            identity,
        })
    }
}

fn non_empty_var<F>(env_getter: &mut F, var: &str) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    env_getter(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn timeout_ms_var<F>(
    env_getter: &mut F,
    var: &'static str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(raw) = non_empty_var(env_getter, var) else {
        return Ok(default);
    };
    let value = raw
        .parse::<u64>()
        .map_err(|_| invalid(var, format!("'{raw}' is not a number of milliseconds")))?;
    if !range.contains(&value) {
        return Err(invalid(
            var,
            format!("{value} must be within {}..={}", range.start(), range.end()),
        ));
    }
    Ok(value)
}

fn http_url_var<F>(env_getter: &mut F, var: &'static str, default: &str) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let url = non_empty_var(env_getter, var).unwrap_or_else(|| default.to_string());
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(invalid(var, format!("'{url}' must be an http(s) URL")));
    }
    Ok(url)
}

fn invalid(var: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        reason: reason.into(),
    }
}

fn default_seal_key_path(store_path: &std::path::Path) -> PathBuf {
    let mut raw = store_path.as_os_str().to_os_string();
    raw.push(".seal.key");
    PathBuf::from(raw)
}

/// Opens the journal-backed store and wires the HTTP clients.
pub fn build_context(config: &ServiceConfig) -> Result<AppContext, StartupError> {
    let sealer = CredentialSealer::load_or_create(&config.seal_key_path)?;
    let store = AvatarRecordStore::new_with_persistence(sealer, config.store_path.clone())?;
    let provisioning = HttpProvisioningClient::new(config.provisioning.clone());
    let identity: Arc<dyn IdentityVerifier> = match &config.identity {
        IdentityConfig::Http(http) => Arc::new(HttpIdentityVerifier::new(http.clone())),
        IdentityConfig::Static(table) => {
            tracing::warn!(
                tokens = table.len(),
                "using static identity token table; not for production"
            );
            Arc::new(table.clone())
        }
    };
    Ok(AppContext::new(
        Arc::new(store),
        Arc::new(provisioning),
        identity,
    ))
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/avatars", post(create_avatar))
        .route("/v1/avatars/:record_id", get(get_avatar))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarCreatedResponse {
    pub record_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<FieldViolations>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub records: RecordStatusCounts,
}

/// Maps a pipeline failure to a status and a body that carries no internals.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl ApiError {
    pub fn http_status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::Authentication(_) => StatusCode::UNAUTHORIZED,
            PipelineError::Validation(_) | PipelineError::Provisioning(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::NotFound => StatusCode::NOT_FOUND,
            PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_body(&self) -> ErrorResponse {
        let (error, details) = match &self.0 {
            PipelineError::Authentication(_) => ("Unauthorized", None),
            PipelineError::Validation(violations) => {
                ("Validation error", Some(violations.clone()))
            }
            PipelineError::Provisioning(_) => ("Failed to provision avatar", None),
            PipelineError::NotFound => ("Not found", None),
            PipelineError::Internal(_) => ("Internal server error", None),
        };
        ErrorResponse {
            error: error.to_string(),
            details,
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.http_status(), Json(self.error_body())).into_response()
    }
}

fn authorization_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn joined<T>(result: Result<Result<T, PipelineError>, JoinError>) -> Result<T, PipelineError> {
    result.unwrap_or_else(|err| Err(PipelineError::Internal(format!("blocking task failed: {err}"))))
}

async fn create_avatar(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AvatarCreatedResponse>), ApiError> {
    let authorization = authorization_header(&headers);
    // Unparsable bodies still go through authentication first, then fail
    // validation as a non-object body.
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let result = tokio::task::spawn_blocking(move || {
        ProvisioningPipeline::new(&ctx)
            .run(authorization.as_deref(), &body)
            .result
    })
    .await;
    let outcome = joined(result)?;
    Ok((
        StatusCode::CREATED,
        Json(AvatarCreatedResponse {
            record_id: outcome.record_id.to_string(),
        }),
    ))
}

async fn get_avatar(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(record_id): Path<String>,
) -> Result<Response, ApiError> {
    let authorization = authorization_header(&headers);
    let result = tokio::task::spawn_blocking(move || {
        fetch_record(&ctx, authorization.as_deref(), &record_id)
    })
    .await;
    let view = joined(result)?;
    Ok((StatusCode::OK, Json(view)).into_response())
}

async fn healthz(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthResponse>) {
    match status_counts(&ctx) {
        Ok(records) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
                records,
            }),
        ),
        Err(err) => {
            tracing::error!(error = %err, "health check could not read record counts");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HealthResponse {
                    status: "error".to_string(),
                    records: RecordStatusCounts::default(),
                }),
            )
        }
    }
}
