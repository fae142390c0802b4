use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::{
    auth::{Caller, MaybeCaller},
    dms,
    error::EngineError,
    lifecycle::{lenient_int, CreateSecret},
    store::{
        api_keys::{self, ApiKeyRecord},
        SwitchConfig, SwitchStatus, SwitchUpdate,
    },
    AppState,
};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Secrets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSecretRequest {
    /// Must be a JSON string; null, missing or any other type is rejected.
    pub payload: Option<Value>,
    pub title: Option<String>,
    /// Number or numeric string; anything else means "use the default".
    pub expiration_hours: Option<Value>,
    pub max_views: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateSecretResponse {
    pub id: String,
}

pub async fn create_secret(
    State(state): State<AppState>,
    MaybeCaller(caller): MaybeCaller,
    Json(body): Json<CreateSecretRequest>,
) -> Response {
    let payload = match body.payload {
        Some(Value::String(s)) => s.into_bytes(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return EngineError::validation("payload must be a string").into_response(),
    };
    let req = CreateSecret {
        owner_id: caller.map(|c| c.user_id),
        title: body.title,
        payload,
        expiration_hours: body.expiration_hours.as_ref().and_then(lenient_int),
        max_views: body.max_views.as_ref().and_then(lenient_int),
    };
    match state.secrets.create(req) {
        Ok(id) => (StatusCode::CREATED, Json(CreateSecretResponse { id })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct ReadSecretResponse {
    pub payload: String,
    pub expires_at: i64,
    pub remaining_views: u32,
}

pub async fn read_secret(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let revealed = match state.secrets.read(&id) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    // Payloads go in as JSON strings, so they come back out as UTF-8.
    let payload = match String::from_utf8(revealed.payload) {
        Ok(s) => s,
        Err(e) => {
            error!(id = %id, error = %e, "stored payload is not utf-8");
            return EngineError::Unavailable.into_response();
        }
    };
    Json(ReadSecretResponse {
        payload,
        expires_at: revealed.expires_at,
        remaining_views: revealed.remaining_views,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub owner: Option<String>,
}

pub async fn list_secrets(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<ListQuery>,
) -> Response {
    if params.owner.as_deref().is_some_and(|o| o != "me") {
        return EngineError::validation("only owner=me is supported").into_response();
    }
    match state.secrets.list_for_owner(&caller.user_id) {
        Ok(secrets) => Json(json!({ "secrets": secrets })).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Response {
    match state.secrets.delete_owned(&id, &caller.user_id) {
        Ok(()) => Json(json!({"deleted": true})).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Dead man's switch ─────────────────────────────────────────────────────────

/// Wire shape of a switch configuration.
#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub switch_enabled: bool,
    pub recipient_email: Option<String>,
    pub check_in_interval: i64,
    pub note: String,
    pub last_check_in: Option<i64>,
    pub status: SwitchStatus,
    pub triggered_at: Option<i64>,
}

impl From<SwitchConfig> for ConfigView {
    fn from(cfg: SwitchConfig) -> Self {
        Self {
            switch_enabled: cfg.switch_enabled,
            recipient_email: cfg.recipient_email,
            check_in_interval: cfg.check_in_interval_days,
            note: cfg.note,
            last_check_in: cfg.last_check_in,
            status: cfg.status,
            triggered_at: cfg.triggered_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfigRequest {
    pub switch_enabled: Option<bool>,
    pub recipient_email: Option<String>,
    /// Days. Number or numeric string.
    pub check_in_interval: Option<Value>,
    pub note: Option<String>,
}

pub async fn get_config(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Response {
    match state.switches.get_config(&caller.user_id) {
        Ok(cfg) => Json(json!({ "config": ConfigView::from(cfg) })).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn update_config(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<UpdateConfigRequest>,
) -> Response {
    let check_in_interval_days = match body.check_in_interval {
        None | Some(Value::Null) => None,
        Some(ref v) => match lenient_int(v) {
            Some(days) => Some(days),
            None => {
                return EngineError::validation("check_in_interval must be a number of days")
                    .into_response()
            }
        },
    };
    let update = SwitchUpdate {
        switch_enabled: body.switch_enabled,
        recipient_email: body.recipient_email,
        check_in_interval_days,
        note: body.note,
    };
    if let Err(e) = dms::validate_update(&update) {
        return e.into_response();
    }

    match state.switches.update_config(&caller.user_id, &update) {
        Ok(cfg) => Json(json!({ "config": ConfigView::from(cfg) })).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn check_in(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Response {
    match state.switches.record_check_in(&caller.user_id) {
        Ok(cfg) => Json(json!({ "last_check_in": cfg.last_check_in })).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Maintenance ───────────────────────────────────────────────────────────────

pub async fn run_sweep(State(state): State<AppState>) -> Response {
    match state.maintenance.run().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── API Keys ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default)]
    pub label: String,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Response {
    // A key must not be able to mint further keys.
    if caller.automated {
        return EngineError::Forbidden.into_response();
    }
    let label = body.label.trim();
    if label.chars().count() > 100 {
        return EngineError::validation("label must be at most 100 characters").into_response();
    }

    let raw_key = api_keys::generate_api_key();
    let record = ApiKeyRecord {
        id: api_keys::generate_key_id(),
        key_hash: api_keys::hash_key(&raw_key),
        user_id: caller.user_id,
        label: label.to_owned(),
        created_at: state.clock.now(),
        request_count: 0,
        last_used_at: None,
    };

    match state.store.put_api_key(&record) {
        Ok(()) => {
            info!(key_id = %record.id, user_id = %record.user_id, "api key issued");
            (
                StatusCode::CREATED,
                Json(json!({
                    "id": record.id,
                    "key": raw_key,
                    "label": record.label,
                })),
            )
                .into_response()
        }
        Err(e) => EngineError::Store(e).into_response(),
    }
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Response {
    match state.store.list_api_keys_for_user(&caller.user_id) {
        Ok(records) => {
            let keys: Vec<_> = records
                .iter()
                .map(|r| {
                    json!({
                        "id": r.id,
                        "label": r.label,
                        "created_at": r.created_at,
                        "request_count": r.request_count,
                        "last_used_at": r.last_used_at,
                    })
                })
                .collect();
            Json(json!({"keys": keys})).into_response()
        }
        Err(e) => EngineError::Store(e).into_response(),
    }
}

pub async fn delete_api_key(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Response {
    match state.store.delete_api_key(&id, &caller.user_id) {
        Ok(true) => {
            info!(key_id = %id, "api key revoked");
            Json(json!({"deleted": true})).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "api key not found"})),
        )
            .into_response(),
        Err(e) => EngineError::Store(e).into_response(),
    }
}
