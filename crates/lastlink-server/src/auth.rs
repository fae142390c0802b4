use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use constant_time_eq::constant_time_eq;
use serde_json::json;
use tracing::{debug, warn};

use crate::store::api_keys::{hash_key, API_KEY_PREFIX};
use crate::AppState;

/// The authenticated principal behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    /// True for API-key traffic. Automated calls are not a liveness signal.
    pub automated: bool,
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}

fn bearer(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Resolve `Authorization: Bearer <token>` into a [`Caller`] extension.
///
/// No header passes through anonymously; a header that does not resolve is
/// rejected with 401. API keys (`ll_key_…`) are looked up locally, anything
/// else goes to the identity provider.
pub async fn identify(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let Some(token) = bearer(&request).map(str::to_owned) else {
        if request.headers().contains_key("Authorization") {
            return unauthorized();
        }
        return next.run(request).await;
    };

    let caller = if token.starts_with(API_KEY_PREFIX) {
        match state.store.find_api_key_by_hash(&hash_key(&token)) {
            Ok(Some(record)) => {
                let store = state.store.clone();
                let now = state.clock.now();
                let id = record.id.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = store.record_api_key_use(&id, now) {
                        warn!(key_id = %id, error = %e, "failed to record api key usage");
                    }
                });
                Caller {
                    user_id: record.user_id,
                    automated: true,
                }
            }
            Ok(None) => return unauthorized(),
            Err(e) => {
                warn!(error = %e, "api key lookup failed");
                return unauthorized();
            }
        }
    } else {
        match state.identity.resolve(&token).await {
            Ok(Some(user_id)) => Caller {
                user_id,
                automated: false,
            },
            Ok(None) => return unauthorized(),
            Err(e) => {
                warn!(error = %e, "identity provider error");
                return unauthorized();
            }
        }
    };

    if !caller.automated && state.implicit_check_in {
        let switches = state.switches.clone();
        let user_id = caller.user_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = switches.record_check_in(&user_id) {
                warn!(user_id = %user_id, error = %e, "implicit check-in failed");
            }
        });
    }

    debug!(user_id = %caller.user_id, automated = caller.automated, "caller identified");
    request.extensions_mut().insert(caller);
    next.run(request).await
}

/// Reject requests that [`identify`] left anonymous.
pub async fn require_caller(request: Request, next: Next) -> Response {
    if request.extensions().get::<Caller>().is_none() {
        return unauthorized();
    }
    next.run(request).await
}

/// Extractor for routes where authentication is optional.
#[derive(Debug, Clone)]
pub struct MaybeCaller(pub Option<Caller>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeCaller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<Caller>().cloned()))
    }
}

/// Gate for scheduler-only routes: `Authorization: Bearer $LASTLINK_CRON_SECRET`.
/// The route does not exist when no secret is configured.
pub async fn require_scheduler(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(secret) = state.cron_secret.as_deref() else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response();
    };

    let authorized =
        bearer(&request).is_some_and(|t| constant_time_eq(t.as_bytes(), secret.as_bytes()));
    if !authorized {
        return unauthorized();
    }
    next.run(request).await
}
