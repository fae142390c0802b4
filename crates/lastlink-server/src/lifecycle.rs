//! Secret lifecycle: create, read (consume one view), list, delete, sweep.
//!
//! Every negative read outcome collapses into [`EngineError::Unavailable`]
//! so a caller probing ids learns nothing about why a secret is gone.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::store::{NewSecret, SecretMeta, Store, ViewOutcome};

pub const DEFAULT_EXPIRATION_HOURS: i64 = 24;
pub const MAX_EXPIRATION_HOURS: i64 = 720;
pub const DEFAULT_MAX_VIEWS: i64 = 1;
pub const MAX_MAX_VIEWS: i64 = 100;
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576;
pub const MAX_TITLE_CHARS: usize = 200;

const SECS_PER_HOUR: i64 = 3_600;

/// Hours until expiry: default 24, clamped to `[1, 720]`.
pub fn clamp_expiration_hours(hours: Option<i64>) -> i64 {
    hours
        .unwrap_or(DEFAULT_EXPIRATION_HOURS)
        .clamp(1, MAX_EXPIRATION_HOURS)
}

/// View budget: default 1, clamped to `[1, 100]`.
pub fn clamp_max_views(views: Option<i64>) -> u32 {
    views.unwrap_or(DEFAULT_MAX_VIEWS).clamp(1, MAX_MAX_VIEWS) as u32
}

/// Read an integer out of loosely typed JSON: numbers (fractions truncated)
/// and numeric strings. Anything else counts as absent.
pub fn lenient_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        _ => None,
    }
}

/// Generate a 128-bit capability id as 32 lowercase hex chars.
pub fn generate_secret_id() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Request to create a secret. Bounds are applied by [`SecretEngine::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateSecret {
    pub owner_id: Option<String>,
    pub title: Option<String>,
    pub payload: Vec<u8>,
    pub expiration_hours: Option<i64>,
    pub max_views: Option<i64>,
}

/// The payload handed back by a successful read.
#[derive(Debug, Clone, PartialEq)]
pub struct RevealedSecret {
    pub payload: Vec<u8>,
    pub expires_at: i64,
    pub remaining_views: u32,
}

#[derive(Clone)]
pub struct SecretEngine {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl SecretEngine {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persist a new secret and return only its id.
    pub fn create(&self, req: CreateSecret) -> Result<String, EngineError> {
        if req.payload.is_empty() {
            return Err(EngineError::validation("payload is required"));
        }
        if req.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(EngineError::validation("payload exceeds 1 MiB limit"));
        }
        let title = req
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        if title.is_some_and(|t| t.chars().count() > MAX_TITLE_CHARS) {
            return Err(EngineError::validation(format!(
                "title must be at most {MAX_TITLE_CHARS} characters"
            )));
        }

        let now = self.clock.now();
        let hours = clamp_expiration_hours(req.expiration_hours);
        let max_views = clamp_max_views(req.max_views);
        let id = generate_secret_id();

        self.store.insert_secret(
            &id,
            &NewSecret {
                owner_id: req.owner_id.as_deref(),
                title,
                payload: &req.payload,
                created_at: now,
                expires_at: now + hours * SECS_PER_HOUR,
                max_views,
            },
        )?;

        info!(
            id = %id,
            anonymous = req.owner_id.is_none(),
            expiration_hours = hours,
            max_views,
            "secret created"
        );
        Ok(id)
    }

    /// Consume one view. The read that spends the last view also burns the
    /// record; expired or exhausted records found here are removed before
    /// reporting unavailable. Store failures are logged and reported the
    /// same way, so a damaged record looks like an absent one.
    pub fn read(&self, id: &str) -> Result<RevealedSecret, EngineError> {
        let now = self.clock.now();
        let outcome = match self.store.consume_view(id, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(id = %id, error = %e, "secret read failed");
                return Err(EngineError::Unavailable);
            }
        };
        match outcome {
            ViewOutcome::Missing => Err(EngineError::Unavailable),
            ViewOutcome::Expired => {
                self.burn(id, "expired");
                Err(EngineError::Unavailable)
            }
            ViewOutcome::Exhausted => {
                self.burn(id, "exhausted");
                Err(EngineError::Unavailable)
            }
            ViewOutcome::Consumed(view) => {
                if view.is_last() {
                    self.burn(id, "final view");
                }
                Ok(RevealedSecret {
                    remaining_views: view.max_views.saturating_sub(view.view_count),
                    expires_at: view.expires_at,
                    payload: view.payload,
                })
            }
        }
    }

    /// Owner's still-readable secrets, without payloads.
    pub fn list_for_owner(&self, owner_id: &str) -> Result<Vec<SecretMeta>, EngineError> {
        Ok(self
            .store
            .list_secrets_for_owner(owner_id, self.clock.now())?)
    }

    /// Delete a secret on behalf of its owner. Anonymous secrets have no owner
    /// and cannot be deleted here.
    pub fn delete_owned(&self, id: &str, caller_id: &str) -> Result<(), EngineError> {
        let record = self.store.get_secret(id)?.ok_or(EngineError::NotFound)?;
        if record.owner_id.as_deref() != Some(caller_id) {
            return Err(EngineError::Forbidden);
        }
        if !self.store.delete_secret(id)? {
            return Err(EngineError::NotFound);
        }
        info!(id = %id, "secret deleted by owner");
        Ok(())
    }

    /// Purge expired and exhausted secrets. Safe to run concurrently with reads.
    pub fn sweep_expired(&self) -> Result<usize, EngineError> {
        Ok(self.store.prune_secrets(self.clock.now())?)
    }

    /// Best-effort delete. Failure is logged and left for the sweep.
    fn burn(&self, id: &str, reason: &str) {
        match self.store.delete_secret(id) {
            Ok(_) => debug!(id = %id, reason, "burned secret"),
            Err(e) => warn!(id = %id, reason, error = %e, "burn failed; sweep will retry"),
        }
    }
}
