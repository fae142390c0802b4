use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

const SECS_PER_DAY: i64 = 86_400;

/// Interval given to a user the first time they are seen.
pub const DEFAULT_CHECK_IN_INTERVAL_DAYS: i64 = 30;

/// Stored in redb as bincode-encoded bytes.
/// `payload_encrypted` is ChaCha20Poly1305 ciphertext over the client's opaque blob.
/// All metadata is plaintext so the sweep can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// User who created the secret. `None` for anonymous links.
    pub owner_id: Option<String>,
    /// Optional label, only ever shown to the owner.
    pub title: Option<String>,
    /// ChaCha20Poly1305 ciphertext (payload + tag).
    pub payload_encrypted: Vec<u8>,
    /// Per-record random 12-byte nonce.
    pub nonce: [u8; 12],
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    /// Unix timestamp (seconds) after which the record is unreadable.
    pub expires_at: i64,
    /// Successful reads allowed before the record self-destructs.
    pub max_views: u32,
    /// Successful reads so far.
    pub view_count: u32,
}

impl SecretRecord {
    /// True once `now` is past `expires_at`.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// True once the view budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.view_count >= self.max_views
    }

    /// A record is readable only while neither bound has been crossed.
    pub fn is_visible(&self, now: i64) -> bool {
        !self.is_expired(now) && !self.is_exhausted()
    }

    /// Sweep predicate: strictly past expiry, or out of views.
    pub fn is_purgeable(&self, now: i64) -> bool {
        self.expires_at < now || self.is_exhausted()
    }

    pub fn meta(&self, id: &str) -> SecretMeta {
        SecretMeta {
            id: id.to_owned(),
            title: self.title.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            max_views: self.max_views,
            view_count: self.view_count,
        }
    }
}

/// Owner-facing projection. Never includes the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretMeta {
    pub id: String,
    pub title: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub max_views: u32,
    pub view_count: u32,
}

/// Dead man's switch state. `Warning` is reserved for pre-trigger alerts and
/// does not gate firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwitchStatus {
    Idle,
    Warning,
    Triggered,
}

/// Per-user switch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub switch_enabled: bool,
    pub recipient_email: Option<String>,
    pub check_in_interval_days: i64,
    pub note: String,
    pub last_check_in: Option<i64>,
    pub status: SwitchStatus,
    pub triggered_at: Option<i64>,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            switch_enabled: false,
            recipient_email: None,
            check_in_interval_days: DEFAULT_CHECK_IN_INTERVAL_DAYS,
            note: String::new(),
            last_check_in: None,
            status: SwitchStatus::Idle,
            triggered_at: None,
        }
    }
}

impl SwitchConfig {
    /// `last_check_in + interval days`, or `None` if the user never checked in.
    pub fn deadline(&self) -> Option<i64> {
        self.last_check_in.map(|last| {
            last.saturating_add(self.check_in_interval_days.saturating_mul(SECS_PER_DAY))
        })
    }

    /// Armed and in a state the scan is allowed to fire from.
    pub fn is_armed(&self) -> bool {
        self.switch_enabled && matches!(self.status, SwitchStatus::Idle | SwitchStatus::Warning)
    }

    /// Full trigger condition.
    pub fn is_due(&self, now: i64) -> bool {
        self.is_armed()
            && self.recipient_email.is_some()
            && self.deadline().is_some_and(|deadline| now > deadline)
    }

    /// Check-in: restart the countdown and clear any warning or trigger.
    pub fn check_in(&mut self, now: i64) {
        self.last_check_in = Some(now);
        self.status = SwitchStatus::Idle;
    }

    pub fn apply(&mut self, update: &SwitchUpdate) {
        if let Some(enabled) = update.switch_enabled {
            self.switch_enabled = enabled;
        }
        if let Some(ref email) = update.recipient_email {
            let email = email.trim();
            self.recipient_email = (!email.is_empty()).then(|| email.to_owned());
        }
        if let Some(days) = update.check_in_interval_days {
            self.check_in_interval_days = days;
        }
        if let Some(ref note) = update.note {
            self.note = note.clone();
        }
    }
}

/// Partial switch update. Absent fields keep their stored value; an empty
/// `recipient_email` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwitchUpdate {
    pub switch_enabled: Option<bool>,
    pub recipient_email: Option<String>,
    pub check_in_interval_days: Option<i64>,
    pub note: Option<String>,
}

/// A user as seen by this service: identity comes from elsewhere, only the
/// switch lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub created_at: i64,
    pub switch: SwitchConfig,
}

impl UserRecord {
    pub fn new(user_id: &str, now: i64) -> Self {
        Self {
            user_id: user_id.to_owned(),
            created_at: now,
            switch: SwitchConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(expires_at: i64, max_views: u32, view_count: u32) -> SecretRecord {
        SecretRecord {
            owner_id: None,
            title: None,
            payload_encrypted: vec![],
            nonce: [0u8; 12],
            created_at: 1000,
            expires_at,
            max_views,
            view_count,
        }
    }

    #[test]
    fn visible_up_to_and_including_expiry() {
        let r = make_record(2000, 1, 0);
        assert!(r.is_visible(2000));
        assert!(!r.is_visible(2001));
        assert!(!r.is_purgeable(2000));
        assert!(r.is_purgeable(2001));
    }

    #[test]
    fn exhausted_is_invisible_and_purgeable() {
        let r = make_record(5000, 2, 2);
        assert!(r.is_exhausted());
        assert!(!r.is_visible(1000));
        assert!(r.is_purgeable(1000));
    }

    #[test]
    fn deadline_is_last_check_in_plus_days() {
        let cfg = SwitchConfig {
            check_in_interval_days: 2,
            last_check_in: Some(100),
            ..Default::default()
        };
        assert_eq!(cfg.deadline(), Some(100 + 2 * 86_400));
    }

    #[test]
    fn due_requires_every_condition() {
        let mut cfg = SwitchConfig {
            switch_enabled: true,
            recipient_email: Some("heir@example.com".into()),
            check_in_interval_days: 1,
            last_check_in: Some(0),
            ..Default::default()
        };
        assert!(!cfg.is_due(86_400));
        assert!(cfg.is_due(86_401));

        cfg.recipient_email = None;
        assert!(!cfg.is_due(86_401));

        cfg.recipient_email = Some("heir@example.com".into());
        cfg.status = SwitchStatus::Triggered;
        assert!(!cfg.is_due(86_401));

        cfg.status = SwitchStatus::Warning;
        assert!(cfg.is_due(86_401));
    }

    #[test]
    fn apply_leaves_absent_fields_alone() {
        let mut cfg = SwitchConfig {
            recipient_email: Some("a@b.com".into()),
            note: "keep".into(),
            ..Default::default()
        };
        cfg.apply(&SwitchUpdate {
            check_in_interval_days: Some(7),
            ..Default::default()
        });
        assert_eq!(cfg.recipient_email.as_deref(), Some("a@b.com"));
        assert_eq!(cfg.note, "keep");
        assert_eq!(cfg.check_in_interval_days, 7);
        assert!(!cfg.switch_enabled);

        cfg.apply(&SwitchUpdate {
            recipient_email: Some("  ".into()),
            ..Default::default()
        });
        assert_eq!(cfg.recipient_email, None);
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&SwitchStatus::Triggered).unwrap();
        assert_eq!(json, "\"TRIGGERED\"");
        let back: SwitchStatus = serde_json::from_str("\"WARNING\"").unwrap();
        assert_eq!(back, SwitchStatus::Warning);
    }
}
