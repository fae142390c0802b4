//! Dead man's switch: per-user deadlines, check-ins, and the trigger scan.
//!
//! State machine: `IDLE <-> WARNING -> TRIGGERED`. Any check-in or config save
//! returns to `IDLE`; a triggered switch stays disarmed until the user arms it
//! again through [`SwitchEngine::update_config`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::notify::{Notifier, NotifyError, SwitchReleaseEmail};
use crate::store::{Store, SwitchConfig, SwitchUpdate, UserRecord};

/// Upper bound the HTTP surface accepts for the check-in interval.
pub const MAX_CHECK_IN_INTERVAL_DAYS: i64 = 3_650;
/// Upper bound the HTTP surface accepts for the note.
pub const MAX_NOTE_BYTES: usize = 65_536;

/// Result of one scan over the armed switches.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    /// Armed switches looked at.
    pub examined: usize,
    /// Switches delivered and disarmed by this scan.
    pub triggered: usize,
    /// Due switches whose delivery failed; retried next scan.
    pub failed: usize,
    /// Armed switches that cannot fire (no recipient or never checked in).
    pub skipped: usize,
}

#[derive(Clone)]
pub struct SwitchEngine {
    store: Store,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    notify_timeout: Duration,
    sender_label: String,
    scan_lock: Arc<Mutex<()>>,
}

impl SwitchEngine {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        notify_timeout: Duration,
        sender_label: String,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            notify_timeout,
            sender_label,
            scan_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Liveness signal: restart the countdown and reset the status to `IDLE`.
    /// Never re-enables a disarmed switch.
    pub fn record_check_in(&self, user_id: &str) -> Result<SwitchConfig, EngineError> {
        let user = self.store.record_check_in(user_id, self.clock.now())?;
        debug!(user_id = %user_id, "check-in recorded");
        Ok(user.switch)
    }

    /// Current configuration. Users never seen before get the disarmed default.
    pub fn get_config(&self, user_id: &str) -> Result<SwitchConfig, EngineError> {
        Ok(self
            .store
            .get_user(user_id)?
            .map(|user| user.switch)
            .unwrap_or_default())
    }

    /// Save configuration. Saving counts as a check-in.
    pub fn update_config(
        &self,
        user_id: &str,
        update: &SwitchUpdate,
    ) -> Result<SwitchConfig, EngineError> {
        let user = self
            .store
            .update_switch(user_id, update, self.clock.now())?;
        info!(
            user_id = %user_id,
            switch_enabled = user.switch.switch_enabled,
            interval_days = user.switch.check_in_interval_days,
            "switch configuration saved"
        );
        Ok(user.switch)
    }

    /// Fire every switch whose deadline has passed.
    ///
    /// Delivery comes first; the switch is disarmed only after the provider
    /// accepted the message, so a failed delivery is retried by the next scan.
    /// One user's failure never stops the loop.
    pub async fn scan(&self) -> Result<ScanReport, EngineError> {
        let _guard = self.scan_lock.lock().await;

        let armed = self.store.list_armed_switches()?;
        let now = self.clock.now();
        let mut report = ScanReport {
            examined: armed.len(),
            ..Default::default()
        };

        for user in &armed {
            let Some(recipient) = user.switch.recipient_email.as_deref() else {
                debug!(user_id = %user.user_id, "armed switch has no recipient; skipping");
                report.skipped += 1;
                continue;
            };
            if user.switch.last_check_in.is_none() {
                debug!(user_id = %user.user_id, "armed switch has no check-in; skipping");
                report.skipped += 1;
                continue;
            }
            if !user.switch.is_due(now) {
                continue;
            }

            match self.release(user, recipient).await {
                Ok(true) => report.triggered += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(user_id = %user.user_id, error = %e, "switch release failed; will retry");
                    report.failed += 1;
                }
            }
        }

        if report.triggered > 0 || report.failed > 0 {
            info!(
                examined = report.examined,
                triggered = report.triggered,
                failed = report.failed,
                "switch scan complete"
            );
        }
        Ok(report)
    }

    /// Deliver the note, then flip the switch. Returns whether this call
    /// performed the flip.
    async fn release(&self, user: &UserRecord, recipient: &str) -> Result<bool, EngineError> {
        let message = SwitchReleaseEmail::new(&user.switch.note, &self.sender_label)
            .into_notification(recipient);

        tokio::time::timeout(self.notify_timeout, self.notifier.send(&message))
            .await
            .map_err(|_| NotifyError::Timeout(self.notify_timeout))??;

        let flipped = self.store.mark_triggered(&user.user_id, self.clock.now())?;
        if flipped {
            info!(user_id = %user.user_id, "switch triggered");
        } else {
            warn!(
                user_id = %user.user_id,
                "switch disarmed during delivery; not marking triggered"
            );
        }
        Ok(flipped)
    }
}

/// Input checks applied at the HTTP boundary. The engine itself accepts any
/// interval.
pub fn validate_update(update: &SwitchUpdate) -> Result<(), EngineError> {
    if let Some(days) = update.check_in_interval_days {
        if !(1..=MAX_CHECK_IN_INTERVAL_DAYS).contains(&days) {
            return Err(EngineError::validation(format!(
                "check_in_interval must be between 1 and {MAX_CHECK_IN_INTERVAL_DAYS} days"
            )));
        }
    }
    if let Some(ref email) = update.recipient_email {
        let email = email.trim();
        if !email.is_empty() && !looks_like_email(email) {
            return Err(EngineError::validation("recipient_email is not a valid address"));
        }
    }
    if let Some(ref note) = update.note {
        if note.len() > MAX_NOTE_BYTES {
            return Err(EngineError::validation("note exceeds 64 KiB limit"));
        }
    }
    Ok(())
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !s.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::Notification;
    use crate::store::SwitchStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const T0: i64 = 1_700_000_000;
    const DAY: i64 = 86_400;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: std::sync::Mutex<Vec<Notification>>,
        fail: AtomicBool,
        hang: AtomicBool,
        reject_to: std::sync::Mutex<Option<String>>,
    }

    impl RecordingNotifier {
        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, message: &Notification) -> Result<(), NotifyError> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            let rejected = self.reject_to.lock().unwrap().as_deref() == Some(message.to.as_str());
            if rejected || self.fail.load(Ordering::SeqCst) {
                return Err(NotifyError::Rejected { status: 503 });
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Fixture {
        engine: SwitchEngine,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            &dir.path().join("test.db"),
            crate::store::crypto::generate_key(),
        )
        .unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = SwitchEngine::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            Duration::from_millis(200),
            "lastlink".into(),
        );
        Fixture {
            engine,
            clock,
            notifier,
            _dir: dir,
        }
    }

    fn arm(engine: &SwitchEngine, user: &str, recipient: Option<&str>, days: i64) {
        engine
            .update_config(
                user,
                &SwitchUpdate {
                    switch_enabled: Some(true),
                    recipient_email: recipient.map(str::to_owned),
                    check_in_interval_days: Some(days),
                    note: Some("safe code 4821".into()),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn overdue_switch_fires_exactly_once() {
        let f = fixture();
        arm(&f.engine, "alice", Some("a@b.com"), 1);
        f.clock.advance(2 * DAY);

        let report = f.engine.scan().await.unwrap();
        assert_eq!(report.triggered, 1);
        assert_eq!(f.notifier.count(), 1);
        let sent = f.notifier.sent.lock().unwrap()[0].clone();
        assert_eq!(sent.to, "a@b.com");
        assert!(sent.text.contains("safe code 4821"));

        let cfg = f.engine.get_config("alice").unwrap();
        assert!(!cfg.switch_enabled);
        assert_eq!(cfg.status, SwitchStatus::Triggered);

        let again = f.engine.scan().await.unwrap();
        assert_eq!(again.triggered, 0);
        assert_eq!(f.notifier.count(), 1);
    }

    #[tokio::test]
    async fn not_yet_due_is_left_alone() {
        let f = fixture();
        arm(&f.engine, "alice", Some("a@b.com"), 1);
        f.clock.advance(DAY);

        let report = f.engine.scan().await.unwrap();
        assert_eq!(report, ScanReport { examined: 1, ..Default::default() });
        assert!(f.engine.get_config("alice").unwrap().switch_enabled);
    }

    #[tokio::test]
    async fn missing_recipient_is_skipped_without_state_change() {
        let f = fixture();
        arm(&f.engine, "alice", None, 1);
        f.clock.advance(5 * DAY);
        let before = f.engine.get_config("alice").unwrap();

        let report = f.engine.scan().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(f.notifier.count(), 0);
        assert_eq!(f.engine.get_config("alice").unwrap(), before);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_next_scan() {
        let f = fixture();
        arm(&f.engine, "alice", Some("a@b.com"), 1);
        f.clock.advance(2 * DAY);
        f.notifier.fail.store(true, Ordering::SeqCst);

        let report = f.engine.scan().await.unwrap();
        assert_eq!((report.triggered, report.failed), (0, 1));
        let cfg = f.engine.get_config("alice").unwrap();
        assert!(cfg.switch_enabled);
        assert_eq!(cfg.status, SwitchStatus::Idle);

        f.notifier.fail.store(false, Ordering::SeqCst);
        assert_eq!(f.engine.scan().await.unwrap().triggered, 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_scan() {
        let f = fixture();
        arm(&f.engine, "alice", Some("a@b.com"), 1);
        arm(&f.engine, "bob", Some("c@d.com"), 1);
        *f.notifier.reject_to.lock().unwrap() = Some("a@b.com".into());
        f.clock.advance(2 * DAY);

        let report = f.engine.scan().await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!((report.triggered, report.failed), (1, 1));
        assert!(f.engine.get_config("alice").unwrap().switch_enabled);
        assert!(!f.engine.get_config("bob").unwrap().switch_enabled);
    }

    #[tokio::test]
    async fn hung_delivery_times_out_as_failure() {
        let f = fixture();
        arm(&f.engine, "alice", Some("a@b.com"), 1);
        f.clock.advance(2 * DAY);
        f.notifier.hang.store(true, Ordering::SeqCst);

        let report = f.engine.scan().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(f.engine.get_config("alice").unwrap().switch_enabled);
    }

    #[tokio::test]
    async fn overlapping_scans_send_once() {
        let f = fixture();
        arm(&f.engine, "alice", Some("a@b.com"), 1);
        f.clock.advance(2 * DAY);

        let (a, b) = tokio::join!(f.engine.scan(), f.engine.scan());
        assert_eq!(a.unwrap().triggered + b.unwrap().triggered, 1);
        assert_eq!(f.notifier.count(), 1);
    }

    #[tokio::test]
    async fn check_in_resets_status_but_not_enabled() {
        let f = fixture();
        arm(&f.engine, "alice", Some("a@b.com"), 1);
        f.clock.advance(2 * DAY);
        f.engine.scan().await.unwrap();

        let cfg = f.engine.record_check_in("alice").unwrap();
        assert_eq!(cfg.status, SwitchStatus::Idle);
        assert!(!cfg.switch_enabled);
        assert_eq!(cfg.last_check_in, Some(T0 + 2 * DAY));

        let cfg = f
            .engine
            .update_config(
                "alice",
                &SwitchUpdate {
                    note: Some("new note".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(cfg.status, SwitchStatus::Idle);
        assert!(!cfg.switch_enabled);

        // Re-arming is explicit and starts a fresh cycle.
        arm(&f.engine, "alice", Some("a@b.com"), 1);
        f.clock.advance(2 * DAY);
        assert_eq!(f.engine.scan().await.unwrap().triggered, 1);
        assert_eq!(f.notifier.count(), 2);
    }

    #[tokio::test]
    async fn check_in_pushes_deadline_back() {
        let f = fixture();
        arm(&f.engine, "alice", Some("a@b.com"), 2);
        f.clock.advance(DAY + DAY / 2);
        f.engine.record_check_in("alice").unwrap();
        f.clock.advance(DAY + DAY / 2);

        assert_eq!(f.engine.scan().await.unwrap().triggered, 0);
        assert_eq!(f.notifier.count(), 0);
    }

    #[test]
    fn unseen_user_gets_default_config() {
        let f = fixture();
        let cfg = f.engine.get_config("ghost").unwrap();
        assert!(!cfg.switch_enabled);
        assert_eq!(cfg.last_check_in, None);
    }

    #[test]
    fn validate_update_bounds() {
        let ok = SwitchUpdate {
            check_in_interval_days: Some(30),
            recipient_email: Some("heir@example.com".into()),
            ..Default::default()
        };
        assert!(validate_update(&ok).is_ok());

        let clear = SwitchUpdate {
            recipient_email: Some(String::new()),
            ..Default::default()
        };
        assert!(validate_update(&clear).is_ok());

        for bad in [
            SwitchUpdate {
                check_in_interval_days: Some(0),
                ..Default::default()
            },
            SwitchUpdate {
                recipient_email: Some("not-an-email".into()),
                ..Default::default()
            },
            SwitchUpdate {
                note: Some("x".repeat(MAX_NOTE_BYTES + 1)),
                ..Default::default()
            },
        ] {
            assert!(matches!(validate_update(&bad), Err(EngineError::Validation(_))));
        }
    }
}
