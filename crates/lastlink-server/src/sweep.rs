//! Periodic maintenance: purge dead secrets, then run the switch scan.

use std::time::Duration;

use serde::Serialize;
use tokio::time;
use tracing::{info, warn};

use crate::dms::SwitchEngine;
use crate::error::EngineError;
use crate::lifecycle::SecretEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DmsOutcome {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub deleted_secrets: usize,
    pub dms: DmsOutcome,
    pub triggered: usize,
}

#[derive(Clone)]
pub struct Maintenance {
    secrets: SecretEngine,
    switches: SwitchEngine,
}

impl Maintenance {
    pub fn new(secrets: SecretEngine, switches: SwitchEngine) -> Self {
        Self { secrets, switches }
    }

    /// One maintenance pass. A purge failure aborts the pass; a scan failure
    /// is reported as `dms: ERROR` alongside the purge count.
    pub async fn run(&self) -> Result<SweepReport, EngineError> {
        let deleted_secrets = self.secrets.sweep_expired()?;

        let (dms, triggered) = match self.switches.scan().await {
            Ok(report) => (DmsOutcome::Ok, report.triggered),
            Err(e) => {
                warn!(error = %e, "switch scan failed");
                (DmsOutcome::Error, 0)
            }
        };

        info!(deleted_secrets, dms = ?dms, triggered, "maintenance pass complete");
        Ok(SweepReport {
            deleted_secrets,
            dms,
            triggered,
        })
    }

    /// Run [`Maintenance::run`] every `interval` until the runtime shuts down.
    pub fn spawn(self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.run().await {
                    warn!(error = %e, "background sweep error");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::CreateSecret;
    use crate::notify::{Notification, Notifier, NotifyError};
    use crate::store::{Store, SwitchUpdate};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct AcceptAll;

    #[async_trait]
    impl Notifier for AcceptAll {
        async fn send(&self, _message: &Notification) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    struct Fixture {
        maintenance: Maintenance,
        secrets: SecretEngine,
        switches: SwitchEngine,
        store: Store,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn make_maintenance() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            &dir.path().join("test.db"),
            crate::store::crypto::generate_key(),
        )
        .unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let secrets = SecretEngine::new(store.clone(), clock.clone());
        let switches = SwitchEngine::new(
            store.clone(),
            clock.clone(),
            Arc::new(AcceptAll),
            Duration::from_secs(1),
            "lastlink".into(),
        );
        Fixture {
            maintenance: Maintenance::new(secrets.clone(), switches.clone()),
            secrets,
            switches,
            store,
            clock,
            _dir: dir,
        }
    }

    fn create_short_lived(secrets: &SecretEngine, count: usize) {
        for _ in 0..count {
            secrets
                .create(CreateSecret {
                    payload: b"p".to_vec(),
                    expiration_hours: Some(1),
                    ..Default::default()
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn purges_then_scans() {
        let f = make_maintenance();
        create_short_lived(&f.secrets, 2);
        f.switches
            .update_config(
                "alice",
                &SwitchUpdate {
                    switch_enabled: Some(true),
                    recipient_email: Some("heir@example.com".into()),
                    check_in_interval_days: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        f.clock.advance(2 * 86_400);

        let report = f.maintenance.run().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                deleted_secrets: 2,
                dms: DmsOutcome::Ok,
                triggered: 1,
            }
        );

        let again = f.maintenance.run().await.unwrap();
        assert_eq!((again.deleted_secrets, again.triggered), (0, 0));
    }

    #[tokio::test]
    async fn undecodable_user_row_does_not_block_other_switches() {
        let f = make_maintenance();
        create_short_lived(&f.secrets, 1);
        f.switches
            .update_config(
                "alice",
                &SwitchUpdate {
                    switch_enabled: Some(true),
                    recipient_email: Some("heir@example.com".into()),
                    check_in_interval_days: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        {
            let txn = f.store.db.begin_write().unwrap();
            txn.open_table(crate::store::users::USERS)
                .unwrap()
                .insert("zzz", [0xff_u8, 0xff, 0xff].as_slice())
                .unwrap();
            txn.commit().unwrap();
        }
        f.clock.advance(2 * 86_400);

        let report = f.maintenance.run().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                deleted_secrets: 1,
                dms: DmsOutcome::Ok,
                triggered: 1,
            }
        );
        let alice = f.store.get_user("alice").unwrap().unwrap();
        assert!(!alice.switch.switch_enabled);
    }

    #[tokio::test]
    async fn scan_failure_is_reported_after_purge() {
        let f = make_maintenance();
        create_short_lived(&f.secrets, 3);
        f.clock.advance(2 * 3_600);

        // Replace the users table with one of another type so the scan
        // cannot open it.
        let txn = f.store.db.begin_write().unwrap();
        txn.delete_table(crate::store::users::USERS).unwrap();
        txn.open_table(redb::TableDefinition::<&str, u64>::new("users"))
            .unwrap();
        txn.commit().unwrap();

        let report = f.maintenance.run().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                deleted_secrets: 3,
                dms: DmsOutcome::Error,
                triggered: 0,
            }
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["dms"], "ERROR");
    }

    #[test]
    fn report_serializes_outcome_uppercase() {
        let report = SweepReport {
            deleted_secrets: 3,
            dms: DmsOutcome::Ok,
            triggered: 0,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["dms"], "OK");
        assert_eq!(json["deleted_secrets"], 3);
        assert_eq!(serde_json::to_value(DmsOutcome::Error).unwrap(), "ERROR");
    }
}
