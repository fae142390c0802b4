use anyhow::{Context, Result};
use redb::{ReadableTable, TableDefinition};
use tracing::{debug, warn};

use super::model::{SwitchStatus, SwitchUpdate, UserRecord};

pub(crate) const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

impl super::db::Store {
    /// Fetch a user record, if this user has ever been seen.
    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        let user = match table.get(user_id)? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(user)
    }

    /// Restart the user's countdown, creating the record on first sight.
    pub fn record_check_in(&self, user_id: &str, now: i64) -> Result<UserRecord> {
        self.modify_user(user_id, now, |user| user.switch.check_in(now))
    }

    /// Apply a partial switch update. Saving is itself a check-in.
    pub fn update_switch(
        &self,
        user_id: &str,
        update: &SwitchUpdate,
        now: i64,
    ) -> Result<UserRecord> {
        self.modify_user(user_id, now, |user| {
            user.switch.apply(update);
            user.switch.check_in(now);
        })
    }

    /// Users whose switch is enabled and not yet triggered.
    pub fn list_armed_switches(&self) -> Result<Vec<UserRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        let mut armed = Vec::new();
        for item in table.iter()? {
            let (k, v) = item?;
            let user = match decode(v.value()) {
                Ok(user) => user,
                Err(e) => {
                    warn!(user_id = %k.value(), error = %e, "skipping undecodable user row");
                    continue;
                }
            };
            if user.switch.is_armed() {
                armed.push(user);
            }
        }
        Ok(armed)
    }

    /// Disarm and mark triggered, but only if the switch is still enabled at
    /// commit time. Returns false when someone else got there first or the
    /// user disarmed in the meantime.
    pub fn mark_triggered(&self, user_id: &str, now: i64) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let flipped = {
            let mut table = write_txn.open_table(USERS)?;
            let raw_bytes: Option<Vec<u8>> =
                table.get(user_id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => false,
                Some(bytes) => {
                    let mut user = decode(&bytes)?;
                    if !user.switch.switch_enabled {
                        false
                    } else {
                        user.switch.switch_enabled = false;
                        user.switch.status = SwitchStatus::Triggered;
                        user.switch.triggered_at = Some(now);
                        let updated = encode(&user)?;
                        table.insert(user_id, updated.as_slice())?;
                        true
                    }
                }
            }
        };
        write_txn.commit()?;
        debug!(user_id = %user_id, flipped, "mark switch triggered");
        Ok(flipped)
    }

    /// Read-modify-write one user inside a single write transaction.
    fn modify_user(
        &self,
        user_id: &str,
        now: i64,
        change: impl FnOnce(&mut UserRecord),
    ) -> Result<UserRecord> {
        let write_txn = self.db.begin_write()?;
        let user = {
            let mut table = write_txn.open_table(USERS)?;
            let raw_bytes: Option<Vec<u8>> =
                table.get(user_id)?.map(|guard| guard.value().to_vec());

            let mut user = match raw_bytes {
                Some(bytes) => decode(&bytes)?,
                None => UserRecord::new(user_id, now),
            };
            change(&mut user);

            let bytes = encode(&user)?;
            table.insert(user_id, bytes.as_slice())?;
            user
        };
        write_txn.commit()?;
        Ok(user)
    }
}

fn encode(user: &UserRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(user, bincode::config::standard())
        .context("bincode encode user")
}

fn decode(bytes: &[u8]) -> Result<UserRecord> {
    let (user, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode user")?;
    Ok(user)
}
