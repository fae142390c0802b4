use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, warn};

use super::crypto::EncryptionKey;
use super::model::{SecretMeta, SecretRecord};

pub(crate) const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Input for [`Store::insert_secret`]. Bounds are already clamped by the caller.
#[derive(Debug, Clone)]
pub struct NewSecret<'a> {
    pub owner_id: Option<&'a str>,
    pub title: Option<&'a str>,
    pub payload: &'a [u8],
    pub created_at: i64,
    pub expires_at: i64,
    pub max_views: u32,
}

/// Outcome of one atomic consume-a-view attempt.
#[derive(Debug, PartialEq)]
pub enum ViewOutcome {
    /// No record under this id.
    Missing,
    /// Record exists but `now > expires_at`. Left in place.
    Expired,
    /// Record exists but its views were already spent. Left in place.
    Exhausted,
    /// One view was consumed. The counter is committed before this returns.
    Consumed(ConsumedView),
}

#[derive(Debug, PartialEq)]
pub struct ConsumedView {
    pub payload: Vec<u8>,
    pub expires_at: i64,
    pub max_views: u32,
    /// Counter value after this read's increment.
    pub view_count: u32,
}

impl ConsumedView {
    pub fn is_last(&self) -> bool {
        self.view_count >= self.max_views
    }
}

/// Thread-safe handle to the redb store. Opened once per process and shared
/// by clone; the database closes when the last handle drops.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
    key: Arc<EncryptionKey>,
}

impl Store {
    /// Open (or create) the database at `path`, using `key` for payload encryption.
    pub fn open(path: &Path, key: EncryptionKey) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(super::users::USERS)?;
        write_txn.open_table(super::api_keys::API_KEYS)?;
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            key: Arc::new(key),
        })
    }

    /// Insert a new secret. Fails if `id` is already taken.
    pub fn insert_secret(&self, id: &str, secret: &NewSecret<'_>) -> Result<()> {
        let (payload_encrypted, nonce) =
            super::crypto::encrypt(&self.key, secret.payload).context("encrypt payload")?;

        let record = SecretRecord {
            owner_id: secret.owner_id.map(str::to_owned),
            title: secret.title.map(str::to_owned),
            payload_encrypted,
            nonce,
            created_at: secret.created_at,
            expires_at: secret.expires_at,
            max_views: secret.max_views,
            view_count: 0,
        };

        let bytes = encode(&record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            if table.get(id)?.is_some() {
                anyhow::bail!("secret id collision");
            }
            table.insert(id, bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!(id = %id, "stored secret");
        Ok(())
    }

    /// Fetch a record without touching its counter or decrypting it.
    pub fn get_secret(&self, id: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let record = match table.get(id)? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(record)
    }

    /// Check visibility and increment `view_count` in a single write
    /// transaction. redb serialises writers, so concurrent consumers of the
    /// same id observe each other's increments and the counter never passes
    /// `max_views`. Never deletes; the caller decides what to burn.
    pub fn consume_view(&self, id: &str, now: i64) -> Result<ViewOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Copy the bytes out so the AccessGuard (which borrows `table`)
            // is dropped before the insert.
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => ViewOutcome::Missing,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;

                    if record.is_expired(now) {
                        ViewOutcome::Expired
                    } else if record.is_exhausted() {
                        ViewOutcome::Exhausted
                    } else {
                        let payload = super::crypto::decrypt(
                            &self.key,
                            &record.payload_encrypted,
                            &record.nonce,
                        )
                        .context("decrypt payload")?;

                        record.view_count += 1;
                        let updated = encode(&record)?;
                        table.insert(id, updated.as_slice())?;

                        ViewOutcome::Consumed(ConsumedView {
                            payload,
                            expires_at: record.expires_at,
                            max_views: record.max_views,
                            view_count: record.view_count,
                        })
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Delete a secret by id. Returns true if it existed.
    pub fn delete_secret(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let removed = table.remove(id)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Metadata for `owner_id`'s secrets that are still readable, newest first.
    pub fn list_secrets_for_owner(&self, owner_id: &str, now: i64) -> Result<Vec<SecretMeta>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;

        let mut metas = Vec::new();
        for item in table.iter()? {
            let (k, v) = item?;
            let record = match decode(v.value()) {
                Ok(record) => record,
                Err(e) => {
                    warn!(id = %k.value(), error = %e, "skipping undecodable secret row");
                    continue;
                }
            };
            if record.owner_id.as_deref() == Some(owner_id) && record.is_visible(now) {
                metas.push(record.meta(k.value()));
            }
        }
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(metas)
    }

    /// Remove every expired or exhausted secret. Returns how many rows this
    /// call actually removed, so a second run over the same state reports 0.
    pub fn prune_secrets(&self, now: i64) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SECRETS)?;

            let mut doomed = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                match decode(v.value()) {
                    Ok(record) if record.is_purgeable(now) => doomed.push(k.value().to_owned()),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(id = %k.value(), error = %e, "skipping undecodable secret row");
                    }
                }
            }

            let mut removed = 0usize;
            for id in &doomed {
                if table.remove(id.as_str())?.is_some() {
                    removed += 1;
                }
            }
            removed
        };
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "pruned expired secrets");
        }
        Ok(removed)
    }
}

fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard()).context("bincode encode")
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(record)
}
