use anyhow::{Context, Result};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

pub(crate) const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");

/// Prefix that distinguishes API keys from identity-provider session tokens.
pub const API_KEY_PREFIX: &str = "ll_key_";

/// A long-lived credential that acts on behalf of `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub key_hash: Vec<u8>,
    pub user_id: String,
    pub label: String,
    pub created_at: i64,
    pub request_count: u64,
    pub last_used_at: Option<i64>,
}

/// Generate a new API key in the format `ll_key_<32 hex chars>`.
pub fn generate_api_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    format!("{API_KEY_PREFIX}{}", hex::encode(bytes))
}

/// Generate a short random ID for an API key record.
pub fn generate_key_id() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Hash a key with SHA-256 for storage lookup.
pub fn hash_key(key: &str) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().to_vec()
}

impl super::db::Store {
    /// Insert an API key record.
    pub fn put_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        let bytes = encode(record)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(API_KEYS)?;
            table.insert(record.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// List the API keys belonging to `user_id`.
    pub fn list_api_keys_for_user(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(API_KEYS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let record = decode(v.value())?;
            if record.user_id == user_id {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Delete an API key owned by `user_id`. Returns true if it existed and
    /// belonged to that user.
    pub fn delete_api_key(&self, id: &str, user_id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(API_KEYS)?;
            let owned = match table.get(id)? {
                Some(guard) => decode(guard.value())?.user_id == user_id,
                None => false,
            };
            if owned {
                table.remove(id)?;
            }
            owned
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Find an API key record by its SHA-256 hash. Scans all records.
    pub fn find_api_key_by_hash(&self, hash: &[u8]) -> Result<Option<ApiKeyRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(API_KEYS)?;

        for item in table.iter()? {
            let (_k, v) = item?;
            let record = decode(v.value())?;
            if record.key_hash == hash {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Bump the usage counter for a key. Missing keys are ignored.
    pub fn record_api_key_use(&self, id: &str, now: i64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(API_KEYS)?;
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
            if let Some(bytes) = raw_bytes {
                let mut record = decode(&bytes)?;
                record.request_count += 1;
                record.last_used_at = Some(now);
                let updated = encode(&record)?;
                table.insert(id, updated.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn encode(record: &ApiKeyRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode api key")
}

fn decode(bytes: &[u8]) -> Result<ApiKeyRecord> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode api key")?;
    Ok(record)
}
