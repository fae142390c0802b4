use anyhow::{Context, Result};
use argon2::{password_hash::SaltString, Argon2, Params, PasswordHasher};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

/// 32-byte at-rest encryption key for secret payloads.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Generate a fresh random key.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Load a key from raw bytes. Returns `None` unless exactly 32 bytes.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let key: [u8; 32] = bytes.try_into().ok()?;
    Some(EncryptionKey(key))
}

/// Derive a 32-byte key from `master_key` and `salt` using Argon2id.
/// The salt is persisted (`lastlink.salt`) and reused across restarts.
pub fn derive_key(master_key: &str, salt: &[u8; 32]) -> Result<EncryptionKey> {
    let salt_string =
        SaltString::encode_b64(salt).map_err(|e| anyhow::anyhow!("invalid salt for argon2: {e}"))?;

    let params = Params::new(
        65536, // m_cost: 64 MiB
        3,     // t_cost: 3 iterations
        1,     // p_cost: 1 lane
        Some(32),
    )
    .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let hash = argon2
        .hash_password(master_key.as_bytes(), &salt_string)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;

    let output = hash.hash.context("no hash output")?;
    let key = load_key(output.as_bytes()).context("argon2 output is not 32 bytes")?;
    Ok(key)
}

/// Encrypt `plaintext` with `key`, returning `(ciphertext, nonce)`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; 12])> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypt `ciphertext` with `key` and `nonce`, returning plaintext.
pub fn decrypt(key: &EncryptionKey, ciphertext: &[u8], nonce_bytes: &[u8; 12]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from(*nonce_bytes);

    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|e| anyhow::anyhow!("decrypt: {e}"))
}

/// Generate a fresh 32-byte random salt.
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = generate_key();
        let (ct, nonce) = encrypt(&key, b"opaque client blob").unwrap();
        assert_eq!(decrypt(&key, &ct, &nonce).unwrap(), b"opaque client blob");
    }

    #[test]
    fn wrong_key_fails() {
        let salt = generate_salt();
        let key1 = derive_key("key-one", &salt).unwrap();
        let key2 = derive_key("key-two", &salt).unwrap();
        let (ct, nonce) = encrypt(&key1, b"secret").unwrap();
        assert!(decrypt(&key2, &ct, &nonce).is_err());
    }

    #[test]
    fn derivation_is_stable_for_same_salt() {
        let salt = generate_salt();
        let a = derive_key("master", &salt).unwrap();
        let b = derive_key("master", &salt).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn load_key_checks_length() {
        assert!(load_key(&[7u8; 32]).is_some());
        assert!(load_key(&[7u8; 31]).is_none());
    }
}
