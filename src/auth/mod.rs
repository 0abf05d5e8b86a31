//! Auth token construction for the WebSocket upgrade
//!
//! The uplink is authorized by two HTTP upgrade headers: `username` and
//! `token`. The token is built from a fresh random nonce and the account
//! password:
//!
//! ```text
//! key        = Argon2id(password, salt = nonce, t = 3, m = 32 MiB, p = 4)
//! plaintext  = unix time in nanoseconds, 8 bytes big-endian
//! token      = hex(nonce || AES-256-GCM(key, nonce, plaintext))
//! ```
//!
//! The server recomputes the key from its stored password and the leading
//! 12 bytes of the decoded token; a successful open plus a timestamp
//! within its skew window authorizes the connection.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Length of the GCM nonce, also used as the Argon2 salt
pub const NONCE_LEN: usize = 12;

/// Length of the derived AES key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the sealed timestamp in bytes
pub const TIMESTAMP_LEN: usize = 8;

/// Argon2 time cost.
///
/// These parameters are part of the wire contract with the server and
/// are deliberately constants, not configuration.
pub const ARGON2_TIME_COST: u32 = 3;

/// Argon2 memory cost in KiB (32 MiB)
pub const ARGON2_MEMORY_KIB: u32 = 32 * 1024;

/// Argon2 parallelism
pub const ARGON2_LANES: u32 = 4;

/// Auth errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("seal failed")]
    Seal,

    #[error("token rejected")]
    Rejected,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("system clock before unix epoch")]
    Clock,
}

/// Derive the 32-byte AES key from the password and nonce
pub fn derive_key(password: &str, salt: &[u8; NONCE_LEN]) -> Result<[u8; KEY_LEN], AuthError> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_TIME_COST, ARGON2_LANES, Some(KEY_LEN))
        .map_err(|e| AuthError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| AuthError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Build a hex token for the current wall-clock time with a fresh nonce
pub fn seal_token(password: &str) -> Result<String, AuthError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| AuthError::Clock)?;

    seal_token_at(password, &nonce, now.as_nanos() as u64)
}

/// Seal a specific timestamp under a specific nonce
pub fn seal_token_at(
    password: &str,
    nonce: &[u8; NONCE_LEN],
    timestamp_nanos: u64,
) -> Result<String, AuthError> {
    let key = derive_key(password, nonce)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| AuthError::Seal)?;

    let plaintext = timestamp_nanos.to_be_bytes();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext.as_ref())
        .map_err(|_| AuthError::Seal)?;

    // Token bytes are nonce || ciphertext || tag, matching the server's
    // expectation that the nonce prefixes the sealed output.
    let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    token.extend_from_slice(nonce);
    token.extend_from_slice(&ciphertext);
    Ok(hex::encode(token))
}

/// Open a hex token and return the sealed timestamp in nanoseconds.
///
/// This is the server-side verification, kept here so both directions of
/// the contract live next to each other and can be tested together.
pub fn open_token(password: &str, token_hex: &str) -> Result<u64, AuthError> {
    let token = hex::decode(token_hex).map_err(|e| AuthError::Malformed(e.to_string()))?;
    if token.len() <= NONCE_LEN {
        return Err(AuthError::Malformed(format!("token too short: {}", token.len())));
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&token[..NONCE_LEN]);

    let key = derive_key(password, &nonce)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| AuthError::Seal)?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), &token[NONCE_LEN..])
        .map_err(|_| AuthError::Rejected)?;

    if plaintext.len() != TIMESTAMP_LEN {
        return Err(AuthError::Malformed(format!(
            "unexpected plaintext length: {}",
            plaintext.len()
        )));
    }

    let mut ts = [0u8; TIMESTAMP_LEN];
    ts.copy_from_slice(&plaintext);
    Ok(u64::from_be_bytes(ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORD: &str = "correct horse battery staple";

    #[test]
    fn test_token_roundtrip() {
        let nonce = [7u8; NONCE_LEN];
        let timestamp = 1_700_000_000_000_000_000u64;

        let token = seal_token_at(PASSWORD, &nonce, timestamp).unwrap();
        let opened = open_token(PASSWORD, &token).unwrap();

        assert_eq!(opened, timestamp);
    }

    #[test]
    fn test_nonce_prefixes_token() {
        let nonce = [0xA5u8; NONCE_LEN];
        let token = seal_token_at(PASSWORD, &nonce, 42).unwrap();

        let raw = hex::decode(&token).unwrap();
        assert_eq!(&raw[..NONCE_LEN], &nonce);
        // nonce + 8-byte plaintext + 16-byte tag
        assert_eq!(raw.len(), NONCE_LEN + TIMESTAMP_LEN + 16);
    }

    #[test]
    fn test_wrong_password_rejected() {
        let token = seal_token(PASSWORD).unwrap();
        assert!(matches!(
            open_token("not the password", &token),
            Err(AuthError::Rejected)
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let token = seal_token(PASSWORD).unwrap();
        let mut raw = hex::decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;

        assert!(matches!(
            open_token(PASSWORD, &hex::encode(raw)),
            Err(AuthError::Rejected)
        ));
    }

    #[test]
    fn test_short_token_malformed() {
        assert!(matches!(
            open_token(PASSWORD, "abcd"),
            Err(AuthError::Malformed(_))
        ));
        assert!(matches!(
            open_token(PASSWORD, "zz"),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_key_derivation_deterministic() {
        let nonce = [1u8; NONCE_LEN];
        let k1 = derive_key(PASSWORD, &nonce).unwrap();
        let k2 = derive_key(PASSWORD, &nonce).unwrap();
        assert_eq!(k1, k2);

        let other = derive_key(PASSWORD, &[2u8; NONCE_LEN]).unwrap();
        assert_ne!(k1, other);
    }
}
