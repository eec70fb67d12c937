use crate::config::KdfParams;
use crate::{Error, Result};
use aes_siv::aead::KeyInit;
use aes_siv::siv::Aes256Siv;
use argon2::{Algorithm, Argon2, Params, Version};
use std::fmt;

pub const KEY_LEN: usize = 64;
pub const TAG_LEN: usize = 16;

/// Fixed application salt. The key must be a pure function of the password
/// so that every run against a bucket derives the same key.
const KEY_SALT: &[u8] = b"onesnap/aes-256-siv/v1";

/// Associated-data domain for content objects.
pub const DOMAIN_OBJECT: &[u8] = b"object";
/// Associated-data domain for manifest generations.
pub const DOMAIN_MANIFEST: &[u8] = b"manifest";

/// Password-derived key. Lives only in memory for the duration of a run.
pub struct EncryptionKey {
    key: [u8; KEY_LEN],
}

impl EncryptionKey {
    pub fn derive(password: &str, params: &KdfParams) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::InvalidInput("password must not be empty".to_string()));
        }

        let params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| Error::InvalidInput(format!("invalid KDF parameters: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(password.as_bytes(), KEY_SALT, &mut key)
            .map_err(|e| Error::InvalidInput(format!("key derivation failed: {}", e)))?;

        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.key.fill(0);
    }
}

/// Derives the run key with the default Argon2id parameters.
pub fn derive_key(password: &str) -> Result<EncryptionKey> {
    EncryptionKey::derive(password, &KdfParams::default())
}

/// Deterministic authenticated encryption of single blocks.
///
/// Each block is bound to its domain, its position and whether it is the
/// final block, so blocks cannot be reordered, dropped or moved between
/// objects without failing authentication.
pub struct BlockCipher {
    siv: Aes256Siv,
}

impl BlockCipher {
    pub fn new(key: &EncryptionKey) -> Result<Self> {
        let siv = Aes256Siv::new_from_slice(key.as_bytes())
            .map_err(|e| Error::InvalidInput(format!("invalid key length: {}", e)))?;
        Ok(Self { siv })
    }

    pub fn seal(&mut self, domain: &[u8], index: u64, last: bool, plaintext: &[u8]) -> Result<Vec<u8>> {
        let position = index.to_be_bytes();
        let flag = [u8::from(last)];
        let headers: [&[u8]; 3] = [domain, &position, &flag];

        self.siv
            .encrypt(headers, plaintext)
            .map_err(|e| Error::integrity(format!("block {}", index), format!("encryption failed: {}", e)))
    }

    pub fn open(&mut self, domain: &[u8], index: u64, last: bool, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(Error::integrity(
                format!("block {}", index),
                "ciphertext shorter than authentication tag",
            ));
        }

        let position = index.to_be_bytes();
        let flag = [u8::from(last)];
        let headers: [&[u8]; 3] = [domain, &position, &flag];

        self.siv.decrypt(headers, ciphertext).map_err(|_| {
            Error::integrity(
                format!("block {}", index),
                "authentication failed (tampered data or wrong password)",
            )
        })
    }
}

#[cfg(test)]
pub(crate) fn test_key(password: &str) -> EncryptionKey {
    let params = KdfParams {
        memory_kib: 256,
        iterations: 1,
        parallelism: 1,
    };
    EncryptionKey::derive(password, &params).unwrap()
}
