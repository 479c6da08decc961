// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-rest encryption and hashing helpers.
//!
//! [`AesGcmEncryptor`] produces `base64(nonce || ciphertext)` with a fresh
//! 96-bit nonce per call. Key material is wiped on drop.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CoreError;

const NONCE_LEN: usize = 12;

/// Symmetric encryption of secrets.
pub trait Encryptor: Send + Sync {
    /// Encrypts `plaintext` into an opaque printable string.
    fn encrypt(&self, plaintext: &str) -> Result<String, CoreError>;
    /// Reverses [`Encryptor::encrypt`].
    fn decrypt(&self, ciphertext: &str) -> Result<String, CoreError>;
}

/// AES-256-GCM encryptor.
pub struct AesGcmEncryptor {
    key: Zeroizing<[u8; 32]>,
}

impl AesGcmEncryptor {
    /// Builds an encryptor from exactly 32 key bytes.
    pub fn new(key: &[u8]) -> Result<Self, CoreError> {
        let bytes: [u8; 32] = key
            .try_into()
            .map_err(|_| CoreError::Crypto(format!("key must be 32 bytes, got {}", key.len())))?;
        Ok(Self {
            key: Zeroizing::new(bytes),
        })
    }

    /// Accepts a base64-encoded 32-byte key, or a raw 32-character key.
    pub fn from_key_string(key: &str) -> Result<Self, CoreError> {
        let key = key.trim();
        if let Ok(decoded) = STANDARD.decode(key) {
            if decoded.len() == 32 {
                return Self::new(&decoded);
            }
        }
        Self::new(key.as_bytes())
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_slice()))
    }
}

impl std::fmt::Debug for AesGcmEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmEncryptor").finish_non_exhaustive()
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &str) -> Result<String, CoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| CoreError::Crypto(format!("encrypt: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CoreError> {
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| CoreError::Crypto(format!("decode: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(CoreError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| CoreError::Crypto(format!("decrypt: {e}")))?;
        String::from_utf8(plain).map_err(|e| CoreError::Crypto(format!("utf8: {e}")))
    }
}

/// Hex-encoded SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// `n` random bytes, hex-encoded (`2n` characters).
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// First four and last four characters, masked in between.
pub fn secret_preview(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}
