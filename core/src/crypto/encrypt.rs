// Per-message encryption: shared session key + ChaCha20-Poly1305
//
// Flow:
// 1. Initiator generates a random 256-bit session key per peer
// 2. Key travels hex-encoded inside the session offer
// 3. Every message: fresh random 96-bit nonce, AEAD-encrypt the plaintext
// 4. Output: (ciphertext || tag, nonce)
//
// Recipient reverses with the imported key. A wrong key, a tampered
// ciphertext or a malformed nonce all surface as DecryptionFailed.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session key length in bytes
pub const KEY_LEN: usize = 32;

/// Nonce ("iv") length in bytes
pub const NONCE_LEN: usize = 12;

/// Cryptography errors.
///
/// All of these are recoverable: they fail one message or one key import,
/// never the channel carrying them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("No session key for this peer")]
    MissingKey,
    #[error("Key import failed: {0}")]
    KeyImport(String),
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Fingerprint mismatch: message content does not match its hash")]
    FingerprintMismatch,
}

/// A symmetric session key shared by the two ends of one peer session
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let key = Self(bytes);
        bytes.zeroize();
        key
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Import a hex-encoded key as carried in an offer's `encryptionKey`
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let mut raw = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::KeyImport(format!("invalid hex: {}", e)))?;

        if raw.len() != KEY_LEN {
            let len = raw.len();
            raw.zeroize();
            return Err(CryptoError::KeyImport(format!(
                "expected {} bytes, got {}",
                KEY_LEN, len
            )));
        }

        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self(bytes))
    }

    /// Export for transmission inside an offer
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        // Branch-free comparison.
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for SessionKey {}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// Returns the ciphertext (with the authentication tag appended) and the
/// nonce that must accompany it.
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CryptoError> {
    let mut iv = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok((ciphertext, iv))
}

/// Decrypt a ciphertext produced by [`encrypt`].
///
/// `key` is optional because a session may legitimately have none (the
/// offer carried no key or its import failed); that case fails the same way
/// a wrong key does.
pub fn decrypt(ciphertext: &[u8], iv: &[u8], key: Option<&SessionKey>) -> Result<Vec<u8>, CryptoError> {
    let key = key.ok_or_else(|| CryptoError::DecryptionFailed("no session key".to_string()))?;

    if iv.len() != NONCE_LEN {
        return Err(CryptoError::DecryptionFailed(format!(
            "invalid nonce length {}",
            iv.len()
        )));
    }

    key.cipher()
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| {
            CryptoError::DecryptionFailed(
                "invalid ciphertext, wrong key, or tampered payload".to_string(),
            )
        })
}
