// Message types — what parties actually say to each other

use crate::crypto::{self, CryptoError, SessionKey};
use serde::{Deserialize, Serialize};

/// The identifying fields of a message; exactly what the fingerprint covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFields {
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: String,
    /// Unix timestamp (milliseconds)
    pub timestamp: u64,
}

impl MessageFields {
    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(self)
    }
}

/// A plaintext application message.
///
/// This is what the sender creates and the receiver gets back after
/// decryption. The whole struct, hash included, is the encrypted plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (UUID v4, assigned by the sender)
    pub id: String,
    /// Sender address
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Text content
    pub content: String,
    /// Unix timestamp (milliseconds)
    pub timestamp: u64,
    /// Fingerprint of the five fields above
    pub hash: String,
}

impl Message {
    /// Create a new message stamped with a fresh id and the current time
    pub fn new(from: &str, to: &str, content: &str) -> Self {
        Self::from_fields(MessageFields {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            content: content.to_string(),
            timestamp: crate::now_millis(),
        })
    }

    /// Build a message from explicit fields, computing its hash
    pub fn from_fields(fields: MessageFields) -> Self {
        let hash = fields.fingerprint();
        let MessageFields {
            id,
            from,
            to,
            content,
            timestamp,
        } = fields;
        Self {
            id,
            from,
            to,
            content,
            timestamp,
            hash,
        }
    }

    pub fn fields(&self) -> MessageFields {
        MessageFields {
            id: self.id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Whether the carried hash matches a fresh fingerprint of the fields
    pub fn is_intact(&self) -> bool {
        self.fields().fingerprint() == self.hash
    }

    /// Encrypt this message for the wire
    pub fn seal(&self, key: &SessionKey) -> Result<SealedMessage, CryptoError> {
        let plaintext =
            serde_json::to_vec(self).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let (ciphertext, iv) = crypto::encrypt(&plaintext, key)?;

        Ok(SealedMessage {
            encrypted: hex::encode(ciphertext),
            iv: hex::encode(iv),
            hash: self.hash.clone(),
        })
    }
}

/// An encrypted message as it travels, over the direct channel or as the
/// payload of a relay `message` frame.
///
/// `hash` rides in the clear so the receiver (or anyone else holding the
/// plaintext) can check it without trusting the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    /// Hex-encoded ciphertext
    pub encrypted: String,
    /// Hex-encoded nonce
    pub iv: String,
    /// Hex-encoded fingerprint
    pub hash: String,
}

impl SealedMessage {
    /// Decrypt and check integrity.
    ///
    /// Fails if the key is absent or wrong, if either hex field is
    /// malformed, or if the decrypted message does not fingerprint to the
    /// outer hash.
    pub fn open(&self, key: Option<&SessionKey>) -> Result<Message, CryptoError> {
        let ciphertext = hex::decode(&self.encrypted)
            .map_err(|e| CryptoError::DecryptionFailed(format!("malformed ciphertext: {}", e)))?;
        let iv = hex::decode(&self.iv)
            .map_err(|e| CryptoError::DecryptionFailed(format!("malformed iv: {}", e)))?;

        let plaintext = crypto::decrypt(&ciphertext, &iv, key)?;
        let message: Message = serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("malformed plaintext: {}", e)))?;

        if message.hash != self.hash || !message.is_intact() {
            return Err(CryptoError::FingerprintMismatch);
        }
        Ok(message)
    }
}
