// Cryptography module — session keys, message encryption and fingerprints

pub mod encrypt;
pub mod fingerprint;

pub use encrypt::{decrypt, encrypt, CryptoError, SessionKey, KEY_LEN, NONCE_LEN};
pub use fingerprint::{canonical_form, fingerprint};
