use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Opaque key handed out for user and browser sessions. Uuid v4, so keys
/// are unguessable and never sequential.
pub fn generate_session_key() -> String {
    Uuid::new_v4().to_string()
}

/// SHA-256 hex digest of a login passphrase. Only digests are stored;
/// plaintext passphrases never leave the login handler.
pub fn hash_passphrase(passphrase: &str) -> String {
    format!("{:x}", Sha256::digest(passphrase.as_bytes()))
}

/// Checks a candidate passphrase against a stored digest.
pub fn verify_passphrase(candidate: &str, stored_hash: &str) -> bool {
    hash_passphrase(candidate) == stored_hash
}
