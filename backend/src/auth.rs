//! Password digests, salts and random tokens.
//!
//! Passwords are hashed twice: the client sends `digest_password(pwd)` and
//! never the plaintext; the server stores `salted_digest(digest, salt)`.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Minimum length of a peer id.
pub const MIN_ID_LEN: usize = 10;

/// Minimum length of a client-side password digest (hex).
pub const MIN_DIGEST_LEN: usize = 32;

/// Minimum length of a salt.
pub const MIN_SALT_LEN: usize = 4;

/// Length of generated salts.
pub const SALT_LEN: usize = 8;

/// Length of request sequence tokens.
pub const SEQUENCE_LEN: usize = 32;

/// Client-side digest of a plaintext password (lowercase hex SHA-256).
pub fn digest_password(pwd: &str) -> String {
    base16ct::lower::encode_string(&Sha256::digest(pwd.as_bytes()))
}

/// Server-side re-hash of a client digest with a salt.
pub fn salted_digest(pwd_digest: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pwd_digest.as_bytes());
    hasher.update(b":");
    hasher.update(salt.as_bytes());
    base16ct::lower::encode_string(&hasher.finalize())
}

/// Check a client digest against a stored salted digest.
pub fn verify_digest(pwd_digest: &str, salt: &str, stored: &str) -> bool {
    salted_digest(pwd_digest, salt) == stored
}

/// Whether a digest/salt pair is long enough to be accepted.
pub fn is_valid_credential(pwd_digest: &str, salt: &str) -> bool {
    pwd_digest.len() >= MIN_DIGEST_LEN && salt.len() >= MIN_SALT_LEN
}

/// Random alphanumeric string of length `len`.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn generate_salt() -> String {
    random_string(SALT_LEN)
}

/// Random token identifying one in-flight request.
pub fn generate_sequence() -> String {
    random_string(SEQUENCE_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_hash_scheme() {
        let digest = digest_password("hunter2");
        assert_eq!(digest.len(), 64);
        assert!(digest.len() >= MIN_DIGEST_LEN);

        let stored = salted_digest(&digest, "S1S1");
        assert_ne!(stored, digest);
        assert!(verify_digest(&digest, "S1S1", &stored));
        assert!(!verify_digest(&digest_password("hunter3"), "S1S1", &stored));
        assert!(!verify_digest(&digest, "S2S2", &stored));
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(
            digest_password("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_credential_validation() {
        let digest = digest_password("pwd");
        assert!(is_valid_credential(&digest, "salt"));
        assert!(!is_valid_credential(&digest, "sal"));
        assert!(!is_valid_credential("short", "salt"));
    }

    #[test]
    fn test_generated_tokens() {
        let seq = generate_sequence();
        assert_eq!(seq.len(), SEQUENCE_LEN);
        assert!(seq.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(generate_salt().len(), SALT_LEN);
        assert_ne!(generate_sequence(), generate_sequence());
    }
}
