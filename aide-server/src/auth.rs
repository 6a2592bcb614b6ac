//! Password hashing for /register and /login.
//!
//! Argon2id with per-hash random salts, stored as PHC strings. Verification
//! failures and malformed stored hashes both come back as "no match" so the
//! login path cannot distinguish them.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        tracing::warn!("Stored password hash is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_then_verify_roundtrip() {
        let hash = hash_password("s3creta").unwrap();
        assert!(verify_password("s3creta", &hash));
    }

    #[test]
    fn test_wrong_password_fails() {
        let hash = hash_password("s3creta").unwrap();
        assert!(!verify_password("otra", &hash));
    }

    #[test]
    fn test_malformed_stored_hash_fails_closed() {
        assert!(!verify_password("s3creta", "not-a-phc-string"));
    }

    #[test]
    fn test_hashes_are_salted() {
        let a = hash_password("misma").unwrap();
        let b = hash_password("misma").unwrap();
        assert_ne!(a, b, "Two hashes of the same password must differ");
    }
}
