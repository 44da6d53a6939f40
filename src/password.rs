use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::error::{StoreError, StoreResult};

pub fn hash_password(password: &str) -> StoreResult<String> {
    if password.is_empty() {
        return Err(StoreError::invalid("password must not be empty"));
    }
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| StoreError::invalid(format!("failed to hash password: {err}")))?
        .to_string())
}

pub fn verify_password(password: &str, password_hash: &str) -> StoreResult<bool> {
    let parsed_hash = PasswordHash::new(password_hash)
        .map_err(|err| StoreError::invalid(format!("malformed password hash: {err}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_verify_only_their_password() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash).unwrap());
        assert!(!verify_password("battery staple", &hash).unwrap());
    }

    #[test]
    fn malformed_hashes_are_errors() {
        assert!(verify_password("x", "not-a-hash").is_err());
        assert!(hash_password("").is_err());
    }
}
