//! Password hashing, used by the `UserStore`-backed registerer. The original source
//! hashes with bcrypt; argon2 is adopted instead as the current ecosystem-standard
//! choice (see DESIGN.md Open Question — neither appears in the retrieved corpus).

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::error::FabricError;

pub fn hash_password(password: &str) -> Result<String, FabricError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| FabricError::Internal(format!("hashing password: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, FabricError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| FabricError::Internal(format!("parsing stored password hash: {e}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
