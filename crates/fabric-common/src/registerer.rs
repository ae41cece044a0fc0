//! Combines the `UserStore` and `TokenIssuer` collaborators into the `/register` +
//! `/login` flow, grounded on `original_source/pkg/auth/registerer.go`'s
//! `RegistererImpl` (which used bcrypt; this uses argon2, see `password.rs`).

use std::sync::Arc;

use crate::{
    auth::TokenIssuer,
    error::FabricError,
    model::Principal,
    password::{hash_password, verify_password},
    user_store::UserStore,
};

pub struct Registerer {
    users: Arc<dyn UserStore>,
    token_issuer: Arc<dyn TokenIssuer>,
}

impl Registerer {
    pub fn new(users: Arc<dyn UserStore>, token_issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            users,
            token_issuer,
        }
    }

    pub fn register(&self, username: &str, password: &str) -> Result<(), FabricError> {
        if username.is_empty() || password.is_empty() {
            return Err(FabricError::BadRequest(
                "username and password are required".into(),
            ));
        }

        let hash = hash_password(password)?;
        self.users.create(username, &hash)?;
        Ok(())
    }

    pub fn login(&self, username: &str, password: &str) -> Result<String, FabricError> {
        let stored = self
            .users
            .find_by_username(username)?
            .ok_or_else(|| FabricError::Unauthorized("invalid username or password".into()))?;

        if !verify_password(password, &stored.password_hash)? {
            return Err(FabricError::Unauthorized(
                "invalid username or password".into(),
            ));
        }

        let principal = Principal {
            user_id: stored.id,
            username: stored.username,
        };

        self.token_issuer.issue(&principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::AuthConfig, user_store::InMemoryUserStore};

    fn registerer() -> Registerer {
        let issuer = AuthConfig::Noop.build_issuer().unwrap();
        Registerer::new(Arc::new(InMemoryUserStore::new()), issuer)
    }

    #[test]
    fn register_then_login_succeeds() {
        let r = registerer();
        r.register("user_1", "hunter2").unwrap();
        let token = r.login("user_1", "hunter2").unwrap();
        assert!(!token.is_empty());
    }

    #[test]
    fn login_with_wrong_password_is_unauthorized() {
        let r = registerer();
        r.register("user_1", "hunter2").unwrap();
        let err = r.login("user_1", "wrong").unwrap_err();
        assert!(matches!(err, FabricError::Unauthorized(_)));
    }

    #[test]
    fn duplicate_registration_is_deterministic_error() {
        let r = registerer();
        r.register("user_1", "hunter2").unwrap();
        let err = r.register("user_1", "other").unwrap_err();
        assert!(matches!(err, FabricError::BadRequest(_)));
    }
}
