//! `/register` and `/login` backing store. The real persistence layer is explicitly
//! out of scope (original spec §1); this in-process store exists so the two HTTP
//! routes are not stubs. Not durable across restarts.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{error::FabricError, ids::UserId, model::StoredUser};

pub trait UserStore: Send + Sync {
    fn create(&self, username: &str, password_hash: &str) -> Result<UserId, FabricError>;
    fn find_by_username(&self, username: &str) -> Result<Option<StoredUser>, FabricError>;
}

#[derive(Default, Clone)]
pub struct InMemoryUserStore {
    users: Arc<RwLock<HashMap<String, StoredUser>>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for InMemoryUserStore {
    fn create(&self, username: &str, password_hash: &str) -> Result<UserId, FabricError> {
        let mut users = self
            .users
            .write()
            .map_err(|_| FabricError::Internal("user store lock poisoned".into()))?;

        if users.contains_key(username) {
            return Err(FabricError::BadRequest(format!(
                "username {username} already registered"
            )));
        }

        let id = UserId::new();
        users.insert(
            username.to_owned(),
            StoredUser {
                id,
                username: username.to_owned(),
                password_hash: password_hash.to_owned(),
            },
        );

        Ok(id)
    }

    fn find_by_username(&self, username: &str) -> Result<Option<StoredUser>, FabricError> {
        let users = self
            .users
            .read()
            .map_err(|_| FabricError::Internal("user store lock poisoned".into()))?;

        Ok(users.get(username).cloned())
    }
}

impl Clone for StoredUser {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            username: self.username.clone(),
            password_hash: self.password_hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_find_round_trips() {
        let store = InMemoryUserStore::new();
        let id = store.create("user_1", "hash").unwrap();

        let found = store.find_by_username("user_1").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.username, "user_1");
    }

    #[test]
    fn duplicate_registration_is_deterministic_error() {
        let store = InMemoryUserStore::new();
        store.create("user_1", "hash").unwrap();

        let err = store.create("user_1", "other-hash").unwrap_err();
        assert!(matches!(err, FabricError::BadRequest(_)));
    }

    #[test]
    fn unknown_username_is_none() {
        let store = InMemoryUserStore::new();
        assert!(store.find_by_username("nobody").unwrap().is_none());
    }
}
