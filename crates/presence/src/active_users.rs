//! Gateway-side active-user tracking backing `/heartbeat` and `/active-users`.
//! Supplemented from `original_source/gateway/services/active_users.go`'s
//! `tracker`; not a named [MODULE] in the distilled spec, specified here so it is
//! not left informally described (SPEC_FULL.md §4.4.3).

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fabric_common::{error::FabricError, model::ActiveUser, UserId};

use crate::client::Client;

pub const ACTIVE_USERS_COLLECTION: &str = "active_users";

pub fn active_user_key(user_id: &UserId) -> String {
    format!("{ACTIVE_USERS_COLLECTION}:{user_id}")
}

pub struct ActiveUserTracker {
    store: Arc<dyn Client>,
    ttl: Duration,
}

impl ActiveUserTracker {
    pub fn new(store: Arc<dyn Client>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn heart_beat(&self, user_id: UserId, username: String) -> Result<(), FabricError> {
        let record = ActiveUser {
            id: user_id,
            username,
            last_seen: now_rfc3339_ish(),
        };

        let value = serde_json::to_string(&record)
            .map_err(|e| FabricError::Internal(format!("encoding active user: {e}")))?;

        self.store
            .set_ex(&active_user_key(&user_id), &value, self.ttl)
            .await
            .map_err(|e| FabricError::Unavailable(format!("presence store set: {e}")))
    }

    /// Lists every active user. Entries past their TTL are absent from the store and
    /// are therefore excluded automatically.
    pub async fn active_users(&self) -> Result<Vec<ActiveUser>, FabricError> {
        let keys = self
            .store
            .keys(&format!("{ACTIVE_USERS_COLLECTION}:"))
            .await
            .map_err(|e| FabricError::Unavailable(format!("presence store keys: {e}")))?;

        let mut users = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self
                .store
                .get(&key)
                .await
                .map_err(|e| FabricError::Unavailable(format!("presence store get: {e}")))?
            else {
                continue;
            };

            if let Ok(user) = serde_json::from_str::<ActiveUser>(&raw) {
                users.push(user);
            }
        }

        Ok(users)
    }
}

fn now_rfc3339_ish() -> String {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{}", now.as_secs(), now.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockRedisClient;

    #[tokio::test]
    async fn heartbeat_then_active_users_round_trips() {
        let tracker = ActiveUserTracker::new(Arc::new(MockRedisClient::new()), Duration::from_secs(30));
        let user_id = UserId::new();

        tracker.heart_beat(user_id, "user_1".into()).await.unwrap();

        let users = tracker.active_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, "user_1");
        assert_eq!(users[0].id, user_id);
    }
}
