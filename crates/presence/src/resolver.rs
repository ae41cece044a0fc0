//! Resolves which Event Server currently holds a user's stream (Gateway side).
//! Grounded on `original_source/pkg/eventserver/rtconn/server_resolver.go`'s
//! `serverResolver`.

use std::sync::Arc;

use fabric_common::{error::FabricError, model::PresenceRecord, ServerId, UserId};

use crate::client::Client;
use crate::heartbeat::connection_key;

pub struct ServerResolver {
    store: Arc<dyn Client>,
}

impl ServerResolver {
    pub fn new(store: Arc<dyn Client>) -> Self {
        Self { store }
    }

    /// Looks up `user-connections:<UserID>`. Absence (expired or never written) is
    /// `NotConnected`, not an internal error.
    pub async fn resolve(&self, user_id: UserId) -> Result<ServerId, FabricError> {
        let key = connection_key(&user_id);

        let raw = self
            .store
            .get(&key)
            .await
            .map_err(|e| FabricError::Unavailable(format!("presence store get: {e}")))?
            .ok_or(FabricError::NotConnected)?;

        let record: PresenceRecord = serde_json::from_str(&raw)
            .map_err(|e| FabricError::Internal(format!("decoding presence record: {e}")))?;

        Ok(record.server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockRedisClient;
    use std::time::Duration;

    #[tokio::test]
    async fn resolve_missing_key_is_not_connected() {
        let resolver = ServerResolver::new(Arc::new(MockRedisClient::new()));
        let err = resolver.resolve(UserId::new()).await.unwrap_err();
        assert!(matches!(err, FabricError::NotConnected));
    }

    #[tokio::test]
    async fn resolve_returns_the_written_server_id() {
        let store = Arc::new(MockRedisClient::new());
        let user_id = UserId::new();
        let record = PresenceRecord {
            server_id: ServerId("s1".into()),
        };

        store
            .set_ex(
                &connection_key(&user_id),
                &serde_json::to_string(&record).unwrap(),
                Duration::from_secs(20),
            )
            .await
            .unwrap();

        let resolver = ServerResolver::new(store);
        let server_id = resolver.resolve(user_id).await.unwrap();
        assert_eq!(server_id, ServerId("s1".into()));
    }
}
