//! Ships a message from the Gateway to the Event Server owning the recipient.
//! Grounded on `original_source/pkg/eventserver/client/client.go`'s `httpClient`/
//! `Pool` and `original_source/gateway/services/event_relay.go`'s
//! `realTimeEventRelay`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fabric_common::{
    error::FabricError,
    model::{EventPayload, SendEventRequest},
    ServerId, UserId,
};
use presence::ServerResolver;
use registry::ResolveServer;
use tokio::sync::Mutex;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

/// Lazily creates and reuses one `reqwest::Client` per `ServerId`. Entries are cheap,
/// stateless handles in v1 (the teacher's own HTTP client crate, reused rather than
/// constructed fresh per call); `close` is a no-op kept for symmetry with the
/// original's `Pool` interface and to leave a seam for connection-pooled clients
/// later.
#[derive(Default)]
pub struct EventServerPool {
    clients: Mutex<HashMap<ServerId, reqwest::Client>>,
}

impl EventServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client_for(&self, server_id: &ServerId) -> reqwest::Client {
        let mut clients = self.clients.lock().await;
        clients
            .entry(server_id.clone())
            .or_insert_with(reqwest::Client::new)
            .clone()
    }

    pub async fn close(&self) {
        self.clients.lock().await.clear();
    }
}

pub struct EventRelay {
    resolver: Arc<ServerResolver>,
    registry: Arc<dyn ResolveServer>,
    pool: Arc<EventServerPool>,
}

impl EventRelay {
    pub fn new(
        resolver: Arc<ServerResolver>,
        registry: Arc<dyn ResolveServer>,
        pool: Arc<EventServerPool>,
    ) -> Self {
        Self {
            resolver,
            registry,
            pool,
        }
    }

    /// 1. Resolve which server owns `recipient_id`'s stream (`NotConnected` on miss).
    /// 2. Resolve that server's address in the membership registry (`ServerGone` if
    ///    it has since dropped out).
    /// 3. Obtain a pooled HTTP client and POST to its `/send-event`.
    /// 4. Non-2xx responses (including the translated `RecipientNotOnThisServer` the
    ///    owning server answers with when presence and membership TTLs race) fail
    ///    with `DeliveryFailed`.
    pub async fn forward(&self, recipient_id: UserId, payload: EventPayload) -> Result<(), FabricError> {
        let server_id = self.resolver.resolve(recipient_id).await?;

        let info = self
            .registry
            .resolve_server(&server_id)
            .await
            .ok_or(FabricError::ServerGone)?;

        let client = self.pool.client_for(&server_id).await;
        let url = format!("http://{}/send-event", info.http_address);

        let response = client
            .post(&url)
            .timeout(FORWARD_TIMEOUT)
            .json(&SendEventRequest {
                recipient_id,
                payload,
            })
            .send()
            .await
            .map_err(|_| FabricError::DeliveryFailed { status: 0 })?;

        if !response.status().is_success() {
            return Err(FabricError::DeliveryFailed {
                status: response.status().as_u16(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fabric_common::model::ServerInfo;
    use presence::{Client, MockRedisClient};

    struct StubRegistry(Option<ServerInfo>);

    #[async_trait]
    impl ResolveServer for StubRegistry {
        async fn resolve_server(&self, _server_id: &ServerId) -> Option<ServerInfo> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn forward_to_unresolved_recipient_is_not_connected() {
        let resolver = Arc::new(ServerResolver::new(Arc::new(MockRedisClient::new())));
        let registry: Arc<dyn ResolveServer> = Arc::new(StubRegistry(None));
        let relay = EventRelay::new(resolver, registry, Arc::new(EventServerPool::new()));

        let err = relay
            .forward(
                UserId::new(),
                EventPayload::DirectMessage {
                    sender_id: UserId::new(),
                    message: "hi".into(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FabricError::NotConnected));
    }

    #[tokio::test]
    async fn forward_when_registry_has_forgotten_the_server_is_server_gone() {
        let store = Arc::new(MockRedisClient::new());
        let recipient = UserId::new();
        let server_id = ServerId("s1".into());

        store
            .set_ex(
                &presence::heartbeat::connection_key(&recipient),
                &serde_json::to_string(&fabric_common::model::PresenceRecord {
                    server_id: server_id.clone(),
                })
                .unwrap(),
                Duration::from_secs(20),
            )
            .await
            .unwrap();

        let resolver = Arc::new(ServerResolver::new(store));
        let registry: Arc<dyn ResolveServer> = Arc::new(StubRegistry(None));
        let relay = EventRelay::new(resolver, registry, Arc::new(EventServerPool::new()));

        let err = relay
            .forward(
                recipient,
                EventPayload::DirectMessage {
                    sender_id: UserId::new(),
                    message: "hi".into(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FabricError::ServerGone));
    }
}
