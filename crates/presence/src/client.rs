//! TTL'd in-memory key-value store abstraction. Grounded on
//! `PostHog-posthog/rust/common/redis`'s `Client` trait / `RedisClient` /
//! `MockRedisClient`, trimmed to the subset the presence fabric needs: set-with-TTL,
//! get, and listing keys under a collection prefix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};

#[derive(Debug, thiserror::Error)]
pub enum CustomRedisError {
    #[error("key not found")]
    NotFound,
    #[error("redis error: {0}")]
    Other(#[from] redis::RedisError),
    #[error("presence store call timed out")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for CustomRedisError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CustomRedisError::Timeout
    }
}

const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 200;

/// A key-value store exposing TTL'd writes and prefix listing. Implemented by
/// `RedisClient` for production and `MockRedisClient` for unit tests, following the
/// same trait-over-config-variant shape as `fabric_common::auth`.
#[async_trait]
pub trait Client: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CustomRedisError>;
    async fn get(&self, key: &str) -> Result<Option<String>, CustomRedisError>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CustomRedisError>;
}

#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    response_timeout: Duration,
}

impl RedisClient {
    pub async fn connect(addr: &str) -> Result<Self, CustomRedisError> {
        let response_timeout = std::env::var("REDIS_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS));

        let client = redis::Client::open(addr)?;
        let connection = client.get_connection_manager().await?;

        Ok(Self {
            connection,
            response_timeout,
        })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        tokio::time::timeout(
            self.response_timeout,
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()),
        )
        .await??;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let value: Option<String> =
            tokio::time::timeout(self.response_timeout, conn.get(key)).await??;
        Ok(value)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> =
            tokio::time::timeout(self.response_timeout, conn.keys(pattern)).await??;
        Ok(keys)
    }
}

/// Records of a call made against a `MockRedisClient`, for assertions in unit tests.
#[derive(Debug, Clone)]
pub enum MockRedisCall {
    SetEx { key: String, value: String },
    Get { key: String },
    Keys { prefix: String },
}

/// Test double mirroring `PostHog-posthog/rust/common/redis/src/mock.rs`'s
/// `MockRedisClient`: an in-memory map with TTL modeled as wall-clock expiry, plus a
/// call log for assertions.
#[derive(Default, Clone)]
pub struct MockRedisClient {
    entries: Arc<Mutex<HashMap<String, (String, std::time::Instant)>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MockRedisCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CustomRedisError> {
        self.calls.lock().expect("calls lock").push(MockRedisCall::SetEx {
            key: key.to_owned(),
            value: value.to_owned(),
        });
        self.entries.lock().expect("entries lock").insert(
            key.to_owned(),
            (value.to_owned(), std::time::Instant::now() + ttl),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CustomRedisError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(MockRedisCall::Get { key: key.to_owned() });

        let mut entries = self.entries.lock().expect("entries lock");
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > std::time::Instant::now() => {
                Ok(Some(value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CustomRedisError> {
        self.calls.lock().expect("calls lock").push(MockRedisCall::Keys {
            prefix: prefix.to_owned(),
        });

        let now = std::time::Instant::now();
        Ok(self
            .entries
            .lock()
            .expect("entries lock")
            .iter()
            .filter(|(key, (_, expires_at))| key.starts_with(prefix) && *expires_at > now)
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_client_round_trips_a_value() {
        let client = MockRedisClient::new();
        client
            .set_ex("user-connections:u1", "{\"serverID\":\"s1\"}", Duration::from_secs(20))
            .await
            .unwrap();

        let value = client.get("user-connections:u1").await.unwrap();
        assert_eq!(value.as_deref(), Some("{\"serverID\":\"s1\"}"));
    }

    #[tokio::test]
    async fn mock_client_lists_keys_by_prefix() {
        let client = MockRedisClient::new();
        client.set_ex("active_users:a", "1", Duration::from_secs(30)).await.unwrap();
        client.set_ex("active_users:b", "2", Duration::from_secs(30)).await.unwrap();
        client.set_ex("user-connections:c", "3", Duration::from_secs(20)).await.unwrap();

        let mut keys = client.keys("active_users:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["active_users:a", "active_users:b"]);
    }
}
