//! Per-user presence refresher (Event Server side). Grounded on
//! `original_source/pkg/eventserver/rtconn/heartbeat.go`'s `heartBeater`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fabric_common::{error::FabricError, model::PresenceRecord, UserId};
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{event, Level};

use crate::client::Client;

pub const CONNECTIONS_COLLECTION: &str = "user-connections";

pub fn connection_key(user_id: &UserId) -> String {
    format!("{CONNECTIONS_COLLECTION}:{user_id}")
}

struct Heart {
    stop: oneshot::Sender<()>,
}

/// Refreshes `user-connections:<UserID>` with a TTL while a user's stream is open.
/// At most one active refresher per `UserId` per process.
pub struct HeartBeater {
    store: Arc<dyn Client>,
    server_id: fabric_common::ServerId,
    ttl: Duration,
    interval: Duration,
    hearts: Mutex<HashMap<UserId, Heart>>,
}

impl HeartBeater {
    pub fn new(
        store: Arc<dyn Client>,
        server_id: fabric_common::ServerId,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            server_id,
            ttl,
            interval,
            hearts: Mutex::new(HashMap::new()),
        }
    }

    /// Begins a per-user refresher. Fails with `AlreadyRunning` if one is already
    /// active for `user_id` without a prior `stop_for_user`.
    pub fn launch_for_user(&self, user_id: UserId) -> Result<(), FabricError> {
        let mut hearts = self.hearts.lock().expect("hearts lock");
        if hearts.contains_key(&user_id) {
            return Err(FabricError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        hearts.insert(user_id, Heart { stop: stop_tx });
        drop(hearts);

        let store = self.store.clone();
        let server_id = self.server_id.clone();
        let ttl = self.ttl;
        let interval = self.interval;

        tokio::spawn(async move {
            run_heartbeat(store, server_id, user_id, ttl, interval, stop_rx).await;
        });

        Ok(())
    }

    /// Cancels the refresher. The key is left to decay via TTL rather than being
    /// explicitly deleted, so a racing reconnect to a different server is not
    /// clobbered by this server's delete.
    pub fn stop_for_user(&self, user_id: UserId) -> Result<(), FabricError> {
        let mut hearts = self.hearts.lock().expect("hearts lock");
        match hearts.remove(&user_id) {
            Some(heart) => {
                let _ = heart.stop.send(());
                Ok(())
            }
            None => Err(FabricError::NotRunning),
        }
    }

    pub fn close(&self) {
        let mut hearts = self.hearts.lock().expect("hearts lock");
        for (_, heart) in hearts.drain() {
            let _ = heart.stop.send(());
        }
    }
}

async fn run_heartbeat(
    store: Arc<dyn Client>,
    server_id: fabric_common::ServerId,
    user_id: UserId,
    ttl: Duration,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let key = connection_key(&user_id);
    let record = PresenceRecord {
        server_id: server_id.clone(),
    };
    let value = match serde_json::to_string(&record) {
        Ok(v) => v,
        Err(err) => {
            event!(Level::ERROR, %err, "failed to encode presence record");
            return;
        }
    };

    loop {
        if let Err(err) = store.set_ex(&key, &value, ttl).await {
            event!(Level::WARN, %err, %key, "heartbeat refresh failed");
        }

        let jitter = rand::thread_rng().gen_range(0..=(interval.as_millis() as u64 / 10).max(1));
        let wait = interval + Duration::from_millis(jitter);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut stop => {
                event!(Level::DEBUG, %key, "heartbeat stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockRedisClient;

    fn heartbeater() -> HeartBeater {
        HeartBeater::new(
            Arc::new(MockRedisClient::new()),
            fabric_common::ServerId("s1".into()),
            Duration::from_secs(20),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn double_launch_without_stop_fails() {
        let hb = heartbeater();
        let user = UserId::new();

        hb.launch_for_user(user).unwrap();
        let err = hb.launch_for_user(user).unwrap_err();
        assert!(matches!(err, FabricError::AlreadyRunning));

        hb.stop_for_user(user).unwrap();
    }

    #[tokio::test]
    async fn stop_without_launch_fails() {
        let hb = heartbeater();
        let err = hb.stop_for_user(UserId::new()).unwrap_err();
        assert!(matches!(err, FabricError::NotRunning));
    }

    #[tokio::test]
    async fn relaunch_after_stop_succeeds() {
        let hb = heartbeater();
        let user = UserId::new();

        hb.launch_for_user(user).unwrap();
        hb.stop_for_user(user).unwrap();
        hb.launch_for_user(user).unwrap();
    }
}
