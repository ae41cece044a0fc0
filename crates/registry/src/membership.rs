//! Announces this Event Server in the registry and keeps its record fresh.
//! Grounded on `SG60-hello-rust/src/cluster_management.rs`'s
//! `record_node_membership`/`initialise_lease_and_node_membership` (generalized from
//! worker-node records to `ServerInfo` records) and
//! `original_source/pkg/eventserver/membership/manager.go`'s
//! `JoinCluster`/`refreshInfoLoop`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fabric_common::{error::FabricError, model::ServerInfo, ServerId};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::lease::LeasedRegistryClient;

pub const MEMBERSHIP_PREFIX: &str = "/event_servers/";

pub fn membership_key(server_id: &ServerId) -> String {
    format!("{MEMBERSHIP_PREFIX}{server_id}")
}

pub struct MembershipManager {
    lease_client: Arc<LeasedRegistryClient>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipManager {
    pub fn new(lease_client: Arc<LeasedRegistryClient>) -> Self {
        Self {
            lease_client,
            refresh_task: Mutex::new(None),
        }
    }

    /// Acquires the lease, writes the initial record, and starts a refresher that
    /// re-Puts every `refresh_interval` until lease loss or `leave_cluster`. Returns
    /// only after the first Put has completed, so callers may advertise readiness
    /// knowing the record is visible to watchers.
    pub async fn join_cluster(
        &self,
        server_id: ServerId,
        info: ServerInfo,
        lease_ttl: Duration,
        refresh_interval: Duration,
    ) -> Result<(), FabricError> {
        if server_id.0.is_empty() {
            return Err(FabricError::InvalidConfig(
                "serverID must not be empty".into(),
            ));
        }

        self.lease_client.start(lease_ttl.as_secs() as i64).await?;

        let key = membership_key(&server_id);
        put_record(&self.lease_client, &key, &info).await?;

        let lease_client = self.lease_client.clone();
        let handle = tokio::spawn(refresh_loop(lease_client, key, info, refresh_interval));
        *self.refresh_task.lock().expect("refresh task lock") = Some(handle);

        Ok(())
    }

    /// Resolves when this server's membership lease is lost. The owning binary should
    /// treat this as fatal and initiate process shutdown (original spec §7).
    pub async fn membership_lost(&self) {
        self.lease_client.lease_lost().await;
    }

    /// Stops the refresher and closes the lease, bounded by `timeout`.
    pub async fn leave_cluster(&self, timeout: Duration) -> Result<(), FabricError> {
        if let Some(handle) = self.refresh_task.lock().expect("refresh task lock").take() {
            handle.abort();
        }
        self.lease_client.close(timeout).await
    }
}

async fn put_record(
    lease_client: &LeasedRegistryClient,
    key: &str,
    info: &ServerInfo,
) -> Result<(), FabricError> {
    let value = serde_json::to_vec(info)
        .map_err(|e| FabricError::Internal(format!("encoding ServerInfo: {e}")))?;
    lease_client.put(key.as_bytes().to_vec(), value).await
}

async fn refresh_loop(
    lease_client: Arc<LeasedRegistryClient>,
    key: String,
    info: ServerInfo,
    refresh_interval: Duration,
) {
    let mut interval = tokio::time::interval(refresh_interval);
    interval.tick().await; // first tick fires immediately; the initial Put already happened

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = put_record(&lease_client, &key, &info).await {
                    event!(Level::WARN, %err, key, "membership refresh failed");
                }
            }
            _ = lease_client.lease_lost() => {
                event!(Level::INFO, key, "membership lease lost, stopping refresher");
                return;
            }
        }
    }
}
