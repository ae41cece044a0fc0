//! Maintains a live, eventually-consistent view of all Event Servers and answers
//! `Resolve`/`SelectServerForConnection`. Grounded on
//! `original_source/pkg/eventserver/membership/registry.go`'s `ServerRegistry`
//! (snapshot+watch, `watchForUpdates`), reusing
//! `SG60-hello-rust/src/etcd.rs`'s `calculate_prefix_range_end` helper, and on the
//! Watch bidi-streaming shape demonstrated in
//! `bchess-k8s-1m/mem_etcd/src/watch_service.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fabric_common::{error::FabricError, model::ServerInfo, ServerId};
use fabric_proto::etcdserverpb::{
    kv_client, mvccpb, watch_client, watch_request, RangeRequest, WatchCreateRequest,
    WatchRequest,
};
use rand::seq::IteratorRandom;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{event, Level};
use tracing_utils::GrpcInterceptor;

use crate::membership::MEMBERSHIP_PREFIX;

type InterceptedService = tonic::codegen::InterceptedService<Channel, GrpcInterceptor>;
type KvClient = kv_client::KvClient<InterceptedService>;
type WatchClient = watch_client::WatchClient<InterceptedService>;

/// Narrow seam `EventRelay` depends on, so its forwarding logic can be unit tested
/// against a stand-in without a live KV-store connection.
#[async_trait]
pub trait ResolveServer: Send + Sync {
    async fn resolve_server(&self, server_id: &ServerId) -> Option<ServerInfo>;
}

#[async_trait]
impl ResolveServer for ServerRegistry {
    async fn resolve_server(&self, server_id: &ServerId) -> Option<ServerInfo> {
        self.resolve(server_id).await
    }
}

pub struct ServerRegistry {
    kv: KvClient,
    watch: WatchClient,
    servers: Arc<RwLock<HashMap<ServerId, ServerInfo>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerRegistry {
    pub async fn connect(endpoint: String) -> Result<Self, FabricError> {
        let channel = Endpoint::from_shared(endpoint)
            .map_err(|e| FabricError::InvalidConfig(format!("invalid KV store endpoint: {e}")))?
            .connect()
            .await
            .map_err(|e| FabricError::Unavailable(format!("connecting to KV store: {e}")))?;

        Ok(Self {
            kv: kv_client::KvClient::with_interceptor(channel.clone(), GrpcInterceptor),
            watch: watch_client::WatchClient::with_interceptor(channel, GrpcInterceptor),
            servers: Arc::new(RwLock::new(HashMap::new())),
            watch_task: Mutex::new(None),
        })
    }

    /// Range-Gets the `/event_servers/` prefix into the in-memory map, then opens a
    /// Watch starting at `header.revision + 1` so no event at the snapshot boundary is
    /// missed or duplicated.
    pub async fn start(&self) -> Result<(), FabricError> {
        let range_end = calculate_prefix_range_end(MEMBERSHIP_PREFIX);

        let response = self
            .kv
            .clone()
            .range(tonic::Request::new(RangeRequest {
                key: MEMBERSHIP_PREFIX.as_bytes().to_vec(),
                range_end: range_end.into_bytes(),
                limit: 0,
                revision: 0,
            }))
            .await
            .map_err(|e| FabricError::Unavailable(format!("initial registry fetch: {e}")))?
            .into_inner();

        let mut map = HashMap::new();
        for kv in &response.kvs {
            if let Ok(info) = serde_json::from_slice::<ServerInfo>(&kv.value) {
                map.insert(info.id.clone(), info);
            }
        }
        *self.servers.write().await = map;

        let start_revision = response
            .header
            .map(|h| h.revision + 1)
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel::<WatchRequest>(1);
        tx.send(WatchRequest {
            request_union: Some(watch_request::RequestUnion::CreateRequest(
                WatchCreateRequest {
                    key: MEMBERSHIP_PREFIX.as_bytes().to_vec(),
                    range_end: range_end.clone().into_bytes(),
                    start_revision,
                    prev_kv: false,
                },
            )),
        })
        .await
        .map_err(|_| FabricError::Internal("watch request channel closed".into()))?;

        let mut watch_stream = self
            .watch
            .clone()
            .watch(ReceiverStream::new(rx))
            .await
            .map_err(|e| FabricError::Unavailable(format!("opening registry watch: {e}")))?
            .into_inner();

        // `tx` must stay alive for the lifetime of the watch; move it into the task.
        let servers = self.servers.clone();
        let handle = tokio::spawn(async move {
            let _keep_request_side_alive = tx;
            loop {
                match watch_stream.message().await {
                    Ok(Some(response)) => {
                        apply_watch_events(&servers, response.events).await;
                    }
                    Ok(None) => {
                        event!(Level::WARN, "registry watch stream ended");
                        return;
                    }
                    Err(err) => {
                        event!(Level::ERROR, %err, "registry watch errored, no reconnect in v1");
                        return;
                    }
                }
            }
        });

        *self.watch_task.lock().expect("watch task lock") = Some(handle);

        Ok(())
    }

    pub async fn resolve(&self, server_id: &ServerId) -> Option<ServerInfo> {
        self.servers.read().await.get(server_id).cloned()
    }

    /// Picks one live server uniformly at random. The contract only promises
    /// "across all live servers" — not a specific distribution.
    pub async fn select_server_for_connection(&self) -> Result<ServerInfo, FabricError> {
        let servers = self.servers.read().await;
        servers
            .values()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| FabricError::Unavailable("no servers available".into()))
    }

    pub fn close(&self) {
        if let Some(handle) = self.watch_task.lock().expect("watch task lock").take() {
            handle.abort();
        }
    }
}

async fn apply_watch_events(
    servers: &RwLock<HashMap<ServerId, ServerInfo>>,
    events: Vec<mvccpb::Event>,
) {
    let mut guard = servers.write().await;
    for evt in events {
        let Some(kv) = evt.kv else { continue };

        match evt.r#type {
            0 => {
                // Put
                if let Ok(info) = serde_json::from_slice::<ServerInfo>(&kv.value) {
                    guard.insert(info.id.clone(), info);
                }
            }
            _ => {
                // Delete: strip the prefix to recover the ServerID.
                if let Ok(key) = String::from_utf8(kv.key) {
                    if let Some(id) = key.strip_prefix(MEMBERSHIP_PREFIX) {
                        guard.remove(&ServerId(id.to_owned()));
                    }
                }
            }
        }
    }
}

/// Calculates the correct `range_end` for a prefix query: the prefix with its last
/// byte incremented.
pub fn calculate_prefix_range_end(prefix: &str) -> String {
    let mut calculated = prefix.to_owned();
    let last_char = calculated.pop().expect("prefix must not be empty");
    let incremented = last_char as u8 + 1;
    calculated.push(incremented.into());
    calculated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::membership_key;

    #[test]
    fn prefix_range_end_increments_last_byte() {
        assert_eq!(calculate_prefix_range_end("/event_servers/"), "/event_servers0");
    }

    fn server_info(id: &str) -> ServerInfo {
        ServerInfo {
            id: ServerId(id.to_owned()),
            grpc_address: format!("{id}:9000"),
            http_address: format!("{id}:8000"),
        }
    }

    fn put_event(info: &ServerInfo) -> mvccpb::Event {
        mvccpb::Event {
            r#type: 0,
            kv: Some(mvccpb::KeyValue {
                key: membership_key(&info.id).into_bytes(),
                value: serde_json::to_vec(info).unwrap(),
                ..Default::default()
            }),
            prev_kv: None,
        }
    }

    fn delete_event(id: &ServerId) -> mvccpb::Event {
        mvccpb::Event {
            r#type: 1,
            kv: Some(mvccpb::KeyValue {
                key: membership_key(id).into_bytes(),
                ..Default::default()
            }),
            prev_kv: None,
        }
    }

    #[tokio::test]
    async fn put_event_upserts_the_map() {
        let map = RwLock::new(HashMap::new());
        let info = server_info("s1");

        apply_watch_events(&map, vec![put_event(&info)]).await;

        assert_eq!(map.read().await.get(&info.id), Some(&info));
    }

    #[tokio::test]
    async fn delete_event_removes_by_trailing_key_segment() {
        let info = server_info("s1");
        let map = RwLock::new(HashMap::from([(info.id.clone(), info.clone())]));

        apply_watch_events(&map, vec![delete_event(&info.id)]).await;

        assert!(map.read().await.get(&info.id).is_none());
    }
}
