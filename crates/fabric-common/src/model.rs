use serde::{Deserialize, Serialize};

use crate::ids::{ServerId, UserId};

/// Advertised identity and reachable addresses of a live Event Server. Stored as the
/// value of `/event_servers/<ServerID>`, lifetime-bound to the server's lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: ServerId,
    #[serde(rename = "grpcAddress")]
    pub grpc_address: String,
    #[serde(rename = "httpAddress")]
    pub http_address: String,
}

/// Authenticated identity carried per request, derived from a validated JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub username: String,
}

/// Value stored at `user-connections:<UserID>`: which server currently claims the
/// user's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    #[serde(rename = "serverID")]
    pub server_id: ServerId,
}

/// Value stored at `active_users:<UserID>`, refreshed by the Gateway's `/heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub id: UserId,
    pub username: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: String,
}

/// A user persisted by the `UserStore` collaborator: username plus password hash.
/// Not a durability guarantee — see `fabric_common::user_store`.
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
}

/// JSON wire representation of an event payload, kept independent of the gRPC
/// `Event` protobuf message so the `/send-event` HTTP edge isn't coupled to the wire
/// codec used for the Event Server's streaming RPC. `event-server` converts between
/// the two at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    DirectMessage {
        #[serde(rename = "senderId")]
        sender_id: UserId,
        message: String,
    },
}

/// Body of `POST /send-event`, sent by the Gateway's relay to the Event Server that
/// owns the recipient's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEventRequest {
    pub recipient_id: UserId,
    pub payload: EventPayload,
}
