//! The `Connect` streaming RPC. Grounded on
//! `original_source/eventserver/grpc/grpc_server.go`, which validates the
//! `authorization` metadata at message boundary rather than connection boundary —
//! reproduced here by establishing the response stream first and only then checking
//! auth, so an unauthenticated caller sees the stream open but immediately fail
//! (SPEC_FULL.md §4.5's auth boundary note).

use std::sync::Arc;

use fabric_common::auth::TokenValidator;
use fabric_proto::eventserver::{
    event_server_server::EventServer as EventServerRpc, ConnectRequest, Event,
};
use presence::HeartBeater;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{event, Level};

use crate::session::{ConnectionHandle, EventServer};

const SINK_BUFFER: usize = 32;

pub struct EventServerGrpc {
    sessions: Arc<EventServer>,
    heartbeater: Arc<HeartBeater>,
    validator: Arc<dyn TokenValidator>,
}

impl EventServerGrpc {
    pub fn new(
        sessions: Arc<EventServer>,
        heartbeater: Arc<HeartBeater>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self {
            sessions,
            heartbeater,
            validator,
        }
    }
}

#[tonic::async_trait]
impl EventServerRpc for EventServerGrpc {
    type ConnectStream = ReceiverStream<Result<Event, Status>>;

    async fn connect(
        &self,
        request: Request<ConnectRequest>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let (tx, rx) = mpsc::channel(SINK_BUFFER);

        let token = request
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let principal = match token.map(|t| self.validator.validate(t)) {
            Some(Ok(principal)) => principal,
            _ => {
                let _ = tx
                    .send(Err(Status::unauthenticated("missing or invalid authorization metadata")))
                    .await;
                return Ok(Response::new(ReceiverStream::new(rx)));
            }
        };

        let user_id = principal.user_id;
        let requested_user_id = request.into_inner().user_id;
        if !requested_user_id.is_empty() && requested_user_id != user_id.to_string() {
            let _ = tx
                .send(Err(Status::permission_denied(
                    "user_id does not match authenticated principal",
                )))
                .await;
            return Ok(Response::new(ReceiverStream::new(rx)));
        }

        let handle: ConnectionHandle = self.sessions.serve_connection(user_id, tx).await;

        if let Err(err) = self.heartbeater.launch_for_user(user_id) {
            event!(Level::WARN, %user_id, %err, "heartbeat already running for this user");
        }

        let heartbeater = self.heartbeater.clone();
        tokio::spawn(async move {
            let _ = handle.teardown.await;
            let _ = heartbeater.stop_for_user(user_id);
            handle.ack_tx.send(()).ok();
            event!(Level::DEBUG, %user_id, "connect stream torn down");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_common::{auth::AuthConfig, ServerId};
    use presence::MockRedisClient;
    use std::time::Duration;
    use tokio_stream::StreamExt;
    use tonic::metadata::MetadataValue;

    fn grpc_service() -> EventServerGrpc {
        let sessions = Arc::new(EventServer::new());
        let heartbeater = Arc::new(HeartBeater::new(
            Arc::new(MockRedisClient::new()),
            ServerId("s1".into()),
            Duration::from_secs(20),
            Duration::from_millis(10),
        ));
        let validator = AuthConfig::Noop.build_validator().unwrap();
        EventServerGrpc::new(sessions, heartbeater, validator)
    }

    #[tokio::test]
    async fn missing_authorization_fails_the_stream_without_registering_a_session() {
        let service = grpc_service();
        let request = Request::new(ConnectRequest { user_id: String::new() });

        let response = service.connect(request).await.unwrap();
        let mut stream = response.into_inner();

        let first = stream.next().await.expect("stream should yield a message");
        let status = first.expect_err("unauthenticated connect should fail the first message");
        assert_eq!(status.code(), tonic::Code::Unauthenticated);

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn valid_authorization_opens_a_session() {
        let service = grpc_service();
        let mut request = Request::new(ConnectRequest { user_id: String::new() });
        request.metadata_mut().insert(
            "authorization",
            MetadataValue::try_from("Bearer someone").unwrap(),
        );

        let response = service.connect(request).await.unwrap();
        let mut stream = response.into_inner();

        // NoopAuth fabricates a principal from the bearer value; the stream stays
        // open (no message queued yet) rather than immediately failing.
        let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err(), "stream should not yield without a send_event");
    }
}
