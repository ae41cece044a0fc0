//! Holds open streams; dispatches inbound messages. Grounded on
//! `original_source/eventserver/services/event_server.go`'s `eventServer`
//! (`connections map[pkgid.ID]privConn{conn,waitCh}`), resolving its own open TODO
//! ("check if conn already exists") per SPEC_FULL.md §4.5 as "replace and release
//! the previous".

use std::collections::HashMap;
use std::time::Duration;

use fabric_common::UserId;
use fabric_proto::eventserver::Event;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tonic::Status;
use tracing::{event, Level};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The Event Server's translation of `Forward`'s step 4 (original spec §4.6): the
    /// registry still lists this server, but it no longer holds the recipient's stream.
    #[error("recipient not on this server")]
    RecipientNotOnThisServer,
    #[error("sink send failed")]
    SinkSendFailed,
}

pub type EventSink = mpsc::Sender<Result<Event, Status>>;

struct Session {
    sink: EventSink,
    teardown: oneshot::Sender<()>,
    ack: oneshot::Receiver<()>,
}

/// A handle returned to the streaming RPC handler: block on `teardown` to keep the
/// transport open, then call `acknowledge` once cleanup is done.
pub struct ConnectionHandle {
    pub teardown: oneshot::Receiver<()>,
    pub(crate) ack_tx: oneshot::Sender<()>,
}

impl ConnectionHandle {
    pub fn acknowledge(self) {
        let _ = self.ack_tx.send(());
    }
}

#[derive(Default)]
pub struct EventServer {
    sessions: RwLock<HashMap<UserId, Session>>,
}

impl EventServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a `StreamSession` for `user_id`. If one already exists on this
    /// process, it is replaced: the previous session's teardown signal fires,
    /// releasing its handler.
    pub async fn serve_connection(&self, user_id: UserId, sink: EventSink) -> ConnectionHandle {
        let (teardown_tx, teardown_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();

        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.remove(&user_id) {
            event!(Level::INFO, %user_id, "replacing existing stream session");
            let _ = previous.teardown.send(());
        }

        sessions.insert(
            user_id,
            Session {
                sink,
                teardown: teardown_tx,
                ack: ack_rx,
            },
        );

        ConnectionHandle {
            teardown: teardown_rx,
            ack_tx,
        }
    }

    /// Looks up the recipient's session on this process and pushes `event` through
    /// its sink, bounded by `deadline`.
    pub async fn send_event(&self, user_id: UserId, event: Event, deadline: Duration) -> Result<(), SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(&user_id)
            .ok_or(SessionError::RecipientNotOnThisServer)?;

        tokio::time::timeout(deadline, session.sink.send(Ok(event)))
            .await
            .map_err(|_| SessionError::SinkSendFailed)?
            .map_err(|_| SessionError::SinkSendFailed)
    }

    /// Snapshots all sessions, signals teardown for each concurrently, and waits for
    /// acknowledgement or `timeout`. Sessions that don't ack in time are logged, not
    /// retried — shutdown always completes at `timeout`.
    pub async fn initiate_shutdown(&self, timeout: Duration) {
        let snapshot: Vec<_> = self.sessions.write().await.drain().collect();
        let deadline = Instant::now() + timeout;

        let mut tasks = Vec::with_capacity(snapshot.len());
        for (user_id, session) in snapshot {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tasks.push(tokio::spawn(async move {
                let _ = session.teardown.send(());
                if tokio::time::timeout(remaining, session.ack).await.is_err() {
                    event!(Level::WARN, %user_id, "session did not acknowledge teardown before deadline");
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_event_to_unknown_user_fails() {
        let server = EventServer::new();
        let (tx, _rx) = mpsc::channel(1);
        let _handle = server
            .serve_connection(UserId::new(), tx)
            .await;

        let err = server
            .send_event(UserId::new(), Event { payload: None }, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::RecipientNotOnThisServer));
    }

    #[tokio::test]
    async fn replacing_a_session_releases_the_previous() {
        let server = EventServer::new();
        let user_id = UserId::new();

        let (tx1, _rx1) = mpsc::channel(1);
        let handle1 = server.serve_connection(user_id, tx1).await;

        let (tx2, _rx2) = mpsc::channel(1);
        let _handle2 = server.serve_connection(user_id, tx2).await;

        // the first handle's teardown must fire because it was replaced
        tokio::time::timeout(Duration::from_millis(100), handle1.teardown)
            .await
            .expect("teardown should fire promptly")
            .expect("teardown sender should not be dropped without sending");
    }

    #[tokio::test]
    async fn send_event_delivers_to_the_registered_sink() {
        let server = EventServer::new();
        let user_id = UserId::new();
        let (tx, mut rx) = mpsc::channel(1);
        let _handle = server.serve_connection(user_id, tx).await;

        server
            .send_event(user_id, Event { payload: None }, Duration::from_millis(100))
            .await
            .unwrap();

        assert!(rx.recv().await.is_some());
    }
}
