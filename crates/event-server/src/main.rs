mod grpc;
mod http;
mod session;

use std::sync::Arc;
use std::time::Duration;

use fabric_common::{
    auth::AuthConfig,
    config::EventServerSettings,
    lifecycle::{Closer, Closers},
    model::ServerInfo,
    ServerId,
};
use fabric_proto::eventserver::event_server_server::EventServerServer;
use presence::{HeartBeater, RedisClient};
use registry::{LeasedRegistryClient, MembershipManager};
use tokio::sync::Notify;
use tracing::{event, Level};

const GRACEFUL_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_utils::set_up_logging()?;

    let config_path =
        std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config/event-server.yaml".to_owned());
    let settings = EventServerSettings::load(&config_path)?;
    let server_id = ServerId(settings.server_id.clone());

    let mut closers = Closers::new();

    let lease_client = Arc::new(
        LeasedRegistryClient::connect(settings.common.kv_store_endpoint.clone()).await?,
    );

    let membership = Arc::new(MembershipManager::new(lease_client.clone()));
    let info = ServerInfo {
        id: server_id.clone(),
        grpc_address: settings.grpc_listen_address.clone(),
        http_address: settings.common.http_listen_address.clone(),
    };

    membership
        .join_cluster(
            server_id.clone(),
            info,
            Duration::from_secs(settings.lease_ttl_secs),
            Duration::from_secs(settings.refresh_interval_secs),
        )
        .await?;
    closers.push(Closer::new("membership", {
        let membership = membership.clone();
        move || async move {
            membership.leave_cluster(GRACEFUL_SHUTDOWN_DEADLINE).await?;
            Ok(())
        }
    }));

    let presence_store = Arc::new(
        RedisClient::connect(&settings.common.presence_store_address).await?,
    );

    let heartbeater = Arc::new(HeartBeater::new(
        presence_store,
        server_id.clone(),
        Duration::from_secs(settings.heartbeat_ttl_secs),
        Duration::from_secs(settings.heartbeat_interval_secs),
    ));
    closers.push(Closer::new("heartbeater", {
        let heartbeater = heartbeater.clone();
        move || async move {
            heartbeater.close();
            Ok(())
        }
    }));

    let validator = settings.common.auth.build_validator()?;
    let sessions = Arc::new(session::EventServer::new());

    let grpc_service = grpc::EventServerGrpc::new(sessions.clone(), heartbeater.clone(), validator.clone());
    let http_state = http::AppState {
        sessions: sessions.clone(),
        validator,
    };

    let grpc_addr = settings.grpc_listen_address.parse()?;
    let http_addr = settings.common.http_listen_address.parse()?;

    let shutdown = Arc::new(Notify::new());
    let shutdown_trigger = shutdown.clone();
    let membership_for_watch = membership.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_termination_signal() => {
                event!(Level::INFO, "shutdown signal received");
            }
            _ = membership_for_watch.membership_lost() => {
                event!(Level::ERROR, "membership lease lost, this is fatal");
            }
        }
        shutdown_trigger.notify_waiters();
    });

    event!(Level::INFO, %grpc_addr, %http_addr, "starting event-server");

    let grpc_shutdown = shutdown.clone();
    let grpc_server = tonic::transport::Server::builder()
        .add_service(EventServerServer::new(grpc_service))
        .serve_with_shutdown(grpc_addr, async move { grpc_shutdown.notified().await });

    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_shutdown = shutdown.clone();
    let http_server = axum::serve(http_listener, http::router(http_state))
        .with_graceful_shutdown(async move { http_shutdown.notified().await });

    let sessions_for_drain = sessions.clone();
    closers.push(Closer::new("sessions", move || async move {
        sessions_for_drain
            .initiate_shutdown(GRACEFUL_SHUTDOWN_DEADLINE)
            .await;
        Ok(())
    }));

    let (grpc_result, http_result) = tokio::join!(grpc_server, http_server);
    grpc_result?;
    http_result?;

    closers.close_with_timeout(GRACEFUL_SHUTDOWN_DEADLINE).await;

    Ok(())
}

async fn wait_for_termination_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sigterm) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            return;
        };
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
