mod http;
mod relay;

use std::sync::Arc;
use std::time::Duration;

use fabric_common::{
    config::GatewaySettings,
    lifecycle::{Closer, Closers},
    registerer::Registerer,
    user_store::InMemoryUserStore,
};
use presence::{ActiveUserTracker, RedisClient, ServerResolver};
use registry::{ResolveServer, ServerRegistry};
use relay::{EventRelay, EventServerPool};
use tokio::sync::Notify;
use tracing::{event, Level};

const GRACEFUL_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_utils::set_up_logging()?;

    let config_path =
        std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config/gateway.yaml".to_owned());
    let settings = GatewaySettings::load(&config_path)?;

    let mut closers = Closers::new();

    let server_registry = Arc::new(ServerRegistry::connect(settings.common.kv_store_endpoint.clone()).await?);
    server_registry.start().await?;
    closers.push(Closer::new("server-registry", {
        let server_registry = server_registry.clone();
        move || async move {
            server_registry.close();
            Ok(())
        }
    }));

    let presence_store = Arc::new(RedisClient::connect(&settings.common.presence_store_address).await?);
    let resolver = Arc::new(ServerResolver::new(presence_store.clone()));
    let active_users = Arc::new(ActiveUserTracker::new(
        presence_store,
        Duration::from_secs(settings.active_user_ttl_secs),
    ));

    let pool = Arc::new(EventServerPool::new());
    closers.push(Closer::new("event-server-pool", {
        let pool = pool.clone();
        move || async move {
            pool.close().await;
            Ok(())
        }
    }));

    let registry_seam: Arc<dyn ResolveServer> = server_registry.clone();
    let relay = Arc::new(EventRelay::new(resolver, registry_seam, pool));

    let validator = settings.common.auth.build_validator()?;
    let issuer = settings.common.auth.build_issuer()?;
    let user_store = Arc::new(InMemoryUserStore::new());
    let registerer = Arc::new(Registerer::new(user_store, issuer));

    let state = http::AppState {
        registerer,
        active_users,
        server_registry: server_registry.clone(),
        relay,
        validator,
    };

    let http_addr = settings.common.http_listen_address.parse()?;

    let shutdown = Arc::new(Notify::new());
    let shutdown_trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_termination_signal().await;
        event!(Level::INFO, "shutdown signal received");
        shutdown_trigger.notify_waiters();
    });

    event!(Level::INFO, %http_addr, "starting gateway");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;

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
