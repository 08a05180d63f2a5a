use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use talkwire_core::auth::{TokenResolver, UserResolver};
use talkwire_core::{AppConfig, AppState};
use talkwire_gateway::{ClientTable, DashboardSet, GatewayState};
use talkwire_presence::{HttpStatusMirror, PresenceManager, StatusMirror};
use talkwire_store::group::{run_janitor, run_lock_inspector};
use talkwire_store::{GroupDirectory, JanitorConfig, Store};

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("talkwire=info,tower_http=warn")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    // Store unavailability at init is fatal (nonzero exit).
    let store = Store::connect(&config.redis.url).await?;
    if config.redis.leader {
        if let Err(err) = store.enable_keyspace_events().await {
            tracing::warn!(
                error = %err,
                "keyspace-event configuration failed; expiry-driven offline transitions disabled"
            );
        }
    }

    let shutdown = Arc::new(Notify::new());
    let groups = Arc::new(GroupDirectory::new(
        store.clone(),
        Duration::from_millis(config.group.busy_timeout_ms),
    ));

    let mirror: Option<Arc<dyn StatusMirror>> = if config.mirror.enabled {
        config
            .mirror
            .endpoint
            .clone()
            .map(|endpoint| Arc::new(HttpStatusMirror::new(endpoint)) as Arc<dyn StatusMirror>)
    } else {
        None
    };
    let presence = Arc::new(PresenceManager::new(
        store.clone(),
        talkwire_presence::PresenceConfig {
            enabled: config.presence.enabled,
            ttl_seconds: config.presence.ttl_seconds,
        },
        mirror,
    ));
    let presence_listener = presence.spawn_listener(Arc::clone(&shutdown));

    let app_state = AppState {
        config: Arc::new(AppConfig {
            ping_interval: Duration::from_millis(config.server.ping_interval_ms),
            max_idle_duration: Duration::from_millis(config.message.maximum_idle_duration_ms),
            max_turn_duration: Duration::from_millis(config.message.maximum_duration_ms),
        }),
        store: store.clone(),
        groups: Arc::clone(&groups),
        presence: Arc::clone(&presence),
        shutdown: Arc::clone(&shutdown),
    };

    let resolver: Arc<dyn UserResolver> = Arc::new(TokenResolver::new(
        config.auth.use_authentication,
        config.auth.secret_key.clone(),
    ));
    let gateway_state = GatewayState {
        app: app_state.clone(),
        resolver,
        clients: Arc::new(ClientTable::new()),
        dashboards: Arc::new(DashboardSet::new()),
    };
    let presence_bridge = talkwire_gateway::spawn_presence_bridge(gateway_state.clone());

    // Only the leader sweeps; a janitor per instance would multiply the scan
    // load without cleaning anything extra.
    let janitor = config.redis.leader.then(|| {
        tokio::spawn(run_janitor(
            Arc::clone(&groups),
            JanitorConfig {
                interval: Duration::from_millis(config.redis.clean_interval_ms),
                groups_per_cycle: config.redis.clean_groups_amount,
            },
            Arc::clone(&shutdown),
        ))
    });
    let lock_inspector = config.redis.leader.then(|| {
        tokio::spawn(run_lock_inspector(
            Arc::clone(&groups),
            Duration::from_millis(config.group.inspect_interval_ms),
            Arc::clone(&shutdown),
        ))
    });

    let router = talkwire_api::build_router()
        .with_state(app_state.clone())
        .merge(talkwire_gateway::gateway_router().with_state(gateway_state.clone()));

    // Bind failure is fatal (nonzero exit).
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        address = %config.server.bind_address,
        redis = %config.redis.url,
        presence_ttl = config.presence.ttl_seconds,
        leader = config.redis.leader,
        "talkwire listening"
    );

    let clients = Arc::clone(&gateway_state.clients);
    let shutdown_signal = {
        let shutdown = Arc::clone(&shutdown);
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            // Teardown order: stop accepting, close active connections, then
            // the subscribe/command paths below.
            shutdown.notify_waiters();
            clients.close_all();
        }
    };

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    presence_bridge.abort();
    presence_listener.abort();
    if let Some(janitor) = janitor {
        janitor.abort();
    }
    if let Some(inspector) = lock_inspector {
        inspector.abort();
    }
    drop(store);
    tracing::info!("shutdown complete");
    Ok(())
}
