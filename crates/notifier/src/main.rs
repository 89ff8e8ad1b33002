use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mds_auth::Hs256TokenValidator;
use mds_infra::event_bus::RedisStreamsBus;
use mds_infra::{ConsumerConfig, PgDatabase};
use mds_notifier::ready::{self, ReadyState};
use mds_notifier::{health_router, NotifierApp, NotifierConfig, CONSUMED_TOPICS, MIGRATOR};

const DB_MAX_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mds_observability::init();

    let config = NotifierConfig::from_env().context("load configuration")?;

    let db = PgDatabase::connect(&config.db_url, DB_MAX_CONNECTIONS)
        .await
        .context("connect to database")?;
    db.migrate(&MIGRATOR).await.context("apply migrations")?;

    let bus = Arc::new(
        RedisStreamsBus::connect(&config.bus_url)
            .await
            .context("connect to bus")?,
    );
    let consumer = Arc::new(
        bus.consumer(&config.consumer_group, &config.consumer_name, &CONSUMED_TOPICS)
            .await
            .context("join consumer group")?,
    );

    let shutdown = CancellationToken::new();
    let app = NotifierApp::new(db.clone(), config.watcher, shutdown.clone());
    let tokens = Arc::new(Hs256TokenValidator::new(config.auth_secret.as_bytes()));

    let ready_state = ReadyState {
        database: Arc::new(db.clone()),
        topics: bus.clone(),
        required_topics: CONSUMED_TOPICS.to_vec(),
    };

    let servers = vec![
        serve("http", config.http_addr, health_router(), &shutdown).await?,
        serve("ws", config.ws_addr, app.ws_router(tokens), &shutdown).await?,
        serve("ready", config.ready_addr, ready::router(ready_state), &shutdown).await?,
    ];

    let consumer_worker = app.spawn_consumer(
        consumer,
        ConsumerConfig {
            name: "open-intel-delivery-notifier",
            ..ConsumerConfig::default()
        },
    );

    shutdown_signal().await;
    info!("shutting down");

    app.shutdown().await;
    consumer_worker.shutdown().await;
    for server in servers {
        if let Err(err) = server.await {
            error!(error = %err, "server task failed");
        }
    }
    info!("stopped");
    Ok(())
}

async fn serve(
    name: &'static str,
    addr: SocketAddr,
    router: Router,
    shutdown: &CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {name} listener on {addr}"))?;
    info!(server = name, "listening on {}", listener.local_addr()?);

    let stop = shutdown.clone();
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
        {
            error!(server = name, error = %err, "server failed");
        }
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!(error = %err, "failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
