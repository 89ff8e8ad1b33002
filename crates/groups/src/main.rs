use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mds_events::topics;
use mds_groups::{health_router, GroupApp, GroupConfig, CONSUMED_TOPICS, MIGRATOR};
use mds_infra::event_bus::RedisStreamsBus;
use mds_infra::outbox::OutboxDrainerConfig;
use mds_infra::search::{MeiliSearchClient, SearchDrainerConfig};
use mds_infra::{ConsumerConfig, PgDatabase};

const DB_MAX_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mds_observability::init();

    let config = GroupConfig::from_env().context("load configuration")?;

    let db = PgDatabase::connect(&config.db_url, DB_MAX_CONNECTIONS)
        .await
        .context("connect to database")?;
    db.migrate(&MIGRATOR).await.context("apply migrations")?;

    let bus = Arc::new(
        RedisStreamsBus::connect(&config.bus_url)
            .await
            .context("connect to bus")?,
    );
    bus.create_topics(&[topics::GROUPS])
        .await
        .context("create groups topic")?;
    let consumer = Arc::new(
        bus.consumer(&config.consumer_group, &config.consumer_name, &CONSUMED_TOPICS)
            .await
            .context("join consumer group")?,
    );
    let search = Arc::new(
        MeiliSearchClient::new(&config.search_host, &config.search_master_key).context("build search client")?,
    );

    let shutdown = CancellationToken::new();
    let app = GroupApp::new(db, shutdown.clone());

    if config.rebuild_search_index {
        app.service()
            .rebuild_search_index(&shutdown)
            .await
            .context("enqueue search index rebuild")?;
    }

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("bind http listener on {}", config.http_addr))?;
    info!("listening on {}", listener.local_addr()?);
    let stop = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, health_router())
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
        {
            error!(error = %err, "server failed");
        }
    });

    let workers = vec![
        app.spawn_consumer(
            consumer,
            ConsumerConfig {
                name: "group-service",
                ..ConsumerConfig::default()
            },
        ),
        app.spawn_outbox_drainer(bus.clone(), OutboxDrainerConfig::default()),
        app.spawn_search_drainer(search, SearchDrainerConfig::default()),
    ];

    shutdown_signal().await;
    info!("shutting down");

    app.shutdown();
    for worker in workers {
        worker.shutdown().await;
    }
    if let Err(err) = server.await {
        error!(error = %err, "server task failed");
    }
    info!("stopped");
    Ok(())
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
