use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trigger_relay_core::SystemClock;
use trigger_relay_events::{EventStore, InMemoryEventStore};
use trigger_relay_scheduler::{Engine, ReqwestApiCaller};
use trigger_relay_server::config::ServerConfig;
use trigger_relay_server::db::{PgEventStore, PgTriggerRepository};
use trigger_relay_server::routes;
use trigger_relay_trigger::{InMemoryTriggerRepository, TriggerRepository};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from the optional file and environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    let (triggers, events): (Arc<dyn TriggerRepository>, Arc<dyn EventStore>) =
        match &config.database_url {
            Some(url) => {
                let db_pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(5)
                    .connect(url)
                    .await
                    .expect("failed to connect to database");

                tracing::info!("Running database migrations...");
                sqlx::migrate!("./migrations")
                    .run(&db_pool)
                    .await
                    .expect("failed to run migrations");

                (
                    Arc::new(PgTriggerRepository::new(db_pool.clone())),
                    Arc::new(PgEventStore::new(db_pool)),
                )
            }
            None => {
                tracing::warn!("no database_url configured, state is kept in memory");
                (
                    Arc::new(InMemoryTriggerRepository::new()),
                    Arc::new(InMemoryEventStore::new()),
                )
            }
        };

    let caller = ReqwestApiCaller::new(config.scheduler.http_timeout())
        .expect("failed to build HTTP client");
    let engine = Engine::new(
        triggers,
        events,
        Arc::new(caller),
        Arc::new(SystemClock),
        &config.scheduler,
        config.retention.clone(),
    )
    .start()
    .await
    .expect("failed to start engine");

    let app = routes::router(engine.service().clone());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.listen_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    engine.shutdown().await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
