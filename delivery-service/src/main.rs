mod api;
mod config;
mod consumer;
mod domain;
mod error;
mod geocoding;
mod lifecycle;
mod models;
mod optimizer;
mod orchestrator;
mod postgres;
mod publisher;
mod queue;
mod schema;
mod store;
#[cfg(test)]
mod testing;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::PgConnection;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::Result;
use clap::Parser;
use diesel::Connection;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = Arc::new(Config::parse());

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&config.database_url)?;
    conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let pool = postgres::build_pool(&config.database_url, config.database_pool_size).await?;
    let store = Arc::new(postgres::PgStore::new(pool));

    let geocoder = Arc::new(geocoding::NominatimGeocoder::from_config(&config)?);
    let publisher = Arc::new(publisher::KafkaEventPublisher::from_config(&config)?);
    let source = Arc::new(queue::KafkaMessageSource::from_config(&config)?);

    let consumer = consumer::OrderEventConsumer::new(&config, source, store.clone(), store.clone(), geocoder);
    let service = Arc::new(lifecycle::DeliveryService::new(store.clone(), store.clone(), store.clone()));
    let generator = Arc::new(orchestrator::RouteGenerator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        publisher,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = tokio::spawn(async move {
        consumer.run(shutdown_rx).await;
    });

    let app = api::create_router(api::AppState { service, generator });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Delivery service web server started on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    consumer_task.await?;
    info!("Delivery service stopped");

    Ok(())
}
