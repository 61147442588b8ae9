use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::PgConnection;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::Result;
use clap::Parser;
use diesel::Connection;
use diesel_async::{pooled_connection::AsyncDieselConnectionManager, AsyncPgConnection};
use inventory_service::{Args, InventoryEngine, PgStore, SystemClock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    // Run migrations first
    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&args.database_url)?;
    conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&args.database_url);
    let pool = bb8::Pool::builder().max_size(args.db_pool_size).build(config).await?;

    let engine = InventoryEngine::new(Arc::new(PgStore::new(pool)), Arc::new(SystemClock), args.engine_config());
    let sweeper = engine.sweeper(args.sweeper_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_task = tokio::spawn(async move {
        sweeper.run(shutdown_rx).await;
    });

    info!("Inventory service started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send(true)?;
    sweeper_task.await?;

    Ok(())
}
