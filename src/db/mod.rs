//! Database module

pub mod memory;
pub mod postgres;
pub mod repository;

pub use memory::InMemoryRepository;
pub use postgres::PgRepository;
pub use repository::{geocode_key, CallWrite, DayLease, PlanCommit, Repository};

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Run embedded database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    let migrator = sqlx::migrate!("./migrations");
    let versions: Vec<i64> = migrator.iter().map(|m| m.version).collect();
    info!("Compiled migration versions: {:?}", versions);

    migrator.run(pool).await?;

    info!("Database migrations complete");
    Ok(())
}
