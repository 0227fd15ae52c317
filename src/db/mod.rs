use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;

pub mod accounts;
pub mod repository;

/// Connect to PostgreSQL and bring the owned schema up to date.
pub async fn connect(config: &DatabaseConfig) -> eyre::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

    Ok(pool)
}
