use std::time::Duration;

use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Invalid stored value: {0}")]
    Decode(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Duplicate entry: {0}")]
    Duplicate(String),
}

/// Pool sizing, from the `[database]` settings table.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pub pool: MySqlPool,
}

impl Database {
    pub async fn connect(url: &str, options: &PoolOptions) -> Result<Self, DbError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .acquire_timeout(options.acquire_timeout)
            .idle_timeout(Duration::from_secs(300))
            .connect(url)
            .await?;

        info!("Connected to hostpanel database");
        Ok(Self { pool })
    }

    /// Apply the migrations embedded from `migrations/`.
    pub async fn migrate(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Create the panel database if it doesn't exist. `root_url` must point
    /// at the server, not at the database itself.
    pub async fn ensure_database(root_url: &str, name: &str) -> Result<(), DbError> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DbError::Decode(format!("invalid database name: {}", name)));
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect(root_url)
            .await?;

        let statement = format!(
            "CREATE DATABASE IF NOT EXISTS `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
            name
        );
        sqlx::query(&statement).execute(&pool).await?;

        info!(database = %name, "Ensured database exists");
        Ok(())
    }
}
