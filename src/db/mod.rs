mod schema;

pub use schema::*;

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

/// Connect to SQLite database
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Run database migrations
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA)
        .execute(pool)
        .await?;

    // Add auto_connect column to existing printers table if it doesn't exist
    sqlx::query("ALTER TABLE printers ADD COLUMN auto_connect INTEGER DEFAULT 0")
        .execute(pool)
        .await
        .ok(); // Ignore error if column already exists

    tracing::info!("Database migrations complete");
    Ok(())
}

/// Database schema - will be split into migrations later
const SCHEMA: &str = r#"
-- Printer registry: everything needed to reconnect to a printer without
-- rediscovering it (IP address is best-effort and gets refreshed by SSDP).
CREATE TABLE IF NOT EXISTS printers (
    serial TEXT PRIMARY KEY,
    name TEXT,
    model TEXT,
    ip_address TEXT,
    access_code TEXT,
    last_seen INTEGER,
    config TEXT,
    auto_connect INTEGER DEFAULT 0
);
"#;
