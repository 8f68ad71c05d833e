//! Durable state behind the control plane: apps, the deployment queue and
//! history, hosts, update jobs, webhook audit rows and notification rules.

mod app;
mod deployment;
mod host;
mod notification;
mod webhook;

pub use app::{App, AppStatus, NewApp};
pub use deployment::Deployment;
pub use host::{Host, NewHost, UpdateJob};
pub use notification::{ChannelType, NotificationChannel, NotificationRule};
pub use webhook::WebhookPayload;

use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::error::Result;

pub static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    /// Open (creating if necessary) the database at `db_path` and run
    /// migrations. Connections are shared by cloning [`Persistence`].
    pub async fn new(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // a single connection keeps the in-memory database alive and shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        MIGRATIONS
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The sealed CA bundle, when one was stored at install time.
    pub async fn load_ca_bundle(&self) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT bundle FROM pki_ca WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(bundle,)| bundle))
    }

    pub async fn store_ca_bundle(&self, bundle: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO pki_ca (id, bundle, created_at) VALUES (1, ?, ?)")
            .bind(bundle)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub(crate) fn parse_uuid(raw: String) -> std::result::Result<Uuid, sqlx::Error> {
    Uuid::parse_str(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

pub(crate) fn parse_uuid_opt(
    raw: Option<String>,
) -> std::result::Result<Option<Uuid>, sqlx::Error> {
    raw.map(parse_uuid).transpose()
}

/// Whether a database error is a violation of a unique constraint; the
/// queue and the webhook audit log use these as dedup gates.
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.message().contains("UNIQUE constraint failed"),
        _ => false,
    }
}
