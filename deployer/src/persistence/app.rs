use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::{parse_uuid, parse_uuid_opt, Persistence};
use crate::error::{Error, Result};

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
#[sqlx(rename_all = "lowercase")]
pub enum AppStatus {
    Active,
    Inactive,
    Deleted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct App {
    pub id: Uuid,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub subdir: Option<String>,
    pub host_id: Option<Uuid>,
    pub webhook_id: Option<String>,
    pub status: AppStatus,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for App {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            name: row.try_get("name")?,
            repo_url: row.try_get("repo_url")?,
            branch: row.try_get("branch")?,
            subdir: row.try_get("subdir")?,
            host_id: parse_uuid_opt(row.try_get("host_id")?)?,
            webhook_id: row.try_get("webhook_id")?,
            status: row.try_get("status")?,
            config: serde_json::from_str(row.try_get::<String, _>("config")?.as_str())
                .unwrap_or(serde_json::Value::Null),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Everything needed to register an application.
#[derive(Clone, Debug)]
pub struct NewApp {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub subdir: Option<String>,
    pub host_id: Option<Uuid>,
    pub webhook_id: Option<String>,
}

impl Persistence {
    pub async fn create_app(&self, new: NewApp) -> Result<App> {
        paasdeploy_common::app::validate_name(&new.name)?;
        let now = Utc::now();
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO apps (id, name, repo_url, branch, subdir, host_id, webhook_id, status, config, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'active', '{}', ?, ?)",
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(&new.repo_url)
        .bind(&new.branch)
        .bind(&new.subdir)
        .bind(new.host_id.map(|h| h.to_string()))
        .bind(&new.webhook_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_app(id).await?.ok_or(Error::NotFound("app"))
    }

    pub async fn get_app(&self, id: Uuid) -> Result<Option<App>> {
        sqlx::query_as("SELECT * FROM apps WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_app_by_name(&self, name: &str) -> Result<Option<App>> {
        sqlx::query_as("SELECT * FROM apps WHERE name = ? AND status != 'deleted'")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// Resolve an app by any of the repository URL spellings a webhook
    /// payload may carry.
    pub async fn find_app_by_repo_urls(&self, variants: &[String]) -> Result<Option<App>> {
        if variants.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; variants.len()].join(", ");
        let query = format!(
            "SELECT * FROM apps WHERE status != 'deleted' AND repo_url IN ({placeholders}) LIMIT 1"
        );

        let mut q = sqlx::query_as(&query);
        for variant in variants {
            q = q.bind(variant);
        }

        q.fetch_optional(&self.pool).await.map_err(Into::into)
    }

    pub async fn list_active_apps(&self) -> Result<Vec<App>> {
        sqlx::query_as("SELECT * FROM apps WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn set_app_status(&self, id: Uuid, status: AppStatus) -> Result<()> {
        sqlx::query("UPDATE apps SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_env_var(&self, app_id: Uuid, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO app_env_vars (app_id, key, value) VALUES (?, ?, ?)")
            .bind(app_id.to_string())
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn env_vars(&self, app_id: Uuid) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM app_env_vars WHERE app_id = ?")
                .bind(app_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{AppStatus, NewApp};
    use crate::persistence::Persistence;

    pub(crate) fn new_app(name: &str) -> NewApp {
        NewApp {
            name: name.to_string(),
            repo_url: format!("https://github.com/acme/{name}.git"),
            branch: "main".to_string(),
            subdir: None,
            host_id: None,
            webhook_id: None,
        }
    }

    #[tokio::test]
    async fn name_is_unique_among_live_apps() {
        let p = Persistence::new_in_memory().await.unwrap();

        let first = p.create_app(new_app("api")).await.unwrap();
        assert!(p.create_app(new_app("api")).await.is_err());

        // a deleted app frees its name
        p.set_app_status(first.id, AppStatus::Deleted).await.unwrap();
        p.create_app(new_app("api")).await.unwrap();
    }

    #[tokio::test]
    async fn resolve_by_repo_url_variant() {
        let p = Persistence::new_in_memory().await.unwrap();
        let app = p.create_app(new_app("api")).await.unwrap();

        let found = p
            .find_app_by_repo_urls(&[
                "git@github.com:acme/api.git".to_string(),
                "https://github.com/acme/api.git".to_string(),
            ])
            .await
            .unwrap()
            .expect("should match the clone url");
        assert_eq!(found.id, app.id);

        assert!(p
            .find_app_by_repo_urls(&["https://github.com/acme/other.git".to_string()])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn env_vars_round_trip() {
        let p = Persistence::new_in_memory().await.unwrap();
        let app = p.create_app(new_app("api")).await.unwrap();

        p.set_env_var(app.id, "PORT", "3000").await.unwrap();
        p.set_env_var(app.id, "PORT", "3001").await.unwrap();
        p.set_env_var(app.id, "LOG", "debug").await.unwrap();

        let env = p.env_vars(app.id).await.unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env["PORT"], "3001");

        assert!(p.env_vars(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
