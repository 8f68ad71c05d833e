use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::{parse_uuid, parse_uuid_opt, Persistence};
use crate::error::{Error, Result};

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash, Display, Serialize, EnumString, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
#[sqlx(rename_all = "lowercase")]
pub enum ChannelType {
    Slack,
    Discord,
    Email,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NotificationChannel {
    pub id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
    pub config: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for NotificationChannel {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            name: row.try_get("name")?,
            channel_type: row.try_get("channel_type")?,
            config: serde_json::from_str(row.try_get::<String, _>("config")?.as_str())
                .unwrap_or(serde_json::Value::Null),
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NotificationRule {
    pub id: Uuid,
    pub event_type: String,
    pub channel_id: Uuid,
    pub app_id: Option<Uuid>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for NotificationRule {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            event_type: row.try_get("event_type")?,
            channel_id: parse_uuid(row.try_get("channel_id")?)?,
            app_id: parse_uuid_opt(row.try_get("app_id")?)?,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Persistence {
    pub async fn create_channel(
        &self,
        name: &str,
        channel_type: ChannelType,
        config: serde_json::Value,
    ) -> Result<NotificationChannel> {
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO notification_channels (id, name, channel_type, config, enabled, created_at) \
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(channel_type)
        .bind(config.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_channel(id).await?.ok_or(Error::NotFound("channel"))
    }

    pub async fn get_channel(&self, id: Uuid) -> Result<Option<NotificationChannel>> {
        sqlx::query_as("SELECT * FROM notification_channels WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn create_rule(
        &self,
        event_type: &str,
        channel_id: Uuid,
        app_id: Option<Uuid>,
    ) -> Result<NotificationRule> {
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO notification_rules (id, event_type, channel_id, app_id, enabled, created_at) \
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(id.to_string())
        .bind(event_type)
        .bind(channel_id.to_string())
        .bind(app_id.map(|a| a.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let rule = sqlx::query_as("SELECT * FROM notification_rules WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(rule)
    }

    /// Enabled rules matching an event, with their channels. A rule bound to
    /// an app only fires for that app; unbound rules fire for every app.
    pub async fn rules_for_event(
        &self,
        event_type: &str,
        app_id: Option<Uuid>,
    ) -> Result<Vec<(NotificationRule, NotificationChannel)>> {
        let rules: Vec<NotificationRule> = sqlx::query_as(
            "SELECT r.* FROM notification_rules r \
             JOIN notification_channels c ON c.id = r.channel_id \
             WHERE r.event_type = ? AND r.enabled = 1 AND c.enabled = 1 \
               AND (r.app_id IS NULL OR r.app_id = ?)",
        )
        .bind(event_type)
        .bind(app_id.map(|a| a.to_string()))
        .fetch_all(&self.pool)
        .await?;

        let mut matched = Vec::with_capacity(rules.len());
        for rule in rules {
            if let Some(channel) = self.get_channel(rule.channel_id).await? {
                matched.push((rule, channel));
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::ChannelType;
    use crate::persistence::Persistence;

    #[tokio::test]
    async fn rules_match_event_and_app() {
        let p = Persistence::new_in_memory().await.unwrap();
        let channel = p
            .create_channel(
                "ops",
                ChannelType::Slack,
                json!({"webhook_url": "https://hooks.slack.example/T000"}),
            )
            .await
            .unwrap();

        let app = p
            .create_app(crate::persistence::NewApp {
                name: "api".to_string(),
                repo_url: "https://github.com/acme/api.git".to_string(),
                branch: "main".to_string(),
                subdir: None,
                host_id: None,
                webhook_id: None,
            })
            .await
            .unwrap();

        p.create_rule("deploy_failed", channel.id, None).await.unwrap();
        p.create_rule("health_unhealthy", channel.id, Some(app.id))
            .await
            .unwrap();

        // the unbound rule matches any app
        let matched = p
            .rules_for_event("deploy_failed", Some(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].1.channel_type, ChannelType::Slack);

        // the bound rule matches only its app
        assert_eq!(
            p.rules_for_event("health_unhealthy", Some(app.id))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(p
            .rules_for_event("health_unhealthy", Some(Uuid::new_v4()))
            .await
            .unwrap()
            .is_empty());

        assert!(p
            .rules_for_event("deploy_success", Some(app.id))
            .await
            .unwrap()
            .is_empty());
    }
}
