use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use super::{is_unique_violation, Persistence};
use crate::error::Result;

/// One received webhook delivery, kept for auditing whatever its outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookPayload {
    pub delivery_id: String,
    pub event: String,
    pub body: String,
    pub outcome: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for WebhookPayload {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            delivery_id: row.try_get("delivery_id")?,
            event: row.try_get("event")?,
            body: row.try_get("body")?,
            outcome: row.try_get("outcome")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Persistence {
    /// Persist a delivery in outcome `received`. Returns false when the
    /// delivery id was seen before, which deduplicates provider retries.
    pub async fn record_delivery(
        &self,
        delivery_id: &str,
        event: &str,
        body: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO webhook_payloads (delivery_id, event, body, outcome, created_at) \
             VALUES (?, ?, ?, 'received', ?)",
        )
        .bind(delivery_id)
        .bind(event)
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_delivery_outcome(
        &self,
        delivery_id: &str,
        outcome: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE webhook_payloads SET outcome = ?, error = ? WHERE delivery_id = ?")
            .bind(outcome)
            .bind(error)
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_delivery(&self, delivery_id: &str) -> Result<Option<WebhookPayload>> {
        sqlx::query_as("SELECT * FROM webhook_payloads WHERE delivery_id = ?")
            .bind(delivery_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use crate::persistence::Persistence;

    #[tokio::test]
    async fn delivery_ids_deduplicate() {
        let p = Persistence::new_in_memory().await.unwrap();

        assert!(p.record_delivery("d-1", "push", "{}").await.unwrap());
        assert!(!p.record_delivery("d-1", "push", "{}").await.unwrap());

        p.set_delivery_outcome("d-1", "deployment_queued", None)
            .await
            .unwrap();
        let row = p.get_delivery("d-1").await.unwrap().unwrap();
        assert_eq!(row.outcome, "deployment_queued");
        assert_eq!(row.event, "push");
    }
}
