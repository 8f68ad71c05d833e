use chrono::{DateTime, Duration, Utc};
use paasdeploy_common::host::{HostStatus, UpdateJobStatus, UpdateMode};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use super::{is_unique_violation, parse_uuid, parse_uuid_opt, Persistence};
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct Host {
    pub id: Uuid,
    pub name: Option<String>,
    pub address: String,
    pub port: u16,
    pub ssh_user: Option<String>,
    pub ssh_key_enc: Option<String>,
    pub acme_email: Option<String>,
    pub status: HostStatus,
    pub agent_version: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub update_mode: UpdateMode,
    pub user_id: Option<Uuid>,
    pub cert_bundle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for Host {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            port: row.try_get::<i64, _>("port")? as u16,
            ssh_user: row.try_get("ssh_user")?,
            ssh_key_enc: row.try_get("ssh_key_enc")?,
            acme_email: row.try_get("acme_email")?,
            status: row.try_get("status")?,
            agent_version: row.try_get("agent_version")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            update_mode: row.try_get("update_mode")?,
            user_id: parse_uuid_opt(row.try_get("user_id")?)?,
            cert_bundle: row.try_get("cert_bundle")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct NewHost {
    pub name: Option<String>,
    pub address: String,
    pub port: u16,
    pub ssh_user: Option<String>,
    pub acme_email: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateJob {
    pub id: Uuid,
    pub host_id: Uuid,
    pub requested_version: String,
    pub download_url: String,
    pub status: UpdateJobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for UpdateJob {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            host_id: parse_uuid(row.try_get("host_id")?)?,
            requested_version: row.try_get("requested_version")?,
            download_url: row.try_get("download_url")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Persistence {
    pub async fn create_host(&self, new: NewHost) -> Result<Host> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO servers (id, name, address, port, ssh_user, acme_email, status, update_mode, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'pending', 'push', ?, ?)",
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(&new.address)
        .bind(new.port as i64)
        .bind(&new.ssh_user)
        .bind(&new.acme_email)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_host(id).await?.ok_or(Error::NotFound("host"))
    }

    pub async fn get_host(&self, id: Uuid) -> Result<Option<Host>> {
        sqlx::query_as("SELECT * FROM servers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        sqlx::query_as("SELECT * FROM servers")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn set_host_status(&self, id: Uuid, status: HostStatus) -> Result<()> {
        sqlx::query("UPDATE servers SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn store_cert_bundle(&self, id: Uuid, bundle: &str) -> Result<()> {
        sqlx::query("UPDATE servers SET cert_bundle = ?, updated_at = ? WHERE id = ?")
            .bind(bundle)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Registration: a heartbeat that also records what the agent reported
    /// about its host.
    pub async fn record_registration(
        &self,
        id: Uuid,
        agent_version: &str,
        system_info: Option<&serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<Option<Host>> {
        let previous = self.record_heartbeat(id, agent_version, at).await?;
        if previous.is_some() {
            sqlx::query("UPDATE servers SET system_info = ? WHERE id = ?")
                .bind(system_info.map(|v| v.to_string()))
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        }
        Ok(previous)
    }

    /// Record a heartbeat (or registration), returning the host as it was
    /// before so callers can tell whether it just came back online.
    pub async fn record_heartbeat(
        &self,
        id: Uuid,
        agent_version: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Host>> {
        let previous = self.get_host(id).await?;
        if previous.is_none() {
            return Ok(None);
        }

        sqlx::query(
            "UPDATE servers SET status = 'online', agent_version = ?, last_heartbeat = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(agent_version)
        .bind(at)
        .bind(at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(previous)
    }

    /// Flip hosts whose last heartbeat fell outside the liveness window to
    /// offline, returning the ones that changed.
    pub async fn mark_stale_offline(&self, window: Duration) -> Result<Vec<Host>> {
        let cutoff = Utc::now() - window;

        sqlx::query_as(
            "UPDATE servers SET status = 'offline', updated_at = ? \
             WHERE status = 'online' AND (last_heartbeat IS NULL OR last_heartbeat < ?) \
             RETURNING *",
        )
        .bind(Utc::now())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Queue an agent update. The partial unique index admits one in-flight
    /// job per host.
    pub async fn enqueue_agent_update(
        &self,
        host_id: Uuid,
        version: &str,
        download_url: &str,
    ) -> Result<UpdateJob> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let result = sqlx::query_as(
            "INSERT INTO agent_update_jobs (id, host_id, requested_version, download_url, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'enqueued', ?, ?) RETURNING *",
        )
        .bind(id.to_string())
        .bind(host_id.to_string())
        .bind(version)
        .bind(download_url)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(job) => Ok(job),
            Err(e) if is_unique_violation(&e) => Err(Error::UpdateInFlight),
            Err(e) => Err(e.into()),
        }
    }

    /// The command a heartbeat should deliver, if any.
    pub async fn next_enqueued_update(&self, host_id: Uuid) -> Result<Option<UpdateJob>> {
        sqlx::query_as(
            "SELECT * FROM agent_update_jobs WHERE host_id = ? AND status = 'enqueued' \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(host_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn mark_update_delivered(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE agent_update_jobs SET status = 'delivered', updated_at = ? \
             WHERE id = ? AND status = 'enqueued'",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A heartbeat reporting `version` confirms any delivered job that
    /// requested it.
    pub async fn complete_update_for_version(
        &self,
        host_id: Uuid,
        version: &str,
    ) -> Result<Option<UpdateJob>> {
        sqlx::query_as(
            "UPDATE agent_update_jobs SET status = 'updated', updated_at = ? \
             WHERE host_id = ? AND status = 'delivered' AND requested_version = ? \
             RETURNING *",
        )
        .bind(Utc::now())
        .bind(host_id.to_string())
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Jobs delivered longer ago than `deadline` never produced a heartbeat
    /// from the new version; they are failed.
    pub async fn fail_stale_updates(&self, deadline: Duration) -> Result<Vec<UpdateJob>> {
        let cutoff = Utc::now() - deadline;

        sqlx::query_as(
            "UPDATE agent_update_jobs SET status = 'error', error_message = 'update timed out', updated_at = ? \
             WHERE status = 'delivered' AND updated_at < ? \
             RETURNING *",
        )
        .bind(Utc::now())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use paasdeploy_common::host::{HostStatus, UpdateJobStatus};

    use super::NewHost;
    use crate::persistence::Persistence;

    fn new_host() -> NewHost {
        NewHost {
            name: Some("worker-1".to_string()),
            address: "10.0.0.7".to_string(),
            port: 7646,
            ssh_user: Some("deploy".to_string()),
            acme_email: None,
        }
    }

    #[tokio::test]
    async fn heartbeat_brings_host_online() {
        let p = Persistence::new_in_memory().await.unwrap();
        let host = p.create_host(new_host()).await.unwrap();
        assert_eq!(host.status, HostStatus::Pending);

        let previous = p
            .record_heartbeat(host.id, "0.3.0", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous.status, HostStatus::Pending);

        let current = p.get_host(host.id).await.unwrap().unwrap();
        assert_eq!(current.status, HostStatus::Online);
        assert_eq!(current.agent_version.as_deref(), Some("0.3.0"));
    }

    #[tokio::test]
    async fn stale_hosts_go_offline() {
        let p = Persistence::new_in_memory().await.unwrap();
        let host = p.create_host(new_host()).await.unwrap();

        let stale = Utc::now() - Duration::seconds(300);
        p.record_heartbeat(host.id, "0.3.0", stale).await.unwrap();

        let flipped = p.mark_stale_offline(Duration::seconds(90)).await.unwrap();
        assert_eq!(flipped.len(), 1);
        assert_eq!(
            p.get_host(host.id).await.unwrap().unwrap().status,
            HostStatus::Offline
        );

        // a second sweep finds nothing new
        assert!(p.mark_stale_offline(Duration::seconds(90)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_job_lifecycle() {
        let p = Persistence::new_in_memory().await.unwrap();
        let host = p.create_host(new_host()).await.unwrap();

        let job = p
            .enqueue_agent_update(host.id, "0.4.0", "https://dl.example.com/agent-0.4.0")
            .await
            .unwrap();
        assert_eq!(job.status, UpdateJobStatus::Enqueued);

        // only one in-flight job per host
        assert!(p
            .enqueue_agent_update(host.id, "0.5.0", "https://dl.example.com/agent-0.5.0")
            .await
            .is_err());

        let pending = p.next_enqueued_update(host.id).await.unwrap().unwrap();
        assert_eq!(pending.id, job.id);
        p.mark_update_delivered(job.id).await.unwrap();

        // a heartbeat from the old version confirms nothing
        assert!(p
            .complete_update_for_version(host.id, "0.3.0")
            .await
            .unwrap()
            .is_none());

        let done = p
            .complete_update_for_version(host.id, "0.4.0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, UpdateJobStatus::Updated);
    }

    #[tokio::test]
    async fn delivered_jobs_time_out() {
        let p = Persistence::new_in_memory().await.unwrap();
        let host = p.create_host(new_host()).await.unwrap();

        let job = p
            .enqueue_agent_update(host.id, "0.4.0", "https://dl.example.com/agent")
            .await
            .unwrap();
        p.mark_update_delivered(job.id).await.unwrap();

        // a generous deadline keeps the job alive
        assert!(p
            .fail_stale_updates(Duration::minutes(5))
            .await
            .unwrap()
            .is_empty());

        // a zero deadline expires it
        let failed = p.fail_stale_updates(Duration::zero()).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, UpdateJobStatus::Error);
    }
}
