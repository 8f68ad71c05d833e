use chrono::{DateTime, Utc};
use paasdeploy_common::deployment::Status;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use super::{is_unique_violation, parse_uuid, Persistence};
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct Deployment {
    pub id: Uuid,
    pub app_id: Uuid,
    pub commit_sha: String,
    pub commit_message: String,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub log_text: String,
    pub previous_image_tag: Option<String>,
    pub current_image_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for Deployment {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            app_id: parse_uuid(row.try_get("app_id")?)?,
            commit_sha: row.try_get("commit_sha")?,
            commit_message: row.try_get("commit_message")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            error_message: row.try_get("error_message")?,
            log_text: row.try_get("log_text")?,
            previous_image_tag: row.try_get("previous_image_tag")?,
            current_image_tag: row.try_get("current_image_tag")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Persistence {
    /// Insert a pending deployment. The partial unique index turns a second
    /// pending row for the same app into [`Error::DeploymentPending`], which
    /// is what makes webhook dedup race-free.
    pub async fn create_deployment(
        &self,
        app_id: Uuid,
        commit_sha: &str,
        commit_message: &str,
    ) -> Result<Deployment> {
        let id = Uuid::new_v4();
        let sha: String = commit_sha.chars().take(40).collect();

        let result = sqlx::query_as(
            "INSERT INTO deployments (id, app_id, commit_sha, commit_message, status, created_at) \
             VALUES (?, ?, ?, ?, 'pending', ?) RETURNING *",
        )
        .bind(id.to_string())
        .bind(app_id.to_string())
        .bind(sha)
        .bind(commit_message)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(deployment) => Ok(deployment),
            Err(e) if is_unique_violation(&e) => Err(Error::DeploymentPending),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim the oldest pending deployment whose app has nothing
    /// running, flipping it to running. A single statement, so concurrent
    /// workers can never claim the same row or overlap deployments of one
    /// app.
    pub async fn claim_one(&self) -> Result<Option<Deployment>> {
        sqlx::query_as(
            "UPDATE deployments SET status = 'running', started_at = ?1 \
             WHERE id = ( \
                 SELECT d.id FROM deployments d \
                 WHERE d.status = 'pending' \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM deployments r \
                       WHERE r.app_id = d.app_id AND r.status = 'running' \
                   ) \
                 ORDER BY d.created_at ASC, d.rowid ASC \
                 LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Move a claimed deployment to a terminal status. Rows already terminal
    /// are left untouched and reported as [`Error::IllegalTransition`].
    pub async fn complete_deployment(
        &self,
        id: Uuid,
        status: Status,
        image_tag: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<Deployment> {
        if !status.is_terminal() {
            return Err(Error::IllegalTransition {
                from: Status::Running,
                to: status,
            });
        }

        let updated: Option<Deployment> = sqlx::query_as(
            "UPDATE deployments \
             SET status = ?, finished_at = ?, error_message = ?, \
                 current_image_tag = COALESCE(?, current_image_tag) \
             WHERE id = ? AND status IN ('pending', 'running') \
             RETURNING *",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(error_message)
        .bind(image_tag)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(deployment) => Ok(deployment),
            None => {
                let current = self
                    .get_deployment(id)
                    .await?
                    .ok_or(Error::NotFound("deployment"))?;
                Err(Error::IllegalTransition {
                    from: current.status,
                    to: status,
                })
            }
        }
    }

    pub async fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_pending_by_app(&self, app_id: Uuid) -> Result<Option<Deployment>> {
        sqlx::query_as("SELECT * FROM deployments WHERE app_id = ? AND status = 'pending'")
            .bind(app_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// The most recent successful deployment of an app, used to record the
    /// image a failed deployment could be rolled back to.
    pub async fn find_latest_success(&self, app_id: Uuid) -> Result<Option<Deployment>> {
        sqlx::query_as(
            "SELECT * FROM deployments WHERE app_id = ? AND status = 'success' \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(app_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Latest deployment per app, for list pages.
    pub async fn find_most_recent_by_apps(&self, app_ids: &[Uuid]) -> Result<Vec<Deployment>> {
        if app_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; app_ids.len()].join(", ");
        let query = format!(
            "SELECT d.* FROM deployments d \
             JOIN ( \
                 SELECT app_id, MAX(created_at) AS latest FROM deployments \
                 WHERE app_id IN ({placeholders}) GROUP BY app_id \
             ) recent ON recent.app_id = d.app_id AND recent.latest = d.created_at"
        );

        let mut q = sqlx::query_as(&query);
        for id in app_ids {
            q = q.bind(id.to_string());
        }

        q.fetch_all(&self.pool).await.map_err(Into::into)
    }

    pub async fn set_previous_image_tag(&self, id: Uuid, tag: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET previous_image_tag = ? WHERE id = ?")
            .bind(tag)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn append_deployment_log(&self, id: Uuid, line: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET log_text = log_text || ? || char(10) WHERE id = ?")
            .bind(line)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Startup recovery: any row still `running` was orphaned by a crash and
    /// can never finish, so it is failed outright.
    pub async fn fail_orphaned_running(&self, reason: &str) -> Result<Vec<Deployment>> {
        sqlx::query_as(
            "UPDATE deployments SET status = 'failed', finished_at = ?, error_message = ? \
             WHERE status = 'running' RETURNING *",
        )
        .bind(Utc::now())
        .bind(reason)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use paasdeploy_common::deployment::Status;

    use crate::error::Error;
    use crate::persistence::{NewApp, Persistence};

    async fn fixture() -> (Persistence, crate::persistence::App) {
        let p = Persistence::new_in_memory().await.unwrap();
        let app = p
            .create_app(NewApp {
                name: "api".to_string(),
                repo_url: "https://github.com/acme/api.git".to_string(),
                branch: "main".to_string(),
                subdir: None,
                host_id: None,
                webhook_id: None,
            })
            .await
            .unwrap();
        (p, app)
    }

    #[tokio::test]
    async fn only_one_pending_per_app() {
        let (p, app) = fixture().await;

        p.create_deployment(app.id, "abc123", "first").await.unwrap();
        let second = p.create_deployment(app.id, "def456", "second").await;

        assert!(matches!(second, Err(Error::DeploymentPending)));
    }

    #[tokio::test]
    async fn claim_is_exclusive_per_app() {
        let (p, app) = fixture().await;

        let first = p.create_deployment(app.id, "abc123", "first").await.unwrap();
        let claimed = p.claim_one().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, Status::Running);
        assert!(claimed.started_at.is_some());

        // enqueue a second; its app still has a running deployment
        p.create_deployment(app.id, "def456", "second").await.unwrap();
        assert!(p.claim_one().await.unwrap().is_none());

        // once the first completes, the second becomes claimable
        p.complete_deployment(claimed.id, Status::Success, Some("registry/api:abc123"), None)
            .await
            .unwrap();
        let next = p.claim_one().await.unwrap().unwrap();
        assert_eq!(next.commit_sha, "def456");
    }

    #[tokio::test]
    async fn claims_respect_creation_order_across_apps() {
        let p = Persistence::new_in_memory().await.unwrap();
        let a = p
            .create_app(NewApp {
                name: "app-a".to_string(),
                repo_url: "https://github.com/acme/a.git".to_string(),
                branch: "main".to_string(),
                subdir: None,
                host_id: None,
                webhook_id: None,
            })
            .await
            .unwrap();
        let b = p
            .create_app(NewApp {
                name: "app-b".to_string(),
                repo_url: "https://github.com/acme/b.git".to_string(),
                branch: "main".to_string(),
                subdir: None,
                host_id: None,
                webhook_id: None,
            })
            .await
            .unwrap();

        p.create_deployment(a.id, "aaa", "").await.unwrap();
        p.create_deployment(b.id, "bbb", "").await.unwrap();

        // both apps are free, so both rows are claimable without overlap
        let first = p.claim_one().await.unwrap().unwrap();
        let second = p.claim_one().await.unwrap().unwrap();
        assert_ne!(first.app_id, second.app_id);
        assert!(p.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_rows_are_immutable() {
        let (p, app) = fixture().await;

        p.create_deployment(app.id, "abc123", "").await.unwrap();
        let claimed = p.claim_one().await.unwrap().unwrap();
        p.complete_deployment(claimed.id, Status::Failed, None, Some("build broke"))
            .await
            .unwrap();

        let again = p
            .complete_deployment(claimed.id, Status::Success, None, None)
            .await;
        assert!(matches!(again, Err(Error::IllegalTransition { .. })));

        let row = p.get_deployment(claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, Status::Failed);
        assert_eq!(row.error_message.as_deref(), Some("build broke"));
        assert!(row.finished_at.is_some());
    }

    #[tokio::test]
    async fn non_terminal_complete_is_rejected() {
        let (p, app) = fixture().await;
        let d = p.create_deployment(app.id, "abc123", "").await.unwrap();

        let result = p.complete_deployment(d.id, Status::Running, None, None).await;
        assert!(matches!(result, Err(Error::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn latest_success_feeds_rollback() {
        let (p, app) = fixture().await;

        for (sha, status) in [
            ("aaa", Status::Success),
            ("bbb", Status::Failed),
            ("ccc", Status::Success),
        ] {
            p.create_deployment(app.id, sha, "").await.unwrap();
            let claimed = p.claim_one().await.unwrap().unwrap();
            p.complete_deployment(claimed.id, status, Some(&format!("registry/api:{sha}")), None)
                .await
                .unwrap();
        }

        let latest = p.find_latest_success(app.id).await.unwrap().unwrap();
        assert_eq!(latest.commit_sha, "ccc");
    }

    #[tokio::test]
    async fn orphaned_running_rows_are_failed_on_startup() {
        let (p, app) = fixture().await;

        p.create_deployment(app.id, "abc123", "").await.unwrap();
        p.claim_one().await.unwrap().unwrap();

        let recovered = p.fail_orphaned_running("interrupted by restart").await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, Status::Failed);

        assert!(p.fail_orphaned_running("again").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_text_accumulates() {
        let (p, app) = fixture().await;
        let d = p.create_deployment(app.id, "abc123", "").await.unwrap();

        p.append_deployment_log(d.id, "cloning").await.unwrap();
        p.append_deployment_log(d.id, "building").await.unwrap();

        let row = p.get_deployment(d.id).await.unwrap().unwrap();
        assert_eq!(row.log_text, "cloning\nbuilding\n");
    }
}
