//! Push-webhook ingest: audit, verify, resolve, deduplicate, enqueue.

use ring::hmac;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::persistence::Persistence;

/// Commit messages recorded on the deployment row are capped at this many
/// characters of their first line.
pub const MAX_COMMIT_MESSAGE: usize = 200;

/// A push to a deleted branch carries the null sha.
const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// What became of one delivery. The label is what lands in the audit row;
/// the HTTP layer maps outcomes onto status codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued(Uuid),
    Ignored(String),
    InvalidSignature,
    Duplicate,
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Queued(_) => "deployment_queued",
            IngestOutcome::Ignored(_) => "ignored",
            IngestOutcome::InvalidSignature => "invalid_signature",
            IngestOutcome::Duplicate => "ignored",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            IngestOutcome::Queued(_) => 202,
            IngestOutcome::Ignored(_) | IngestOutcome::Duplicate => 200,
            IngestOutcome::InvalidSignature => 401,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    deleted: Option<bool>,
    #[serde(default)]
    head_commit: Option<HeadCommit>,
    #[serde(default)]
    repository: Option<Repository>,
}

#[derive(Debug, Deserialize)]
struct HeadCommit {
    id: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    #[serde(default)]
    clone_url: Option<String>,
    #[serde(default)]
    ssh_url: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

pub struct WebhookIngest {
    persistence: Persistence,
    secret: String,
}

impl WebhookIngest {
    pub fn new(persistence: Persistence, secret: String) -> Self {
        Self { persistence, secret }
    }

    /// Process one delivery. Every step records its outcome on the audit
    /// row; errors here are isolated to the delivery and never poison the
    /// server.
    #[instrument(skip(self, signature, body))]
    pub async fn handle(
        &self,
        delivery_id: Option<&str>,
        event: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<IngestOutcome> {
        let delivery_id = delivery_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // step 1: the audit row, outcome `received`; a repeated delivery id
        // has already been handled
        let inserted = self
            .persistence
            .record_delivery(&delivery_id, event, &String::from_utf8_lossy(body))
            .await?;
        if !inserted {
            info!(%delivery_id, "duplicate delivery");
            return Ok(IngestOutcome::Duplicate);
        }

        let outcome = self.process(event, signature, body).await?;

        let error = match &outcome {
            IngestOutcome::Ignored(reason) => Some(reason.as_str()),
            IngestOutcome::InvalidSignature => Some("signature mismatch"),
            _ => None,
        };
        self.persistence
            .set_delivery_outcome(&delivery_id, outcome.label(), error)
            .await?;

        Ok(outcome)
    }

    async fn process(
        &self,
        event: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<IngestOutcome> {
        // step 2: only pushes produce deployments
        if event != "push" {
            return Ok(IngestOutcome::Ignored(format!("event '{event}' ignored")));
        }

        // step 3: the signature gate comes before any payload inspection
        if !verify_signature(&self.secret, signature, body) {
            warn!("webhook signature did not verify");
            return Ok(IngestOutcome::InvalidSignature);
        }

        // step 4: parse and pick the payload apart
        let payload: PushPayload = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => return Ok(IngestOutcome::Ignored(format!("malformed payload: {e}"))),
        };

        let Some(branch) = payload.git_ref.strip_prefix("refs/heads/") else {
            return Ok(IngestOutcome::Ignored(format!(
                "ref '{}' is not a branch",
                payload.git_ref
            )));
        };

        if payload.deleted == Some(true) {
            return Ok(IngestOutcome::Ignored("branch was deleted".to_string()));
        }

        let commit_sha = payload
            .head_commit
            .as_ref()
            .map(|c| c.id.clone())
            .or_else(|| payload.after.clone())
            .filter(|sha| !sha.is_empty() && sha != ZERO_SHA);
        let Some(commit_sha) = commit_sha else {
            return Ok(IngestOutcome::Ignored("push carries no commit".to_string()));
        };

        // steps 5-6: resolve the app by any spelling of the repository URL
        let variants = payload
            .repository
            .as_ref()
            .map(repo_url_variants)
            .unwrap_or_default();
        let Some(app) = self.persistence.find_app_by_repo_urls(&variants).await? else {
            return Ok(IngestOutcome::Ignored("no app for repository".to_string()));
        };

        if app.branch != branch {
            return Ok(IngestOutcome::Ignored(format!(
                "branch '{branch}' not tracked"
            )));
        }

        // step 7: one pending deployment per app
        if self.persistence.find_pending_by_app(app.id).await?.is_some() {
            return Ok(IngestOutcome::Ignored("deployment pending".to_string()));
        }

        // step 8: enqueue; a concurrent delivery losing the insert race gets
        // the same answer as step 7
        let message = payload
            .head_commit
            .as_ref()
            .and_then(|c| c.message.as_deref())
            .map(truncate_message)
            .unwrap_or_default();

        match self
            .persistence
            .create_deployment(app.id, &commit_sha, &message)
            .await
        {
            Ok(deployment) => {
                info!(app = %app.name, commit = %commit_sha, "deployment queued");
                Ok(IngestOutcome::Queued(deployment.id))
            }
            Err(Error::DeploymentPending) => {
                Ok(IngestOutcome::Ignored("deployment pending".to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Constant-time HMAC-SHA-256 verification of the `sha256=<hex>` header.
fn verify_signature(secret: &str, signature: Option<&str>, body: &[u8]) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let hex_digest = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(digest) = hex::decode(hex_digest) else {
        return false;
    };

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &digest).is_ok()
}

/// First line only, capped at [`MAX_COMMIT_MESSAGE`] characters.
fn truncate_message(message: &str) -> String {
    message
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(MAX_COMMIT_MESSAGE)
        .collect()
}

/// Every URL form a provider may put in a payload, each with and without
/// the `.git` suffix.
fn repo_url_variants(repository: &Repository) -> Vec<String> {
    let mut variants = Vec::new();

    for url in [
        repository.clone_url.as_deref(),
        repository.ssh_url.as_deref(),
        repository.html_url.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        variants.push(url.to_string());
        match url.strip_suffix(".git") {
            Some(stripped) => variants.push(stripped.to_string()),
            None => variants.push(format!("{url}.git")),
        }
    }

    variants.dedup();
    variants
}

#[cfg(test)]
mod tests {
    use paasdeploy_common::deployment::Status;
    use ring::hmac;

    use super::{truncate_message, IngestOutcome, WebhookIngest, MAX_COMMIT_MESSAGE};
    use crate::persistence::{NewApp, Persistence};

    const SECRET: &str = "s3cret";

    fn sign(body: &[u8]) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, SECRET.as_bytes());
        format!("sha256={}", hex::encode(hmac::sign(&key, body)))
    }

    fn push_body(git_ref: &str, sha: &str) -> Vec<u8> {
        serde_json::json!({
            "ref": git_ref,
            "after": sha,
            "head_commit": {"id": sha, "message": "fix the flux capacitor\n\nlong body"},
            "repository": {
                "clone_url": "https://github.com/acme/api.git",
                "ssh_url": "git@github.com:acme/api.git",
                "html_url": "https://github.com/acme/api"
            }
        })
        .to_string()
        .into_bytes()
    }

    async fn fixture() -> (WebhookIngest, Persistence) {
        let persistence = Persistence::new_in_memory().await.unwrap();
        persistence
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

        (
            WebhookIngest::new(persistence.clone(), SECRET.to_string()),
            persistence,
        )
    }

    #[tokio::test]
    async fn happy_path_queues_one_deployment() {
        let (ingest, persistence) = fixture().await;
        let body = push_body("refs/heads/main", "abc123abc123abc123");

        let outcome = ingest
            .handle(Some("d-1"), "push", Some(&sign(&body)), &body)
            .await
            .unwrap();

        let IngestOutcome::Queued(id) = outcome else {
            panic!("expected a queued deployment, got {outcome:?}");
        };

        let deployment = persistence.get_deployment(id).await.unwrap().unwrap();
        assert_eq!(deployment.status, Status::Pending);
        assert_eq!(deployment.commit_sha, "abc123abc123abc123");
        assert_eq!(deployment.commit_message, "fix the flux capacitor");

        let audit = persistence.get_delivery("d-1").await.unwrap().unwrap();
        assert_eq!(audit.outcome, "deployment_queued");
    }

    #[tokio::test]
    async fn untracked_branch_is_ignored() {
        let (ingest, persistence) = fixture().await;
        let body = push_body("refs/heads/staging", "abc123");

        let outcome = ingest
            .handle(Some("d-1"), "push", Some(&sign(&body)), &body)
            .await
            .unwrap();

        assert!(matches!(outcome, IngestOutcome::Ignored(reason) if reason.contains("not tracked")));
        assert_eq!(
            persistence.get_delivery("d-1").await.unwrap().unwrap().outcome,
            "ignored"
        );
    }

    #[tokio::test]
    async fn bad_signature_never_creates_a_deployment() {
        let (ingest, persistence) = fixture().await;
        let body = push_body("refs/heads/main", "abc123");

        let outcome = ingest
            .handle(Some("d-1"), "push", Some("sha256=deadbeef"), &body)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::InvalidSignature);

        let missing = ingest.handle(Some("d-2"), "push", None, &body).await.unwrap();
        assert_eq!(missing, IngestOutcome::InvalidSignature);

        let app = persistence.find_app_by_name("api").await.unwrap().unwrap();
        assert!(persistence.find_pending_by_app(app.id).await.unwrap().is_none());
        assert_eq!(
            persistence.get_delivery("d-1").await.unwrap().unwrap().outcome,
            "invalid_signature"
        );
    }

    #[tokio::test]
    async fn pending_deployment_suppresses_duplicates() {
        let (ingest, _) = fixture().await;

        let first = push_body("refs/heads/main", "abc123");
        ingest
            .handle(Some("d-1"), "push", Some(&sign(&first)), &first)
            .await
            .unwrap();

        let second = push_body("refs/heads/main", "def456");
        let outcome = ingest
            .handle(Some("d-2"), "push", Some(&sign(&second)), &second)
            .await
            .unwrap();

        assert!(matches!(outcome, IngestOutcome::Ignored(reason) if reason == "deployment pending"));
    }

    #[tokio::test]
    async fn repeated_delivery_id_is_processed_once() {
        let (ingest, persistence) = fixture().await;
        let body = push_body("refs/heads/main", "abc123");

        ingest
            .handle(Some("d-1"), "push", Some(&sign(&body)), &body)
            .await
            .unwrap();
        let replay = ingest
            .handle(Some("d-1"), "push", Some(&sign(&body)), &body)
            .await
            .unwrap();

        assert_eq!(replay, IngestOutcome::Duplicate);

        // exactly one deployment exists
        let app = persistence.find_app_by_name("api").await.unwrap().unwrap();
        let pending = persistence.find_pending_by_app(app.id).await.unwrap();
        assert!(pending.is_some());
    }

    #[tokio::test]
    async fn branch_deletion_is_ignored() {
        let (ingest, _) = fixture().await;
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "0000000000000000000000000000000000000000",
            "deleted": true,
            "repository": {"clone_url": "https://github.com/acme/api.git"}
        })
        .to_string()
        .into_bytes();

        let outcome = ingest
            .handle(Some("d-1"), "push", Some(&sign(&body)), &body)
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored(reason) if reason.contains("deleted")));
    }

    #[tokio::test]
    async fn non_push_events_are_ignored_before_verification() {
        let (ingest, _) = fixture().await;
        let body = b"{}";

        let outcome = ingest.handle(Some("d-1"), "ping", None, body).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn unknown_repository_is_ignored() {
        let (ingest, _) = fixture().await;
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "head_commit": {"id": "abc123", "message": "m"},
            "repository": {"clone_url": "https://github.com/acme/unknown.git"}
        })
        .to_string()
        .into_bytes();

        let outcome = ingest
            .handle(Some("d-1"), "push", Some(&sign(&body)), &body)
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored(reason) if reason.contains("no app")));
    }

    #[test]
    fn commit_messages_are_first_line_capped() {
        assert_eq!(truncate_message("one\ntwo\nthree"), "one");

        let long = "x".repeat(MAX_COMMIT_MESSAGE + 50);
        assert_eq!(truncate_message(&long).len(), MAX_COMMIT_MESSAGE);
    }
}
