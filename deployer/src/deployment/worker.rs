//! One worker: claim, drive the agent through the pipeline, record the
//! terminal state, roll back on failure.

use std::time::Duration;

use chrono::Utc;
use paasdeploy_common::deployment::{ErrorKind, Stage, Status};
use paasdeploy_common::event::{DeployEvent, Event};
use paasdeploy_common::image_tag;
use paasdeploy_proto::agent::{
    CleanupImagesRequest, ComposeDownRequest, DeployLogsRequest, DeployRequest,
};
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{AgentTarget, WorkerContext};
use crate::agent::client::retry_unary;
use crate::persistence::Deployment;

/// How long a worker sleeps when the queue has nothing claimable.
const CLAIM_BACKOFF: Duration = Duration::from_secs(1);

/// How long we wait for the log stream to drain after the deploy call
/// returned.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) async fn run(index: usize, ctx: WorkerContext, shutdown: CancellationToken) {
    info!(worker = index, "worker started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match ctx.persistence.claim_one().await {
            Ok(Some(deployment)) => {
                info!(worker = index, deployment_id = %deployment.id, "claimed deployment");
                process(&ctx, deployment, &shutdown).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(CLAIM_BACKOFF) => {}
                }
            }
            Err(e) => {
                error!(worker = index, error = %e, "claim failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(CLAIM_BACKOFF) => {}
                }
            }
        }
    }

    info!(worker = index, "worker stopped");
}

/// What went wrong, where, and whether the compose project should be taken
/// down so no traffic reaches a broken container.
struct Failure {
    stage: Option<Stage>,
    kind: ErrorKind,
    message: String,
    rollback: bool,
}

impl Failure {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            stage: None,
            kind: ErrorKind::Internal,
            message: message.into(),
            rollback: false,
        }
    }
}

#[instrument(skip(ctx, deployment, shutdown), fields(deployment_id = %deployment.id, app_id = %deployment.app_id))]
async fn process(ctx: &WorkerContext, deployment: Deployment, shutdown: &CancellationToken) {
    publish_state(ctx, &deployment, Status::Running, None, None, None);

    // A cancelled context aborts the in-flight RPC, but the row must still
    // reach a terminal state before the worker lets go of it.
    let outcome = tokio::select! {
        outcome = run_deployment(ctx, &deployment) => outcome,
        _ = shutdown.cancelled() => Err(Failure {
            stage: None,
            kind: ErrorKind::Cancelled,
            message: "cancelled by shutdown".to_string(),
            rollback: false,
        }),
    };

    match outcome {
        Ok(tag) => {
            match ctx
                .persistence
                .complete_deployment(deployment.id, Status::Success, Some(&tag), None)
                .await
            {
                Ok(_) => {
                    info!(%tag, "deployment succeeded");
                    publish_state(ctx, &deployment, Status::Success, Some(Stage::Complete), None, None);
                    spawn_image_cleanup(ctx.clone(), &deployment, tag);
                }
                Err(e) => error!(error = %e, "failed to record success"),
            }
        }
        Err(failure) => {
            let message = match failure.stage {
                Some(stage) => format!("{stage}: {}", failure.message),
                None => failure.message.clone(),
            };

            if let Err(e) = ctx
                .persistence
                .complete_deployment(deployment.id, Status::Failed, None, Some(&message))
                .await
            {
                error!(error = %e, "failed to record failure");
            }

            warn!(stage = ?failure.stage, kind = %failure.kind, %message, "deployment failed");
            publish_state(
                ctx,
                &deployment,
                Status::Failed,
                failure.stage,
                Some(failure.kind),
                Some(message),
            );

            if failure.rollback {
                rollback(ctx, &deployment).await;
            }
        }
    }
}

async fn run_deployment(ctx: &WorkerContext, deployment: &Deployment) -> Result<String, Failure> {
    let app = ctx
        .persistence
        .get_app(deployment.app_id)
        .await
        .map_err(|e| Failure::internal(e.to_string()))?
        .ok_or_else(|| Failure::internal("app no longer exists"))?;

    let target = resolve_target(ctx, app.host_id).await?;

    // remember what we could fall back to before anything changes
    if let Ok(Some(previous)) = ctx.persistence.find_latest_success(app.id).await {
        if let Some(tag) = previous.current_image_tag.as_deref() {
            let _ = ctx.persistence.set_previous_image_tag(deployment.id, tag).await;
        }
    }

    let tag = image_tag(&ctx.registry_prefix, &app.name, &deployment.commit_sha);
    let env = ctx
        .persistence
        .env_vars(app.id)
        .await
        .map_err(|e| Failure::internal(e.to_string()))?;

    let client = ctx
        .pool
        .client(&target.address, target.port, &target.server_name)
        .await
        .map_err(|e| Failure {
            stage: Some(Stage::Deploy),
            kind: ErrorKind::AgentUnreachable,
            message: e.to_string(),
            rollback: false,
        })?;

    // logs flow on their own stream; entries reach the bus and the row in
    // the order the executor emitted them
    let forwarder = tokio::spawn(forward_logs(ctx.clone(), client.clone(), deployment.id));

    let request = DeployRequest {
        deployment_id: deployment.id.to_string(),
        app_name: app.name.clone(),
        repo_url: app.repo_url.clone(),
        branch: app.branch.clone(),
        commit_sha: deployment.commit_sha.clone(),
        subdir: app.subdir.clone().unwrap_or_default(),
        image_tag: tag,
        env: env.into_iter().collect(),
    };

    let response = retry_unary(|| {
        let mut client = client.clone();
        let request = request.clone();
        async move { client.execute_deploy(request).await.map(|r| r.into_inner()) }
    })
    .await;

    // let the tail of the log stream land before moving on
    let _ = tokio::time::timeout(LOG_DRAIN_TIMEOUT, forwarder).await;

    match response {
        Err(status) => {
            ctx.pool.flag_unhealthy(&target.address, target.port).await;
            Err(Failure {
                stage: Some(Stage::Deploy),
                kind: status_kind(status.code()),
                message: status.message().to_string(),
                rollback: false,
            })
        }
        Ok(response) if response.success => Ok(response.image_tag),
        Ok(response) => {
            let stage = paasdeploy_proto::agent::DeployStage::try_from(response.failed_stage)
                .ok()
                .and_then(|s| s.into_stage());
            Err(Failure {
                stage,
                kind: stage_kind(stage, &response.error),
                message: response.error,
                rollback: matches!(stage, Some(Stage::Deploy) | Some(Stage::HealthCheck)),
            })
        }
    }
}

async fn resolve_target(ctx: &WorkerContext, host_id: Option<Uuid>) -> Result<AgentTarget, Failure> {
    let Some(host_id) = host_id else {
        return Ok(ctx.local_agent.clone());
    };

    let host = ctx
        .persistence
        .get_host(host_id)
        .await
        .map_err(|e| Failure::internal(e.to_string()))?
        .ok_or_else(|| Failure {
            stage: Some(Stage::Deploy),
            kind: ErrorKind::AgentUnreachable,
            message: "assigned host no longer exists".to_string(),
            rollback: false,
        })?;

    Ok(AgentTarget {
        server_name: host.name.clone().unwrap_or_else(|| host.address.clone()),
        address: host.address,
        port: host.port,
    })
}

async fn forward_logs(
    ctx: WorkerContext,
    client: paasdeploy_proto::agent::agent_client::AgentClient<tonic::transport::Channel>,
    deployment_id: Uuid,
) {
    let subscription = retry_unary(|| {
        let mut client = client.clone();
        let request = DeployLogsRequest {
            deployment_id: deployment_id.to_string(),
        };
        async move { client.stream_deploy_logs(request).await }
    })
    .await;

    let mut stream = match subscription {
        Ok(response) => response.into_inner(),
        Err(e) => {
            warn!(error = %e, "could not subscribe to deploy logs");
            return;
        }
    };

    while let Ok(Some(entry)) = stream.message().await {
        if let Some(item) = entry.into_item() {
            let _ = ctx
                .persistence
                .append_deployment_log(deployment_id, &item.message)
                .await;
            ctx.bus.publish(Event::Log(item));
        }
    }
}

/// Failure path: bring the compose project down so routing stops sending
/// traffic to a broken container. The previous image tag stays recorded on
/// the row but is not redeployed.
async fn rollback(ctx: &WorkerContext, deployment: &Deployment) {
    let Ok(Some(app)) = ctx.persistence.get_app(deployment.app_id).await else {
        return;
    };
    let Ok(target) = resolve_target(ctx, app.host_id).await else {
        return;
    };
    let Ok(client) = ctx
        .pool
        .client(&target.address, target.port, &target.server_name)
        .await
    else {
        return;
    };

    let result = retry_unary(|| {
        let mut client = client.clone();
        let request = crate::agent::client::with_deadline(ComposeDownRequest {
            app_name: app.name.clone(),
        });
        async move { client.compose_down(request).await }
    })
    .await;

    match result {
        Ok(_) => info!(app = %app.name, "brought broken deployment down"),
        Err(e) => warn!(app = %app.name, error = %e, "rollback compose-down failed"),
    }
}

/// Best-effort tag cleanup after a success; never blocks the worker.
fn spawn_image_cleanup(ctx: WorkerContext, deployment: &Deployment, keep_tag: String) {
    let app_id = deployment.app_id;

    tokio::spawn(async move {
        let Ok(Some(app)) = ctx.persistence.get_app(app_id).await else {
            return;
        };
        let Ok(target) = resolve_target(&ctx, app.host_id).await else {
            return;
        };
        let Ok(client) = ctx
            .pool
            .client(&target.address, target.port, &target.server_name)
            .await
        else {
            return;
        };

        let repository = format!("{}/{}", ctx.registry_prefix, app.name);
        let result = retry_unary(|| {
            let mut client = client.clone();
            let request = crate::agent::client::with_deadline(CleanupImagesRequest {
                repository: repository.clone(),
                keep_tag: keep_tag.clone(),
            });
            async move { client.cleanup_images(request).await }
        })
        .await;

        if let Err(e) = result {
            warn!(app = %app.name, error = %e, "image cleanup failed");
        }
    });
}

fn publish_state(
    ctx: &WorkerContext,
    deployment: &Deployment,
    status: Status,
    stage: Option<Stage>,
    error_kind: Option<ErrorKind>,
    error: Option<String>,
) {
    ctx.bus.publish(Event::Deploy(DeployEvent {
        deployment_id: deployment.id,
        app_id: deployment.app_id,
        status,
        stage,
        error_kind,
        error,
        timestamp: Utc::now(),
    }));
}

/// Transport-level status codes mapped onto the pipeline's failure kinds.
fn status_kind(code: Code) -> ErrorKind {
    match code {
        Code::Unavailable | Code::Unknown => ErrorKind::AgentUnreachable,
        Code::DeadlineExceeded => ErrorKind::Timeout,
        Code::Cancelled => ErrorKind::Cancelled,
        _ => ErrorKind::Internal,
    }
}

/// Stage-reported failures mapped onto failure kinds; a contract complaint
/// is a configuration problem wherever it surfaces.
fn stage_kind(stage: Option<Stage>, message: &str) -> ErrorKind {
    if message.contains("contract") {
        return ErrorKind::ConfigInvalid;
    }

    match stage {
        Some(Stage::GitSync) => ErrorKind::GitCloneFailed,
        Some(Stage::Build) => ErrorKind::BuildFailed,
        Some(Stage::Deploy) => ErrorKind::ContainerStartFailed,
        Some(Stage::HealthCheck) => ErrorKind::HealthCheckFailed,
        Some(Stage::Complete) | None => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use paasdeploy_common::deployment::{ErrorKind, Stage};
    use tonic::Code;

    use super::{stage_kind, status_kind};

    #[test]
    fn transport_codes_map_to_kinds() {
        assert_eq!(status_kind(Code::Unavailable), ErrorKind::AgentUnreachable);
        assert_eq!(status_kind(Code::DeadlineExceeded), ErrorKind::Timeout);
        assert_eq!(status_kind(Code::Cancelled), ErrorKind::Cancelled);
        assert_eq!(status_kind(Code::Internal), ErrorKind::Internal);
    }

    #[test]
    fn stages_map_to_kinds() {
        assert_eq!(
            stage_kind(Some(Stage::GitSync), "clone failed"),
            ErrorKind::GitCloneFailed
        );
        assert_eq!(
            stage_kind(Some(Stage::Build), "no space left"),
            ErrorKind::BuildFailed
        );
        assert_eq!(
            stage_kind(Some(Stage::HealthCheck), "status 500"),
            ErrorKind::HealthCheckFailed
        );
        assert_eq!(
            stage_kind(Some(Stage::GitSync), "invalid app contract: bad name"),
            ErrorKind::ConfigInvalid
        );
        assert_eq!(stage_kind(None, "??"), ErrorKind::Internal);
    }
}
