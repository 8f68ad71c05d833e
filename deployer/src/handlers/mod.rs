//! The in-scope HTTP surface: webhook ingest and the SSE event stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{self, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::events::{EventBus, TopicFilter};
use crate::persistence::Persistence;
use crate::webhook::{IngestOutcome, WebhookIngest};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub fn make_router(
    persistence: Persistence,
    ingest: Arc<WebhookIngest>,
    bus: Arc<EventBus>,
) -> Router {
    Router::new()
        .route("/webhooks/github", post(receive_webhook))
        .route("/apps/:name/deployments", post(trigger_deployment))
        .route("/events", get(events))
        .layer(Extension(persistence))
        .layer(Extension(ingest))
        .layer(Extension(bus))
}

async fn receive_webhook(
    Extension(ingest): Extension<Arc<WebhookIngest>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

    let delivery_id = header("x-github-delivery");
    let event = header("x-github-event").unwrap_or("push");
    let signature = header("x-hub-signature-256");

    match ingest.handle(delivery_id, event, signature, &body).await {
        Ok(outcome) => {
            let status =
                StatusCode::from_u16(outcome.http_status()).unwrap_or(StatusCode::OK);
            let body = match &outcome {
                IngestOutcome::Queued(id) => json!({
                    "outcome": outcome.label(),
                    "deployment_id": id,
                }),
                IngestOutcome::Ignored(reason) => json!({
                    "outcome": outcome.label(),
                    "reason": reason,
                }),
                _ => json!({ "outcome": outcome.label() }),
            };
            (status, Json(body))
        }
        Err(e) => {
            error!(error = %e, "webhook ingest failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "outcome": "error" })),
            )
        }
    }
}

/// Manual trigger: enqueue a deployment of the given commit (or the tracked
/// branch head, resolved agent-side when the sha is a branch name).
#[derive(Deserialize)]
struct TriggerRequest {
    commit_sha: String,
    #[serde(default)]
    commit_message: String,
}

async fn trigger_deployment(
    Extension(persistence): Extension<Persistence>,
    Path(name): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> impl IntoResponse {
    let app = match persistence.find_app_by_name(&name).await {
        Ok(Some(app)) => app,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "unknown app" })),
            )
        }
        Err(e) => {
            error!(error = %e, "trigger lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            );
        }
    };

    match persistence
        .create_deployment(app.id, &request.commit_sha, &request.commit_message)
        .await
    {
        Ok(deployment) => (
            StatusCode::ACCEPTED,
            Json(json!({ "deployment_id": deployment.id })),
        ),
        Err(crate::error::Error::DeploymentPending) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "deployment pending" })),
        ),
        Err(e) => {
            error!(error = %e, "trigger failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            )
        }
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    topic: Option<String>,
}

/// Server-sent events bridged from a bus subscription. Dropping the HTTP
/// connection drops the stream, which drops the subscription, which is all
/// the cleanup the broker needs.
async fn events(
    Extension(bus): Extension<Arc<EventBus>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    let filter = TopicFilter::parse(query.topic.as_deref().unwrap_or("*"));
    let subscription = bus.subscribe(filter);

    let stream = futures::stream::unfold(subscription, |subscription| async move {
        let event = subscription.next().await?;
        let sse_event = sse::Event::default()
            .event(event.name())
            .json_data(&event)
            .ok()?;
        Some((Ok(sse_event), subscription))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE)
            .text("keep-alive"),
    )
}
