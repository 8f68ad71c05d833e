//! Notification fan-out: bus events × rules × channels → senders.

mod discord;
mod email;
mod slack;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use paasdeploy_common::container::{ContainerStatus, HealthVerdict};
use paasdeploy_common::deployment::Status;
use paasdeploy_common::event::Event;
use paasdeploy_common::host::UpdateJobStatus;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{EventBus, TopicFilter};
use crate::persistence::{ChannelType, Persistence};

pub use discord::DiscordSender;
pub use email::EmailSender;
pub use slack::SlackSender;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SendError(pub String);

/// The outbound message, already flattened for whatever transport a sender
/// speaks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub event_type: String,
    pub title: String,
    pub body: String,
}

/// One delivery transport. Implementations read their endpoint and
/// credentials from the channel's configuration blob.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(
        &self,
        config: &serde_json::Value,
        notification: &Notification,
    ) -> Result<(), SendError>;
}

pub struct Notifier {
    persistence: Persistence,
    senders: HashMap<ChannelType, Arc<dyn Sender>>,
}

impl Notifier {
    /// The production registry: one sender per channel type, sharing one
    /// HTTP client.
    pub fn new(persistence: Persistence) -> Arc<Self> {
        let http = reqwest::Client::new();
        let mut senders: HashMap<ChannelType, Arc<dyn Sender>> = HashMap::new();
        senders.insert(ChannelType::Slack, Arc::new(SlackSender::new(http.clone())));
        senders.insert(
            ChannelType::Discord,
            Arc::new(DiscordSender::new(http.clone())),
        );
        senders.insert(ChannelType::Email, Arc::new(EmailSender::new(http)));

        Arc::new(Self {
            persistence,
            senders,
        })
    }

    pub fn with_senders(
        persistence: Persistence,
        senders: HashMap<ChannelType, Arc<dyn Sender>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            persistence,
            senders,
        })
    }

    /// Fire every enabled rule matching the event. Sends run on their own
    /// tasks; a failing sender is logged and never blocks the producer.
    pub async fn dispatch(&self, app_id: Option<Uuid>, notification: Notification) {
        let matched = match self
            .persistence
            .rules_for_event(&notification.event_type, app_id)
            .await
        {
            Ok(matched) => matched,
            Err(e) => {
                warn!(error = %e, "could not resolve notification rules");
                return;
            }
        };

        for (rule, channel) in matched {
            let Some(sender) = self.senders.get(&channel.channel_type).cloned() else {
                warn!(channel_type = %channel.channel_type, "no sender registered");
                continue;
            };
            let notification = notification.clone();

            tokio::spawn(async move {
                debug!(rule = %rule.id, channel = %channel.name, "sending notification");
                if let Err(e) = sender.send(&channel.config, &notification).await {
                    warn!(channel = %channel.name, error = %e, "notification send failed");
                }
            });
        }
    }
}

/// Bridge the event bus into the notifier until shutdown.
pub fn start(
    notifier: Arc<Notifier>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let subscription = bus.subscribe(TopicFilter::All);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = subscription.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if let Some((app_id, notification)) = map_event(&event) {
                notifier.dispatch(app_id, notification).await;
            }
        }
    })
}

/// Which rule type (if any) an event fires, plus the rendered message.
pub fn map_event(event: &Event) -> Option<(Option<Uuid>, Notification)> {
    match event {
        Event::Deploy(deploy) => {
            let event_type = match deploy.status {
                Status::Success => "deploy_success",
                Status::Failed => "deploy_failed",
                _ => return None,
            };
            Some((
                Some(deploy.app_id),
                Notification {
                    event_type: event_type.to_string(),
                    title: format!("Deployment {}", deploy.status),
                    body: deploy
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("deployment {}", deploy.deployment_id)),
                },
            ))
        }
        Event::Health(health) => {
            let event_type = if health.container == ContainerStatus::NotFound {
                "container_down"
            } else if health.health == HealthVerdict::Unhealthy {
                "health_unhealthy"
            } else {
                return None;
            };
            Some((
                Some(health.app_id),
                Notification {
                    event_type: event_type.to_string(),
                    title: format!("Container {} / {}", health.container, health.health),
                    body: format!("app {}", health.app_id),
                },
            ))
        }
        Event::AgentUpdate(update) => {
            let event_type = match update.status {
                UpdateJobStatus::Updated => "agent_updated",
                UpdateJobStatus::Error => "agent_update_failed",
                _ => return None,
            };
            Some((
                None,
                Notification {
                    event_type: event_type.to_string(),
                    title: format!("Agent update {}", update.status),
                    body: format!(
                        "host {} version {}",
                        update.host_id,
                        update.version.as_deref().unwrap_or("unknown")
                    ),
                },
            ))
        }
        Event::Provision(provision)
            if provision.status == paasdeploy_common::host::HostStatus::Offline =>
        {
            Some((
                None,
                Notification {
                    event_type: "host_offline".to_string(),
                    title: "Host offline".to_string(),
                    body: format!("host {}", provision.host_id),
                },
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use paasdeploy_common::container::{ContainerStatus, HealthVerdict};
    use paasdeploy_common::deployment::Status;
    use paasdeploy_common::event::{DeployEvent, Event, HealthEvent};
    use serde_json::json;
    use uuid::Uuid;

    use super::{map_event, Notification, Notifier, SendError, Sender};
    use crate::persistence::{ChannelType, NewApp, Persistence};

    #[derive(Default)]
    struct RecordingSender {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Sender for RecordingSender {
        async fn send(
            &self,
            _config: &serde_json::Value,
            _notification: &Notification,
        ) -> Result<(), SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn deploy_failed(app_id: Uuid) -> Event {
        Event::Deploy(DeployEvent {
            deployment_id: Uuid::new_v4(),
            app_id,
            status: Status::Failed,
            stage: None,
            error_kind: None,
            error: Some("health_check: status 500".to_string()),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn events_map_to_rule_types() {
        let app_id = Uuid::new_v4();

        let (_, notification) = map_event(&deploy_failed(app_id)).unwrap();
        assert_eq!(notification.event_type, "deploy_failed");

        let (_, notification) = map_event(&Event::Health(HealthEvent {
            app_id,
            container: ContainerStatus::Running,
            health: HealthVerdict::Unhealthy,
            timestamp: Utc::now(),
        }))
        .unwrap();
        assert_eq!(notification.event_type, "health_unhealthy");

        let (_, notification) = map_event(&Event::Health(HealthEvent {
            app_id,
            container: ContainerStatus::NotFound,
            health: HealthVerdict::None,
            timestamp: Utc::now(),
        }))
        .unwrap();
        assert_eq!(notification.event_type, "container_down");

        // a running transition notifies nobody
        assert!(map_event(&Event::Deploy(DeployEvent {
            deployment_id: Uuid::new_v4(),
            app_id,
            status: Status::Running,
            stage: None,
            error_kind: None,
            error: None,
            timestamp: Utc::now(),
        }))
        .is_none());
    }

    #[tokio::test]
    async fn matching_rule_fires_exactly_once() {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let app = persistence
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

        let channel = persistence
            .create_channel("ops", ChannelType::Slack, json!({"webhook_url": "x"}))
            .await
            .unwrap();
        persistence
            .create_rule("deploy_failed", channel.id, Some(app.id))
            .await
            .unwrap();

        let sender = Arc::new(RecordingSender::default());
        let mut senders: HashMap<ChannelType, Arc<dyn Sender>> = HashMap::new();
        senders.insert(ChannelType::Slack, sender.clone());
        let notifier = Notifier::with_senders(persistence, senders);

        let (app_id, notification) = map_event(&deploy_failed(app.id)).unwrap();
        notifier.dispatch(app_id, notification).await;

        // sends are spawned; give them a beat to land
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmatched_events_fire_nothing() {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let sender = Arc::new(RecordingSender::default());
        let mut senders: HashMap<ChannelType, Arc<dyn Sender>> = HashMap::new();
        senders.insert(ChannelType::Slack, sender.clone());
        let notifier = Notifier::with_senders(persistence, senders);

        let (app_id, notification) = map_event(&deploy_failed(Uuid::new_v4())).unwrap();
        notifier.dispatch(app_id, notification).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
    }
}
