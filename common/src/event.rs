use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::container::{ContainerStatus, HealthVerdict};
use crate::deployment::{ErrorKind, Stage, Status};
use crate::host::{HostStatus, UpdateJobStatus};
use crate::log;

/// Everything published on the in-process bus. Each variant maps to one SSE
/// event name and one topic; payloads carry the owning entity id and a
/// timestamp so clients can order what they see.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Deploy(DeployEvent),
    Log(log::Item),
    Health(HealthEvent),
    Stats(StatsEvent),
    Provision(ProvisionEvent),
    AgentUpdate(AgentUpdateEvent),
}

impl Event {
    /// The bus topic this event belongs on.
    pub fn topic(&self) -> String {
        match self {
            Event::Deploy(_) => "deploys".to_string(),
            Event::Log(item) => format!("logs.{}", item.deployment_id),
            Event::Health(e) => format!("health.{}", e.app_id),
            Event::Stats(e) => format!("stats.{}", e.app_id),
            Event::Provision(e) => format!("provision.{}", e.host_id),
            Event::AgentUpdate(e) => format!("agent_update.{}", e.host_id),
        }
    }

    /// The SSE event name clients subscribe on.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Deploy(_) => "deploy",
            Event::Log(_) => "log",
            Event::Health(_) => "health",
            Event::Stats(_) => "stats",
            Event::Provision(_) => "provision",
            Event::AgentUpdate(_) => "agent_update",
        }
    }
}

/// A deployment state transition.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DeployEvent {
    pub deployment_id: Uuid,
    pub app_id: Uuid,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A container health transition observed by the sampler.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HealthEvent {
    pub app_id: Uuid,
    pub container: ContainerStatus,
    pub health: HealthVerdict,
    pub timestamp: DateTime<Utc>,
}

/// A most-recent-wins resource usage sample.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct StatsEvent {
    pub app_id: Uuid,
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// A host state change (registration, heartbeat loss, provisioning step).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProvisionEvent {
    pub host_id: Uuid,
    pub status: HostStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Progress of an agent self-update job.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AgentUpdateEvent {
    pub host_id: Uuid,
    pub status: UpdateJobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{DeployEvent, Event};
    use crate::deployment::Status;

    #[test]
    fn topics_and_names() {
        let app_id = Uuid::new_v4();
        let deployment_id = Uuid::new_v4();

        let event = Event::Deploy(DeployEvent {
            deployment_id,
            app_id,
            status: Status::Running,
            stage: None,
            error_kind: None,
            error: None,
            timestamp: Utc::now(),
        });
        assert_eq!(event.topic(), "deploys");
        assert_eq!(event.name(), "deploy");

        let event = Event::Log(crate::log::Item::new(
            deployment_id,
            crate::deployment::Stage::Build,
            crate::log::Level::Info,
            "building",
        ));
        assert_eq!(event.topic(), format!("logs.{deployment_id}"));
        assert_eq!(event.name(), "log");
    }

    #[test]
    fn serialized_form_is_tagged() {
        let event = Event::Deploy(DeployEvent {
            deployment_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            status: Status::Success,
            stage: None,
            error_kind: None,
            error: None,
            timestamp: Utc::now(),
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "deploy");
        assert_eq!(value["status"], "success");
    }
}
