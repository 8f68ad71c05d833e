use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Container state as reported by the engine, collapsed to the states the
/// platform acts on.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum ContainerStatus {
    Running,
    Exited,
    Paused,
    Restarting,
    NotFound,
}

impl ContainerStatus {
    /// Collapse an engine state string ("running", "dead", "created", ...)
    /// into a platform status. Unknown states count as exited.
    pub fn from_engine(state: &str) -> Self {
        match state {
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            _ => ContainerStatus::Exited,
        }
    }
}

/// Health verdict from the container's own healthcheck, when it has one.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    Starting,
    None,
}

impl HealthVerdict {
    pub fn from_engine(health: Option<&str>) -> Self {
        match health {
            Some("healthy") => HealthVerdict::Healthy,
            Some("unhealthy") => HealthVerdict::Unhealthy,
            Some("starting") => HealthVerdict::Starting,
            _ => HealthVerdict::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ContainerStatus, HealthVerdict};

    #[test]
    fn engine_state_collapse() {
        assert_eq!(
            ContainerStatus::from_engine("running"),
            ContainerStatus::Running
        );
        assert_eq!(ContainerStatus::from_engine("dead"), ContainerStatus::Exited);
        assert_eq!(
            ContainerStatus::from_engine("created"),
            ContainerStatus::Exited
        );
    }

    #[test]
    fn health_verdicts() {
        assert_eq!(
            HealthVerdict::from_engine(Some("healthy")),
            HealthVerdict::Healthy
        );
        assert_eq!(HealthVerdict::from_engine(None), HealthVerdict::None);
        assert_eq!(
            HealthVerdict::from_engine(Some("weird")),
            HealthVerdict::None
        );
    }
}
