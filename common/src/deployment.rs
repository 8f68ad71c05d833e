use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// States a deployment can be in
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum Status {
    /// Deployment is queued and waiting for a worker to claim it
    Pending,

    /// Deployment has been claimed and its stages are executing
    Running,

    /// All stages finished and the health check passed
    Success,

    /// A stage failed; the error message records which one
    Failed,

    /// Deployment was cancelled before reaching a natural end
    Cancelled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed | Status::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Status::Pending | Status::Running)
    }

    /// Whether moving from `self` to `next` is a legal edge of the lifecycle.
    /// Terminal states have no outgoing edges.
    pub fn can_transition_to(&self, next: Status) -> bool {
        match (self, next) {
            (Status::Pending, Status::Running) => true,
            (Status::Pending, Status::Cancelled) => true,
            (Status::Running, Status::Success) => true,
            (Status::Running, Status::Failed) => true,
            (Status::Running, Status::Cancelled) => true,
            _ => false,
        }
    }
}

/// The pipeline stages a running deployment passes through, in order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Stage {
    GitSync,
    Build,
    Deploy,
    HealthCheck,
    Complete,
}

/// Failure classes surfaced on a terminal deployment row and in `deploy` events.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    GitCloneFailed,
    BuildFailed,
    ContainerStartFailed,
    HealthCheckFailed,
    ConfigInvalid,
    AgentUnreachable,
    Timeout,
    Cancelled,
    Internal,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{Stage, Status};

    #[test]
    fn status_deser() {
        assert_eq!(Status::Pending, Status::from_str("pending").unwrap());
        assert_eq!(Status::Running, Status::from_str("Running").unwrap());
        assert_eq!(Status::Cancelled, Status::from_str("cancelled").unwrap());
    }

    #[test]
    fn stage_deser() {
        assert_eq!(Stage::GitSync, Stage::from_str("git_sync").unwrap());
        assert_eq!(Stage::HealthCheck, Stage::from_str("health_check").unwrap());
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for terminal in [Status::Success, Status::Failed, Status::Cancelled] {
            for next in [
                Status::Pending,
                Status::Running,
                Status::Success,
                Status::Failed,
                Status::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn lifecycle_edges() {
        assert!(Status::Pending.can_transition_to(Status::Running));
        assert!(Status::Pending.can_transition_to(Status::Cancelled));
        assert!(Status::Running.can_transition_to(Status::Success));
        assert!(Status::Running.can_transition_to(Status::Failed));
        assert!(Status::Running.can_transition_to(Status::Cancelled));
        assert!(!Status::Pending.can_transition_to(Status::Success));
        assert!(!Status::Running.can_transition_to(Status::Pending));
    }
}
