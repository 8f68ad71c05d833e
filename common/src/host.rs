use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// States a remote host can be in
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum HostStatus {
    Pending,
    Provisioning,
    Online,
    Offline,
    Error,
}

/// How a host receives agent updates: pushed by the control plane over the
/// command channel, or pulled by the agent itself.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum UpdateMode {
    Push,
    Pull,
}

/// Lifecycle of an agent-update job.
///
/// enqueued -> delivered (a heartbeat picked the command up) -> updated (a
/// heartbeat arrived from a binary reporting the requested version). A job
/// that stays delivered past its deadline, or whose agent reports failure,
/// moves to error. updated and error are terminal.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum UpdateJobStatus {
    Enqueued,
    Delivered,
    Updated,
    Error,
}

impl UpdateJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateJobStatus::Updated | UpdateJobStatus::Error)
    }

    pub fn can_transition_to(&self, next: UpdateJobStatus) -> bool {
        match (self, next) {
            (UpdateJobStatus::Enqueued, UpdateJobStatus::Delivered) => true,
            (UpdateJobStatus::Enqueued, UpdateJobStatus::Error) => true,
            (UpdateJobStatus::Delivered, UpdateJobStatus::Updated) => true,
            (UpdateJobStatus::Delivered, UpdateJobStatus::Error) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{HostStatus, UpdateJobStatus};

    #[test]
    fn host_status_deser() {
        assert_eq!(HostStatus::Online, HostStatus::from_str("online").unwrap());
        assert_eq!(
            HostStatus::Provisioning,
            HostStatus::from_str("Provisioning").unwrap()
        );
    }

    #[test]
    fn update_job_terminality() {
        assert!(UpdateJobStatus::Enqueued.can_transition_to(UpdateJobStatus::Delivered));
        assert!(UpdateJobStatus::Delivered.can_transition_to(UpdateJobStatus::Updated));
        assert!(UpdateJobStatus::Delivered.can_transition_to(UpdateJobStatus::Error));
        assert!(!UpdateJobStatus::Updated.can_transition_to(UpdateJobStatus::Error));
        assert!(!UpdateJobStatus::Error.can_transition_to(UpdateJobStatus::Enqueued));
        assert!(!UpdateJobStatus::Enqueued.can_transition_to(UpdateJobStatus::Updated));
    }
}
