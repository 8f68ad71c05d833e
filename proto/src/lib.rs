// This clippy is disabled as per this prost comment
// https://github.com/tokio-rs/prost/issues/661#issuecomment-1156606409
#![allow(clippy::derive_partial_eq_without_eq)]

pub mod agent {
    use std::fmt::Display;

    use chrono::{DateTime, TimeZone, Utc};
    use paasdeploy_common::container::{ContainerStatus, HealthVerdict};
    use paasdeploy_common::deployment::Stage;
    use paasdeploy_common::log;
    use uuid::Uuid;

    include!("generated/agent.rs");

    /// Convert a chrono timestamp into the wire form.
    pub fn timestamp(datetime: DateTime<Utc>) -> ::prost_types::Timestamp {
        ::prost_types::Timestamp {
            seconds: datetime.timestamp(),
            nanos: datetime.timestamp_subsec_nanos() as i32,
        }
    }

    /// Convert a wire timestamp back; a missing or out-of-range timestamp
    /// falls back to now so log ordering survives clock weirdness.
    pub fn datetime(timestamp: Option<::prost_types::Timestamp>) -> DateTime<Utc> {
        timestamp
        .and_then(|ts| Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32).single())
        .unwrap_or_else(Utc::now)
    }

    impl From<Stage> for DeployStage {
        fn from(stage: Stage) -> Self {
            match stage {
                Stage::GitSync => DeployStage::GitSync,
                Stage::Build => DeployStage::Build,
                Stage::Deploy => DeployStage::Deploy,
                Stage::HealthCheck => DeployStage::HealthCheck,
                Stage::Complete => DeployStage::Complete,
            }
        }
    }

    impl DeployStage {
        /// The platform stage, unless the field was never set.
        pub fn into_stage(self) -> Option<Stage> {
            match self {
                DeployStage::Unspecified => None,
                DeployStage::GitSync => Some(Stage::GitSync),
                DeployStage::Build => Some(Stage::Build),
                DeployStage::Deploy => Some(Stage::Deploy),
                DeployStage::HealthCheck => Some(Stage::HealthCheck),
                DeployStage::Complete => Some(Stage::Complete),
            }
        }
    }

    impl From<log::Level> for LogLevel {
        fn from(level: log::Level) -> Self {
            match level {
                log::Level::Debug => LogLevel::Debug,
                log::Level::Info => LogLevel::Info,
                log::Level::Warn => LogLevel::Warn,
                log::Level::Error => LogLevel::Error,
            }
        }
    }

    impl From<LogLevel> for log::Level {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Unspecified | LogLevel::Debug => log::Level::Debug,
                LogLevel::Info => log::Level::Info,
                LogLevel::Warn => log::Level::Warn,
                LogLevel::Error => log::Level::Error,
            }
        }
    }

    impl From<ContainerState> for ContainerStatus {
        fn from(state: ContainerState) -> Self {
            match state {
                ContainerState::Running => ContainerStatus::Running,
                ContainerState::Paused => ContainerStatus::Paused,
                ContainerState::Restarting => ContainerStatus::Restarting,
                ContainerState::NotFound => ContainerStatus::NotFound,
                ContainerState::Exited | ContainerState::Unspecified => ContainerStatus::Exited,
            }
        }
    }

    impl From<ContainerStatus> for ContainerState {
        fn from(status: ContainerStatus) -> Self {
            match status {
                ContainerStatus::Running => ContainerState::Running,
                ContainerStatus::Paused => ContainerState::Paused,
                ContainerStatus::Restarting => ContainerState::Restarting,
                ContainerStatus::NotFound => ContainerState::NotFound,
                ContainerStatus::Exited => ContainerState::Exited,
            }
        }
    }

    impl From<HealthState> for HealthVerdict {
        fn from(state: HealthState) -> Self {
            match state {
                HealthState::Healthy => HealthVerdict::Healthy,
                HealthState::Unhealthy => HealthVerdict::Unhealthy,
                HealthState::Starting => HealthVerdict::Starting,
                HealthState::None | HealthState::Unspecified => HealthVerdict::None,
            }
        }
    }

    impl From<HealthVerdict> for HealthState {
        fn from(verdict: HealthVerdict) -> Self {
            match verdict {
                HealthVerdict::Healthy => HealthState::Healthy,
                HealthVerdict::Unhealthy => HealthState::Unhealthy,
                HealthVerdict::Starting => HealthState::Starting,
                HealthVerdict::None => HealthState::None,
            }
        }
    }

    impl From<log::Item> for DeployLogEntry {
        fn from(item: log::Item) -> Self {
            DeployLogEntry {
                deployment_id: item.deployment_id.to_string(),
                stage: DeployStage::from(item.stage) as i32,
                level: LogLevel::from(item.level) as i32,
                message: item.message,
                timestamp: Some(timestamp(item.timestamp)),
            }
        }
    }

    impl DeployLogEntry {
        /// Lift the wire entry into the shared log item. Entries with an
        /// unparseable id or stage belong to no deployment and are dropped
        /// by returning `None`.
        pub fn into_item(self) -> Option<log::Item> {
            let deployment_id = Uuid::parse_str(&self.deployment_id).ok()?;
            let stage = DeployStage::try_from(self.stage).ok()?.into_stage()?;
            let level = LogLevel::try_from(self.level)
                .unwrap_or(LogLevel::Info)
                .into();

            Some(log::Item {
                deployment_id,
                stage,
                level,
                message: self.message,
                timestamp: datetime(self.timestamp),
            })
        }
    }

    impl Display for DeployStage {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self.into_stage() {
                Some(stage) => stage.fmt(f),
                None => write!(f, "unspecified"),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use chrono::{SubsecRound, Utc};
        use paasdeploy_common::deployment::Stage;
        use paasdeploy_common::log;
        use uuid::Uuid;

        use super::{DeployLogEntry, DeployStage};

        #[test]
        fn log_entry_round_trip() {
            let item = log::Item {
                deployment_id: Uuid::new_v4(),
                stage: Stage::Build,
                level: log::Level::Warn,
                message: "step 3/7".to_string(),
                // the wire form only carries whole nanoseconds
                timestamp: Utc::now().trunc_subsecs(6),
            };

            let entry = DeployLogEntry::from(item.clone());
            assert_eq!(entry.into_item().unwrap(), item);
        }

        #[test]
        fn bad_id_is_dropped() {
            let entry = DeployLogEntry {
                deployment_id: "not-a-uuid".to_string(),
                stage: DeployStage::Build as i32,
                level: 2,
                message: String::new(),
                timestamp: None,
            };
            assert!(entry.into_item().is_none());
        }
    }
}
