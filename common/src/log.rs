use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deployment::Stage;

/// Marker message injected into a deployment's log stream whenever buffered
/// entries had to be discarded for a slow consumer.
pub const DROPPED_MESSAGE: &str = "log dropped";

/// One line of deployment output, attributed to the stage that produced it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Item {
    pub deployment_id: Uuid,
    pub stage: Stage,
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Item {
    pub fn new(deployment_id: Uuid, stage: Stage, level: Level, message: impl Into<String>) -> Self {
        Self {
            deployment_id,
            stage,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// The marker entry recorded in place of `count` discarded lines.
    pub fn dropped(deployment_id: Uuid, stage: Stage, count: usize) -> Self {
        Self::new(
            deployment_id,
            stage,
            Level::Warn,
            format!("{DROPPED_MESSAGE} ({count} entries)"),
        )
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}
