use async_trait::async_trait;
use serde_json::json;

use super::{Notification, SendError, Sender};

/// Posts to a Discord webhook URL taken from the channel config.
pub struct DiscordSender {
    http: reqwest::Client,
}

impl DiscordSender {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Sender for DiscordSender {
    async fn send(
        &self,
        config: &serde_json::Value,
        notification: &Notification,
    ) -> Result<(), SendError> {
        let url = config
            .get("webhook_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SendError("discord channel has no webhook_url".to_string()))?;

        let response = self
            .http
            .post(url)
            .json(&json!({
                "content": format!("**{}**\n{}", notification.title, notification.body),
            }))
            .send()
            .await
            .map_err(|e| SendError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SendError(format!("discord returned {}", response.status())));
        }

        Ok(())
    }
}
