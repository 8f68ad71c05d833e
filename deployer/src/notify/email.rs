use async_trait::async_trait;
use serde_json::json;

use super::{Notification, SendError, Sender};

/// Sends through an HTTP mail relay (api_url, api_key, from, to in the
/// channel config).
pub struct EmailSender {
    http: reqwest::Client,
}

impl EmailSender {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Sender for EmailSender {
    async fn send(
        &self,
        config: &serde_json::Value,
        notification: &Notification,
    ) -> Result<(), SendError> {
        let field = |name: &str| {
            config
                .get(name)
                .and_then(|v| v.as_str())
                .ok_or_else(|| SendError(format!("email channel has no {name}")))
        };

        let api_url = field("api_url")?;
        let api_key = field("api_key")?;
        let from = field("from")?;
        let to = field("to")?;

        let response = self
            .http
            .post(api_url)
            .bearer_auth(api_key)
            .json(&json!({
                "from": from,
                "to": to,
                "subject": notification.title,
                "text": notification.body,
            }))
            .send()
            .await
            .map_err(|e| SendError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SendError(format!(
                "mail relay returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}
