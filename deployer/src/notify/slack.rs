use async_trait::async_trait;
use serde_json::json;

use super::{Notification, SendError, Sender};

/// Posts to a Slack incoming-webhook URL taken from the channel config.
pub struct SlackSender {
    http: reqwest::Client,
}

impl SlackSender {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Sender for SlackSender {
    async fn send(
        &self,
        config: &serde_json::Value,
        notification: &Notification,
    ) -> Result<(), SendError> {
        let url = config
            .get("webhook_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SendError("slack channel has no webhook_url".to_string()))?;

        let response = self
            .http
            .post(url)
            .json(&json!({
                "text": format!("*{}*\n{}", notification.title, notification.body),
            }))
            .send()
            .await
            .map_err(|e| SendError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SendError(format!("slack returned {}", response.status())));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::super::{Notification, Sender};
    use super::SlackSender;

    #[tokio::test]
    async fn posts_to_the_configured_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/T000/B000"))
            .and(body_partial_json(json!({"text": "*Deployment failed*\nbuild broke"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = SlackSender::new(reqwest::Client::new());
        let config = json!({"webhook_url": format!("{}/services/T000/B000", server.uri())});

        sender
            .send(
                &config,
                &Notification {
                    event_type: "deploy_failed".to_string(),
                    title: "Deployment failed".to_string(),
                    body: "build broke".to_string(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_config_is_an_error() {
        let sender = SlackSender::new(reqwest::Client::new());
        let result = sender
            .send(
                &json!({}),
                &Notification {
                    event_type: "deploy_failed".to_string(),
                    title: "t".to_string(),
                    body: "b".to_string(),
                },
            )
            .await;
        assert!(result.is_err());
    }
}
