use serde_json::json;

use crate::notify::NotifyError;

const PUSH_URL: &str = "https://api.line.me/v2/bot/message/push";

/// Minimal LINE Messaging API client: text pushes to a linked LINE user.
pub struct LineClient {
    http: reqwest::Client,
    channel_token: String,
}

impl LineClient {
    pub fn new(channel_token: String) -> Self {
        LineClient {
            http: reqwest::Client::new(),
            channel_token,
        }
    }

    pub async fn push_text(&self, to: &str, text: &str) -> Result<(), NotifyError> {
        // LINE caps text messages at 5000 characters.
        let text: String = text.chars().take(5000).collect();
        let res = self
            .http
            .post(PUSH_URL)
            .bearer_auth(&self.channel_token)
            .json(&json!({
                "to": to,
                "messages": [{ "type": "text", "text": text }],
            }))
            .send()
            .await?;

        if res.status().is_success() {
            Ok(())
        } else {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            Err(NotifyError::Line(status, body))
        }
    }
}
