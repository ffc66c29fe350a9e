//! Slack notification channel.
//!
//! Posts through `chat.postMessage` when a bot token is configured, otherwise
//! through an incoming webhook.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::message::AnalysisMessage;
use crate::NotifyChannel;

const DEFAULT_API_BASE: &str = "https://slack.com/api";

/// Slack channel settings.
#[derive(Debug, Clone, Default)]
pub struct SlackConfig {
    /// Bot token for `chat.postMessage`
    pub bot_token: Option<String>,
    /// Incoming webhook URL (used when no bot token is set)
    pub webhook_url: Option<String>,
    /// Channel used when the caller passes no target
    pub default_channel: Option<String>,
    /// Override for the Web API base URL
    pub api_base: Option<String>,
}

/// Slack notification channel.
pub struct SlackChannel {
    config: SlackConfig,
    client: reqwest::Client,
}

impl SlackChannel {
    #[must_use]
    pub fn new(config: SlackConfig) -> Self {
        if config.bot_token.is_some() {
            debug!("Slack notifications enabled (bot token)");
        } else if config.webhook_url.is_some() {
            debug!("Slack notifications enabled (incoming webhook)");
        } else {
            debug!("Slack notifications disabled (no token or webhook)");
        }

        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_base(&self) -> &str {
        self.config
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
    }

    /// Render an analysis as Slack blocks.
    #[must_use]
    pub fn build_blocks(message: &AnalysisMessage) -> Vec<Value> {
        let mut fields = vec![
            json!({"type": "mrkdwn", "text": format!("*Rollout:* {}", message.reference)}),
            json!({"type": "mrkdwn", "text": format!("*Severity:* {}", message.severity)}),
        ];
        if let Some(team) = &message.team {
            fields.push(json!({"type": "mrkdwn", "text": format!("*Team:* {team}")}));
        }
        if let Some(triage) = &message.triage_team {
            fields.push(json!({"type": "mrkdwn", "text": format!("*Triage:* {triage}")}));
        }
        if let Some(url) = &message.pipeline_url {
            fields.push(json!({"type": "mrkdwn", "text": format!("*Pipeline:* <{url}|view>")}));
        }

        let steps = message
            .recommended_steps
            .iter()
            .map(|step| format!("• {step}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut blocks = vec![
            json!({"type": "section", "fields": fields}),
            json!({"type": "section", "text": {"type": "mrkdwn", "text": format!("*Summary:* {}", message.summary)}}),
            json!({"type": "section", "text": {"type": "mrkdwn", "text": format!("*Likely cause:* {}", message.likely_cause)}}),
        ];
        if !steps.is_empty() {
            blocks.push(json!({"type": "section", "text": {"type": "mrkdwn", "text": steps}}));
        }
        if let Some(details) = &message.details {
            blocks.push(json!({"type": "context", "elements": [{"type": "mrkdwn", "text": details}]}));
        }
        if !message.namespace_annotations.is_empty() {
            let formatted = message
                .namespace_annotations
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", ");
            blocks.push(json!({
                "type": "context",
                "elements": [{"type": "mrkdwn", "text": format!("*Namespace annotations:* {formatted}")}]
            }));
        }
        blocks
    }

    async fn post_message(
        &self,
        token: &str,
        channel: &str,
        message: &AnalysisMessage,
    ) -> Result<(), ChannelError> {
        let url = format!("{}/chat.postMessage", self.api_base());
        let body = json!({
            "channel": channel,
            "text": message.title(),
            "blocks": Self::build_blocks(message),
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(rate_limited(&response));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(channel = "slack", status = %status, body = %body, "chat.postMessage failed");
            return Err(ChannelError::Rejected {
                service: "slack",
                reason: format!("HTTP {status}"),
            });
        }

        // The Web API reports errors in the body with a 200 status
        let reply: ApiReply = response.json().await?;
        if reply.ok {
            Ok(())
        } else {
            Err(ChannelError::Rejected {
                service: "slack",
                reason: reply.error.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }

    async fn post_webhook(
        &self,
        webhook_url: &str,
        message: &AnalysisMessage,
    ) -> Result<(), ChannelError> {
        let payload = WebhookPayload {
            text: message.title(),
            blocks: Self::build_blocks(message),
        };

        let response = self.client.post(webhook_url).json(&payload).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(rate_limited(&response));
        }

        let body = response.text().await.unwrap_or_default();
        warn!(channel = "slack", status = %status, body = %body, "Slack webhook request failed");
        Err(ChannelError::Rejected {
            service: "slack",
            reason: format!("HTTP {status}: {body}"),
        })
    }
}

fn rate_limited(response: &reqwest::Response) -> ChannelError {
    let retry_after_secs = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    ChannelError::RateLimited { retry_after_secs }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.config.bot_token.is_some() || self.config.webhook_url.is_some()
    }

    async fn send(
        &self,
        target: Option<&str>,
        message: &AnalysisMessage,
    ) -> Result<(), ChannelError> {
        debug!(channel = "slack", reference = %message.reference, "Sending notification");

        if let Some(token) = &self.config.bot_token {
            let channel = target
                .or(self.config.default_channel.as_deref())
                .ok_or_else(|| ChannelError::NotConfigured("slack channel".to_string()))?;
            return self.post_message(token, channel, message).await;
        }

        let webhook_url = self
            .config
            .webhook_url
            .as_deref()
            .ok_or_else(|| ChannelError::NotConfigured("slack token or webhook".to_string()))?;
        self.post_webhook(webhook_url, message).await
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct WebhookPayload {
    text: String,
    blocks: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}
