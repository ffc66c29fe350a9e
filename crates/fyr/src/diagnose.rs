//! Client for the external diagnostic engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::DiagnosticSettings;
use crate::error::{Error, Result};
use crate::model::{Analysis, JobKind};

/// One alert summarised for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertBrief {
    pub name: String,
    pub severity: String,
    pub description: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertContext {
    pub text: String,
    pub alerts: Vec<AlertBrief>,
}

/// Minimal reference handed to the engine; it gathers its own evidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticRequest {
    pub kind: JobKind,
    /// Human reference of the investigated entity
    pub reference: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    /// Why a rollout was failed, for rollout jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_context: Option<AlertContext>,
    /// Incident evidence for namespace jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident: Option<Value>,
}

impl DiagnosticRequest {
    /// Free text from the request used for triage alongside the analysis.
    pub fn context_text(&self) -> String {
        let mut parts = vec![self.reference.clone()];
        if let Some(failure) = &self.failure {
            parts.push(failure.clone());
        }
        if let Some(context) = &self.alert_context {
            parts.push(context.text.clone());
            for alert in &context.alerts {
                parts.push(alert.name.clone());
                if let Some(description) = &alert.description {
                    parts.push(description.clone());
                }
            }
        }
        if let Some(incident) = &self.incident {
            parts.push(incident.to_string());
        }
        parts.join(" ")
    }
}

#[async_trait]
pub trait DiagnosticEngine: Send + Sync {
    async fn analyze(&self, request: &DiagnosticRequest) -> Result<Analysis>;
}

/// Engine reached over HTTP: `POST {url}` with the request as JSON, answered
/// with an `Analysis` body.
pub struct HttpDiagnosticEngine {
    client: Client,
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpDiagnosticEngine {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            url: url.into(),
            token,
            timeout,
        })
    }

    /// `None` when no engine URL is configured.
    pub fn from_settings(settings: &DiagnosticSettings) -> Result<Option<Self>> {
        settings
            .url
            .as_ref()
            .map(|url| {
                Self::new(
                    url.clone(),
                    settings.token.clone(),
                    Duration::from_secs(settings.timeout_secs),
                )
            })
            .transpose()
    }

    async fn call(&self, request: &DiagnosticRequest) -> Result<Analysis> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".into());
            return Err(Error::DiagnosticError(format!(
                "diagnostic engine returned {status}: {body}"
            )));
        }

        response
            .json::<Analysis>()
            .await
            .map_err(|e| Error::DiagnosticError(format!("invalid analysis body: {e}")))
    }
}

#[async_trait]
impl DiagnosticEngine for HttpDiagnosticEngine {
    async fn analyze(&self, request: &DiagnosticRequest) -> Result<Analysis> {
        debug!(reference = %request.reference, kind = %request.kind, "Requesting analysis");
        tokio::time::timeout(self.timeout, self.call(request))
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }
}

#[cfg(test)]
pub(crate) mod recording {
    //! Engine double that records requests and replays a canned answer.

    use super::*;
    use std::sync::Mutex;

    pub struct RecordingEngine {
        pub requests: Mutex<Vec<DiagnosticRequest>>,
        answer: Option<Analysis>,
    }

    impl RecordingEngine {
        pub fn answering(analysis: Analysis) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                answer: Some(analysis),
            }
        }

        pub fn failing() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                answer: None,
            }
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DiagnosticEngine for RecordingEngine {
        async fn analyze(&self, request: &DiagnosticRequest) -> Result<Analysis> {
            self.requests.lock().unwrap().push(request.clone());
            self.answer
                .clone()
                .ok_or_else(|| Error::DiagnosticError("engine unavailable".to_string()))
        }
    }
}
