//! Notification text composition.
//!
//! The composer turns a classified user and their metric payload into the
//! message body that is sent to them. It is constructed once by the caller and
//! shared across every notification in a batch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AbsenceSummary, CohortKind, CohortResult, User};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricPayload {
    Cohort(CohortResult),
    Absence(AbsenceSummary),
}

#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("composer request timed out")]
    Timeout,

    #[error("composer service unavailable")]
    Unavailable,

    #[error("composer request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("composer returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("composer returned an empty reply")]
    EmptyReply,

    #[error("failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("composer task panicked")]
    Panicked,
}

#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(
        &self,
        user: &User,
        payload: &MetricPayload,
        topic: &str,
    ) -> Result<String, ComposerError>;
}

/// Offline composer producing fixed-phrase messages.
#[derive(Debug, Default, Clone)]
pub struct TemplateComposer;

#[async_trait]
impl Composer for TemplateComposer {
    async fn compose(
        &self,
        user: &User,
        payload: &MetricPayload,
        topic: &str,
    ) -> Result<String, ComposerError> {
        let body = match payload {
            MetricPayload::Cohort(result) => match result.kind {
                CohortKind::LowSleep => format!(
                    "you averaged {:.1} hours of sleep a night this week. Try winding down a little earlier tonight.",
                    result.metric_value / 3600.0
                ),
                CohortKind::HighSteps => format!(
                    "{:.0} steps today. Great work keeping active!",
                    result.metric_value
                ),
                CohortKind::StepDrop => format!(
                    "you walked {:.0} steps last week, less than half of the week before. A short walk today is a good restart.",
                    result.metric_value
                ),
                CohortKind::Absence => format!(
                    "we haven't seen new data from you in {:.0} days.",
                    result.metric_value
                ),
            },
            MetricPayload::Absence(summary) => format!(
                "it has been {} days since your last update. So far you have walked {:.0} steps, burned {:.0} active calories and had {} nights of 8+ hours sleep. We'd love to see you back.",
                summary.days_absent,
                summary.total_steps,
                summary.total_calories,
                summary.perfect_sleep_nights
            ),
        };

        Ok(format!("Hi {} ({}): {}", user.username, topic, body))
    }
}

#[derive(Debug, Clone)]
pub struct HttpComposerConfig {
    /// Base URL of a chat-completions compatible endpoint
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout_ms: u64,
}

impl Default for HttpComposerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            model: "gpt-3.5-turbo".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

/// Composer backed by a remote text-generation service.
pub struct HttpComposer {
    client: Client,
    config: HttpComposerConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl HttpComposer {
    pub fn new(config: HttpComposerConfig) -> Result<Self, ComposerError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self { client, config })
    }

    fn prompt(user: &User, payload: &MetricPayload, topic: &str) -> Result<String, ComposerError> {
        Ok(format!(
            "Write a short, friendly notification for {} about {}. Their health data: {}. Offer one piece of personalised advice.",
            user.username,
            topic,
            serde_json::to_string(payload)?
        ))
    }
}

#[async_trait]
impl Composer for HttpComposer {
    async fn compose(
        &self,
        user: &User,
        payload: &MetricPayload,
        topic: &str,
    ) -> Result<String, ComposerError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You are a health advisor.".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Self::prompt(user, payload, topic)?,
                },
            ],
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ComposerError::Timeout
            } else if e.is_connect() {
                ComposerError::Unavailable
            } else {
                ComposerError::Request(e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(ComposerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let reply: ChatResponse = response.json().await?;
        reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(ComposerError::EmptyReply)
    }
}
