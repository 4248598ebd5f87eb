//! Plan generation through a hosted text-generation model.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::PlannerConfig;

/// One step of a generated plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// What to do
    pub task: String,
    /// Estimated duration in days
    #[serde(default)]
    pub duration_days: u32,
    /// Titles of tasks that must finish first
    #[serde(default, deserialize_with = "null_as_empty")]
    pub depends_on: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Plan generation errors.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Base URL or API key missing.
    #[error("plan generator is not configured")]
    NotConfigured,

    /// The model reply contained no JSON array.
    #[error("failed to extract json array from model response")]
    NoTaskArray,

    /// The array did not parse as tasks.
    #[error("invalid task list: {0}")]
    InvalidTasks(#[from] serde_json::Error),

    /// Transport failure. The request URL is stripped before wrapping.
    #[error("generation request failed: {0}")]
    Http(reqwest::Error),

    /// Generation exceeded its time bound.
    #[error("generation timed out")]
    Timeout,
}

impl From<reqwest::Error> for PlanError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.without_url())
    }
}

impl PlanError {
    /// Message safe to hand to API callers. Transport and model details stay
    /// in the logs.
    #[must_use]
    pub fn public_detail(&self) -> &'static str {
        match self {
            Self::NotConfigured => "plan generation is not configured",
            Self::NoTaskArray | Self::InvalidTasks(_) => "model returned no usable task list",
            Self::Http(_) => "plan generation service unavailable",
            Self::Timeout => "plan generation timed out",
        }
    }
}

/// Turns a goal into an ordered task list.
#[async_trait]
pub trait PlanGenerator: Send + Sync + 'static {
    /// Generate tasks for `goal`.
    async fn generate(&self, goal: &str) -> Result<Vec<Task>, PlanError>;
}

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Client for the `generateText` model endpoint.
pub struct GeminiPlanner {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

impl GeminiPlanner {
    /// Build from configuration. Missing settings surface on first use.
    pub fn new(config: &PlannerConfig) -> Result<Self, PlanError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
        })
    }

    fn prompt(goal: &str) -> String {
        format!(
            "You are an expert task planner. Return ONLY valid JSON array of tasks. \
             Each task: {{\"task\", \"duration_days\", \"depends_on\"}}. Goal: {goal}"
        )
    }
}

#[async_trait]
impl PlanGenerator for GeminiPlanner {
    async fn generate(&self, goal: &str) -> Result<Vec<Task>, PlanError> {
        if self.base_url.is_empty() || self.api_key.is_empty() {
            return Err(PlanError::NotConfigured);
        }

        let url = format!("{}/v1/models/{}:generateText", self.base_url, self.model);
        let body = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&json!({
                "prompt": { "text": Self::prompt(goal) },
                "max_output_tokens": self.max_output_tokens,
            }))
            .send()
            .await?
            .text()
            .await?;

        debug!(bytes = body.len(), "Model response received");
        parse_tasks(&response_text(&body))
    }
}

/// Generated text out of a model response envelope, or the raw body when it
/// has no recognised shape.
fn response_text(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    let candidate = &value["candidates"][0];
    candidate["output"]
        .as_str()
        .or_else(|| candidate["content"]["parts"][0]["text"].as_str())
        .map_or_else(|| body.to_string(), str::to_string)
}

/// Slice from the first `[` to the last `]`.
pub fn extract_task_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse the task array embedded in model output.
pub fn parse_tasks(text: &str) -> Result<Vec<Task>, PlanError> {
    let array = extract_task_array(text).ok_or(PlanError::NoTaskArray)?;
    Ok(serde_json::from_str(array)?)
}
