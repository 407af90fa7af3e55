use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;

/// Default bound on any single model-service call, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Longest upstream body fragment worth keeping in a log line.
const LOG_BODY_MAX: usize = 2048;

/// Client for the external model service: `POST {base}/assess` turns a
/// transcript into a structured assessment, `POST {base}/generate` produces
/// the agent's next reply. One request per call, bounded timeout, no retry.
#[derive(Clone)]
pub struct ModelClient {
    http: reqwest::Client,
    base_url: Url,
}

/// Structured result of `POST /assess`. The live service serializes
/// snake_case; the camelCase strategy spelling is accepted as an alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentReport {
    pub body: String,
    #[serde(alias = "conflictManagementStrategy")]
    pub conflict_management_strategy: String,
    pub openness: i32,
    pub conscientiousness: i32,
    pub extroversion: i32,
    pub agreeableness: i32,
    pub neuroticism: i32,
}

/// Outbound payload for `POST /generate`.
#[derive(Debug, Serialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_length: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<GenerateAgent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<GenerateScenario>,
    pub history: Vec<GenerateTurn>,
}

/// Persona context for the generating model.
#[derive(Debug, Serialize)]
pub struct GenerateAgent {
    pub name: String,
    pub prompt_body: Option<String>,
    pub openness: Option<i32>,
    pub conscientiousness: Option<i32>,
    pub extroversion: Option<i32>,
    pub agreeableness: Option<i32>,
    pub neuroticism: Option<i32>,
}

/// Scenario context for the generating model.
#[derive(Debug, Serialize)]
pub struct GenerateScenario {
    pub name: String,
    pub setting_prompt: Option<String>,
    pub conflict_prompt: Option<String>,
    pub additional_prompt: Option<String>,
}

/// One prior turn of the conversation, chronological.
#[derive(Debug, Serialize)]
pub struct GenerateTurn {
    pub sender: String,
    pub body: String,
}

#[derive(Serialize)]
struct AssessRequest<'a> {
    conversation: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    result: String,
}

impl ModelClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build model service client: {e}")))?;

        Ok(Self { http, base_url })
    }

    /// Build the client from `PARLEY_MODEL_URL` (required, must parse as a
    /// URL) and `PARLEY_MODEL_TIMEOUT_SECS` (optional, must be > 0).
    pub fn from_env() -> Result<Self, AppError> {
        let base = std::env::var("PARLEY_MODEL_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                AppError::Internal("PARLEY_MODEL_URL must be configured".to_string())
            })?;

        let base_url = Url::parse(&base).map_err(|e| {
            AppError::Internal(format!("PARLEY_MODEL_URL is not a valid URL: {e}"))
        })?;

        let timeout_secs = match std::env::var("PARLEY_MODEL_TIMEOUT_SECS") {
            Ok(raw) => raw.trim().parse::<u64>().ok().filter(|secs| *secs > 0).ok_or_else(
                || {
                    AppError::Internal(
                        "PARLEY_MODEL_TIMEOUT_SECS must be a positive integer".to_string(),
                    )
                },
            )?,
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };

        Self::new(base_url, Duration::from_secs(timeout_secs))
    }

    /// Submit a transcript for assessment.
    pub async fn assess(&self, transcript: &str) -> Result<AssessmentReport, AppError> {
        let response = self
            .http
            .post(self.endpoint("assess"))
            .json(&AssessRequest {
                conversation: transcript,
            })
            .send()
            .await
            .map_err(|e| transport_error("assess", &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("assess", &e))?;

        if !status.is_success() {
            tracing::warn!(
                endpoint = "assess",
                status = status.as_u16(),
                body = %truncate_for_log(&body),
                "model service returned non-success status"
            );
            return Err(AppError::UpstreamUnavailable {
                message: format!("assessment service answered {status}"),
                upstream_status: Some(status.as_u16()),
            });
        }

        parse_report(&body)
    }

    /// Ask the model for the agent's next reply.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<String, AppError> {
        let response = self
            .http
            .post(self.endpoint("generate"))
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error("generate", &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("generate", &e))?;

        if !status.is_success() {
            tracing::warn!(
                endpoint = "generate",
                status = status.as_u16(),
                body = %truncate_for_log(&body),
                "model service returned non-success status"
            );
            return Err(AppError::UpstreamUnavailable {
                message: format!("generation service answered {status}"),
                upstream_status: Some(status.as_u16()),
            });
        }

        parse_reply(&body)
    }

    // `Url::join` drops the last path segment of slashless bases, so endpoints
    // are concatenated on the normalized string instead.
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }
}

fn transport_error(endpoint: &str, err: &reqwest::Error) -> AppError {
    tracing::warn!(endpoint, error = %err, "model service request failed");

    let message = if err.is_timeout() {
        format!("model service timed out on /{endpoint}")
    } else {
        format!("model service unreachable on /{endpoint}")
    };

    AppError::UpstreamUnavailable {
        message,
        upstream_status: None,
    }
}

/// Parse a 2xx assessment body. A parse failure here is a contract violation
/// rather than a transport one; the raw body is logged for postmortem.
fn parse_report(body: &str) -> Result<AssessmentReport, AppError> {
    serde_json::from_str::<AssessmentReport>(body).map_err(|e| {
        tracing::error!(
            error = %e,
            body = %truncate_for_log(body),
            "assessment service returned 2xx with a malformed body"
        );
        AppError::UpstreamContract {
            message: format!("assessment response failed validation: {e}"),
        }
    })
}

fn parse_reply(body: &str) -> Result<String, AppError> {
    serde_json::from_str::<GenerateResponse>(body)
        .map(|parsed| parsed.result)
        .map_err(|e| {
            tracing::error!(
                error = %e,
                body = %truncate_for_log(body),
                "generation service returned 2xx with a malformed body"
            );
            AppError::UpstreamContract {
                message: format!("generation response failed validation: {e}"),
            }
        })
}

fn truncate_for_log(body: &str) -> String {
    if body.len() <= LOG_BODY_MAX {
        return body.to_string();
    }

    let mut end = LOG_BODY_MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} [truncated, {} bytes total]", &body[..end], body.len())
}
