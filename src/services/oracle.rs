use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::config::{OracleQuality, Settings};

const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Error)]
pub(crate) enum OracleError {
    #[error("oracle request timed out")]
    Timeout,
    #[error("oracle transport error: {0}")]
    Transport(String),
    #[error("oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed oracle response: {0}")]
    Malformed(String),
}

impl OracleError {
    /// Low-cardinality label for metrics.
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
            Self::Status { .. } => "status",
            Self::Malformed(_) => "malformed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum OracleOperation {
    RubricGrade,
    SemanticSimilarity,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct OracleRequest {
    pub(crate) operation: OracleOperation,
    pub(crate) quality: OracleQuality,
    pub(crate) payload: OraclePayload,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct OraclePayload {
    pub(crate) question: String,
    pub(crate) submission: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) rubric_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) answer_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) custom_instructions: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OracleResponse {
    #[serde(default)]
    pub(crate) provider: String,
    pub(crate) content: OracleContent,
}

/// The gateway hands back either a JSON object or a string that should contain one,
/// sometimes wrapped in a markdown fence.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum OracleContent {
    Text(String),
    Structured(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct OracleCriterion {
    pub(crate) name: String,
    pub(crate) score: f64,
    pub(crate) feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct RubricGrade {
    pub(crate) score: f64,
    pub(crate) max_score: f64,
    pub(crate) feedback: String,
    pub(crate) criteria: Vec<OracleCriterion>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct SemanticAssessment {
    pub(crate) matched_concepts: Vec<String>,
    pub(crate) partially_matched_concepts: Vec<String>,
    pub(crate) missing_concepts: Vec<String>,
    pub(crate) similarity_percent: Option<f64>,
    pub(crate) reasoning: String,
}

#[async_trait]
pub(crate) trait ScoringOracle: Send + Sync {
    async fn grade(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;
}

impl OracleContent {
    pub(crate) fn into_object(self) -> Result<Map<String, Value>, OracleError> {
        let value = match self {
            Self::Structured(value) => value,
            Self::Text(text) => parse_text_content(&text)?,
        };

        match value {
            Value::Object(map) => Ok(map),
            other => Err(OracleError::Malformed(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn parse_text_content(text: &str) -> Result<Value, OracleError> {
    let unfenced = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        // A JSON string holding JSON is still just text.
        if let Value::String(inner) = &value {
            return parse_text_content(inner);
        }
        return Ok(value);
    }

    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&unfenced[start..=end])
            .map_err(|err| OracleError::Malformed(format!("content is not JSON: {err}"))),
        _ => Err(OracleError::Malformed(String::from("content is not JSON"))),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn lenient_number(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|number| number.is_finite())
}

fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(|text| text.trim().to_string())
}

fn first_number(map: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| lenient_number(map.get(*key)))
}

/// Canonical `{score, max_score, feedback, criteria}` shape for the rubric path.
pub(crate) fn normalize_rubric_grade(content: OracleContent) -> Result<RubricGrade, OracleError> {
    let map = content.into_object()?;

    let raw_criteria = match map.get("criteria").or_else(|| map.get("criteria_scores")) {
        Some(Value::Array(items)) => items.as_slice(),
        Some(other) => {
            return Err(OracleError::Malformed(format!(
                "criteria must be an array, got {}",
                json_kind(other)
            )))
        }
        None => &[][..],
    };

    let mut criteria = Vec::with_capacity(raw_criteria.len());
    for (index, item) in raw_criteria.iter().enumerate() {
        let Value::Object(entry) = item else {
            return Err(OracleError::Malformed(format!("criterion #{index} is not an object")));
        };
        let name = first_string(entry, &["name", "criterion_name", "criterion"])
            .filter(|name| !name.is_empty())
            .ok_or_else(|| OracleError::Malformed(format!("criterion #{index} has no name")))?;
        let score = first_number(entry, &["score", "points"]).ok_or_else(|| {
            OracleError::Malformed(format!("criterion '{name}' has no numeric score"))
        })?;
        let feedback = first_string(entry, &["feedback", "comment"]).unwrap_or_default();
        criteria.push(OracleCriterion { name, score, feedback });
    }

    let score = match first_number(&map, &["score", "total_score"]) {
        Some(score) => score,
        None if !criteria.is_empty() => criteria.iter().map(|item| item.score).sum(),
        None => return Err(OracleError::Malformed(String::from("response has no score"))),
    };

    Ok(RubricGrade {
        score,
        max_score: first_number(&map, &["max_score", "maxscore"]).unwrap_or(0.0),
        feedback: first_string(&map, &["feedback", "reasoning"]).unwrap_or_default(),
        criteria,
    })
}

fn concept_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    let Some(Value::Array(items)) = map.get(key) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Object(entry) => first_string(entry, &["concept", "name", "term"]),
            _ => None,
        })
        .filter(|concept| !concept.is_empty())
        .collect()
}

pub(crate) fn normalize_semantic(content: OracleContent) -> Result<SemanticAssessment, OracleError> {
    let map = content.into_object()?;

    let assessment = SemanticAssessment {
        matched_concepts: concept_list(&map, "matched_concepts"),
        partially_matched_concepts: concept_list(&map, "partially_matched_concepts"),
        missing_concepts: concept_list(&map, "missing_concepts"),
        similarity_percent: first_number(&map, &["similarity_percent", "similarity"]),
        reasoning: first_string(&map, &["reasoning", "feedback"]).unwrap_or_default(),
    };

    let total = assessment.matched_concepts.len()
        + assessment.partially_matched_concepts.len()
        + assessment.missing_concepts.len();
    if total == 0 && assessment.similarity_percent.is_none() {
        return Err(OracleError::Malformed(String::from(
            "response has neither concepts nor similarity_percent",
        )));
    }

    Ok(assessment)
}

/// HTTP client for the scoring gateway.
#[derive(Debug, Clone)]
pub(crate) struct OracleClient {
    client: Client,
    endpoint: String,
    api_key: String,
    max_attempts: u32,
}

impl OracleClient {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        let oracle = settings.oracle();
        if !oracle.is_enabled() {
            return Ok(None);
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(oracle.request_timeout_seconds))
            .build()
            .context("Failed to build oracle HTTP client")?;

        Ok(Some(Self {
            client,
            endpoint: format!("{}/grade", oracle.base_url),
            api_key: oracle.api_key.clone(),
            max_attempts: oracle.max_attempts.max(1),
        }))
    }

    async fn send_once(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        response
            .json::<OracleResponse>()
            .await
            .map_err(|err| OracleError::Malformed(format!("undecodable envelope: {err}")))
    }
}

fn map_transport_error(err: reqwest::Error) -> OracleError {
    if err.is_timeout() {
        OracleError::Timeout
    } else {
        OracleError::Transport(err.to_string())
    }
}

fn is_retryable(err: &OracleError) -> bool {
    match err {
        OracleError::Timeout | OracleError::Transport(_) => true,
        OracleError::Status { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
        }
        OracleError::Malformed(_) => false,
    }
}

#[async_trait]
impl ScoringOracle for OracleClient {
    async fn grade(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let timer = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.send_once(request).await {
                Ok(response) => {
                    tracing::info!(
                        operation = ?request.operation,
                        quality = request.quality.as_str(),
                        provider = %response.provider,
                        attempt,
                        duration_seconds = timer.elapsed().as_secs_f64(),
                        "Oracle call completed"
                    );
                    return Ok(response);
                }
                Err(err) if attempt < self.max_attempts && is_retryable(&err) => {
                    tracing::warn!(
                        operation = ?request.operation,
                        attempt,
                        error = %err,
                        "Oracle call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(2_u64.pow(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
