use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::core::config::Settings;
use crate::db::models::JobPayload;

#[derive(Debug, Error)]
pub(crate) enum SourceError {
    #[error("no submission source is configured")]
    NotConfigured,
    #[error("submission source transport error: {0}")]
    Transport(String),
    #[error("submission source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("submission source returned an unexpected body: {0}")]
    Decode(String),
}

/// One host-side submission. Decoding happens per entry so that a single broken record
/// only costs that user.
#[derive(Debug, Clone)]
pub(crate) struct SourceSubmission {
    pub(crate) user_id: String,
    pub(crate) payload: Result<JobPayload, String>,
}

#[async_trait]
pub(crate) trait SubmissionSource: Send + Sync {
    async fn list_submissions(
        &self,
        module_instance_id: &str,
        user_ids: Option<&[String]>,
    ) -> Result<Vec<SourceSubmission>, SourceError>;
}

pub(crate) struct HttpSubmissionSource {
    client: Client,
    base_url: String,
    api_token: String,
}

impl HttpSubmissionSource {
    fn new(base_url: String, api_token: String, timeout_seconds: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to build submission source HTTP client")?;
        Ok(Self { client, base_url, api_token })
    }
}

#[async_trait]
impl SubmissionSource for HttpSubmissionSource {
    async fn list_submissions(
        &self,
        module_instance_id: &str,
        user_ids: Option<&[String]>,
    ) -> Result<Vec<SourceSubmission>, SourceError> {
        let url = format!("{}/instances/{module_instance_id}/submissions", self.base_url);
        let mut request = self.client.get(url);
        if let Some(user_ids) = user_ids.filter(|ids| !ids.is_empty()) {
            request = request.query(&[("user_ids", user_ids.join(","))]);
        }
        if !self.api_token.is_empty() {
            request = request.bearer_auth(&self.api_token);
        }

        let response = request.send().await.map_err(|err| SourceError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let body: Value =
            response.json().await.map_err(|err| SourceError::Decode(err.to_string()))?;
        decode_submissions(body)
    }
}

pub(crate) struct UnconfiguredSource;

#[async_trait]
impl SubmissionSource for UnconfiguredSource {
    async fn list_submissions(
        &self,
        _module_instance_id: &str,
        _user_ids: Option<&[String]>,
    ) -> Result<Vec<SourceSubmission>, SourceError> {
        Err(SourceError::NotConfigured)
    }
}

/// Accepts either a bare array or `{"submissions": [...]}`.
pub(crate) fn decode_submissions(body: Value) -> Result<Vec<SourceSubmission>, SourceError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("submissions") {
            Some(Value::Array(items)) => items,
            _ => return Err(SourceError::Decode(String::from("missing submissions array"))),
        },
        _ => return Err(SourceError::Decode(String::from("expected an array"))),
    };

    Ok(items
        .into_iter()
        .map(|item| {
            let user_id = match item.get("userid") {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => String::new(),
            };
            let payload = serde_json::from_value::<JobPayload>(item).map_err(|err| err.to_string());
            SourceSubmission { user_id, payload }
        })
        .collect())
}

pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn SubmissionSource>> {
    let host = settings.host();
    if host.submissions_url.is_empty() {
        return Ok(Arc::new(UnconfiguredSource));
    }

    let source = HttpSubmissionSource::new(
        host.submissions_url.clone(),
        host.api_token.clone(),
        host.request_timeout_seconds,
    )?;
    Ok(Arc::new(source))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Serves a fixed list of raw submission documents.
    pub(crate) struct StaticSource(pub(crate) Vec<Value>);

    #[async_trait]
    impl SubmissionSource for StaticSource {
        async fn list_submissions(
            &self,
            _module_instance_id: &str,
            user_ids: Option<&[String]>,
        ) -> Result<Vec<SourceSubmission>, SourceError> {
            let all = decode_submissions(Value::Array(self.0.clone()))?;
            Ok(match user_ids {
                Some(ids) => all.into_iter().filter(|item| ids.contains(&item.user_id)).collect(),
                None => all,
            })
        }
    }
}
