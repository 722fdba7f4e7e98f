use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::core::config::Settings;

#[derive(Debug, Error)]
pub(crate) enum GradebookError {
    #[error("gradebook transport error: {0}")]
    Transport(String),
    #[error("gradebook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// A released grade as the host gradebook receives it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct GradebookEntry {
    pub(crate) result_id: String,
    pub(crate) course_id: String,
    pub(crate) module_instance_id: String,
    pub(crate) user_id: String,
    pub(crate) grade: f64,
    pub(crate) max_grade: f64,
    pub(crate) feedback: String,
    pub(crate) released_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub(crate) enum GradeEvent {
    Released {
        result_id: String,
        module_instance_id: String,
        user_id: String,
        reviewer_id: Option<String>,
        automatic: bool,
    },
    /// The instructor has to grade this submission by hand.
    Rejected {
        result_id: String,
        module_instance_id: String,
        user_id: String,
        reviewer_id: String,
        reason: Option<String>,
    },
    GradingFailed {
        queue_id: String,
        module_instance_id: String,
        user_id: String,
        error: String,
    },
}

#[async_trait]
pub(crate) trait GradebookSink: Send + Sync {
    async fn push_grade(&self, entry: &GradebookEntry) -> Result<(), GradebookError>;
    async fn notify(&self, event: &GradeEvent) -> Result<(), GradebookError>;
}

#[derive(Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
enum WebhookEnvelope<'a> {
    Grade(&'a GradebookEntry),
    Event(&'a GradeEvent),
}

pub(crate) struct WebhookGradebook {
    client: Client,
    url: String,
}

impl WebhookGradebook {
    fn new(url: String, timeout_seconds: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to build gradebook HTTP client")?;
        Ok(Self { client, url })
    }

    async fn post(&self, envelope: WebhookEnvelope<'_>) -> Result<(), GradebookError> {
        let response = self
            .client
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|err| GradebookError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(GradebookError::Status { status: status.as_u16(), body: body.chars().take(500).collect() })
    }
}

#[async_trait]
impl GradebookSink for WebhookGradebook {
    async fn push_grade(&self, entry: &GradebookEntry) -> Result<(), GradebookError> {
        self.post(WebhookEnvelope::Grade(entry)).await
    }

    async fn notify(&self, event: &GradeEvent) -> Result<(), GradebookError> {
        self.post(WebhookEnvelope::Event(event)).await
    }
}

/// Used when no webhook is configured: grades stay in the local result table.
pub(crate) struct LogGradebook;

#[async_trait]
impl GradebookSink for LogGradebook {
    async fn push_grade(&self, entry: &GradebookEntry) -> Result<(), GradebookError> {
        tracing::info!(
            result_id = %entry.result_id,
            module_instance_id = %entry.module_instance_id,
            user_id = %entry.user_id,
            grade = entry.grade,
            max_grade = entry.max_grade,
            "Gradebook push (log only)"
        );
        Ok(())
    }

    async fn notify(&self, event: &GradeEvent) -> Result<(), GradebookError> {
        tracing::info!(event = ?event, "Gradebook event (log only)");
        Ok(())
    }
}

pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn GradebookSink>> {
    let gradebook = settings.gradebook();
    if gradebook.webhook_url.is_empty() {
        return Ok(Arc::new(LogGradebook));
    }

    let sink = WebhookGradebook::new(gradebook.webhook_url.clone(), gradebook.request_timeout_seconds)?;
    Ok(Arc::new(sink))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Captures everything it is sent; can be switched into a failing mode.
    #[derive(Default)]
    pub(crate) struct RecordingGradebook {
        pub(crate) fail_pushes: AtomicBool,
        entries: Mutex<Vec<GradebookEntry>>,
        events: Mutex<Vec<GradeEvent>>,
    }

    impl RecordingGradebook {
        pub(crate) fn failing() -> Self {
            let sink = Self::default();
            sink.fail_pushes.store(true, Ordering::SeqCst);
            sink
        }

        pub(crate) fn entries(&self) -> Vec<GradebookEntry> {
            self.entries.lock().unwrap().clone()
        }

        pub(crate) fn events(&self) -> Vec<GradeEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GradebookSink for RecordingGradebook {
        async fn push_grade(&self, entry: &GradebookEntry) -> Result<(), GradebookError> {
            if self.fail_pushes.load(Ordering::SeqCst) {
                return Err(GradebookError::Status { status: 503, body: String::from("down") });
            }
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn notify(&self, event: &GradeEvent) -> Result<(), GradebookError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn webhook_envelope_tags_payload_kind() {
        let event = GradeEvent::Rejected {
            result_id: "r1".into(),
            module_instance_id: "m1".into(),
            user_id: "u1".into(),
            reviewer_id: "t1".into(),
            reason: None,
        };
        let value = serde_json::to_value(WebhookEnvelope::Event(&event)).unwrap();
        assert_eq!(value["kind"], "event");
        assert_eq!(value["data"]["event"], "rejected");
        assert_eq!(value["data"]["reviewer_id"], "t1");
    }

    #[test]
    fn grade_envelope_carries_entry_fields() {
        let entry = GradebookEntry {
            result_id: "r1".into(),
            course_id: "c1".into(),
            module_instance_id: "m1".into(),
            user_id: "u1".into(),
            grade: 7.5,
            max_grade: 10.0,
            feedback: "ok".into(),
            released_at: "2025-01-01T00:00:00".into(),
        };
        let value = serde_json::to_value(WebhookEnvelope::Grade(&entry)).unwrap();
        assert_eq!(value["kind"], "grade");
        assert_eq!(value["data"]["grade"], json!(7.5));
    }

    #[tokio::test]
    async fn log_gradebook_accepts_everything() {
        let sink = LogGradebook;
        let event = GradeEvent::GradingFailed {
            queue_id: "q".into(),
            module_instance_id: "m".into(),
            user_id: "u".into(),
            error: "boom".into(),
        };
        assert!(sink.notify(&event).await.is_ok());
    }
}
