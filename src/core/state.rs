use std::sync::Arc;

use sqlx::PgPool;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::services::gradebook::{self, GradebookSink};
use crate::services::oracle::{OracleClient, ScoringOracle};
use crate::services::submission_source::{self, SubmissionSource};

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    redis: RedisHandle,
    oracle: Option<Arc<dyn ScoringOracle>>,
    gradebook: Arc<dyn GradebookSink>,
    submissions: Arc<dyn SubmissionSource>,
}

/// External collaborators wired into the state at startup.
pub(crate) struct Collaborators {
    pub(crate) oracle: Option<Arc<dyn ScoringOracle>>,
    pub(crate) gradebook: Arc<dyn GradebookSink>,
    pub(crate) submissions: Arc<dyn SubmissionSource>,
}

impl Collaborators {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let oracle = OracleClient::from_settings(settings)?
            .map(|client| Arc::new(client) as Arc<dyn ScoringOracle>);

        Ok(Self {
            oracle,
            gradebook: gradebook::from_settings(settings)?,
            submissions: submission_source::from_settings(settings)?,
        })
    }
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        db: PgPool,
        redis: RedisHandle,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators { oracle, gradebook, submissions } = collaborators;
        Self {
            inner: Arc::new(InnerState { settings, db, redis, oracle, gradebook, submissions }),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn oracle(&self) -> Option<&dyn ScoringOracle> {
        self.inner.oracle.as_deref()
    }

    pub(crate) fn gradebook(&self) -> &dyn GradebookSink {
        self.inner.gradebook.as_ref()
    }

    pub(crate) fn submissions(&self) -> &dyn SubmissionSource {
        self.inner.submissions.as_ref()
    }
}
