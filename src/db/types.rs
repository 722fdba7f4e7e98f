use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "queuestatus", rename_all = "lowercase")]
pub(crate) enum QueueStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "resultstatus", rename_all = "lowercase")]
pub(crate) enum ResultStatus {
    Draft,
    Released,
    Rejected,
}

impl ResultStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Released => "released",
            Self::Rejected => "rejected",
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Rejected)
    }

    /// Only `draft` may move, and only to a terminal state.
    pub(crate) fn can_transition_to(self, next: Self) -> bool {
        self == Self::Draft && next.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "gradingmethod", rename_all = "snake_case")]
pub(crate) enum GradingMethod {
    RubricRanges,
    Rubric,
    Keymatch,
}

impl GradingMethod {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::RubricRanges => "rubric_ranges",
            Self::Rubric => "rubric",
            Self::Keymatch => "keymatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "auditevent", rename_all = "snake_case")]
pub(crate) enum AuditEvent {
    Queued,
    Graded,
    RetryScheduled,
    Failed,
    AutoReleased,
    Released,
    Rejected,
    GradebookSyncFailed,
    GradebookSynced,
}
