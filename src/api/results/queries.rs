use serde::Deserialize;

use crate::db::types::ResultStatus;

#[derive(Debug, Deserialize)]
pub(crate) struct ListResultsQuery {
    #[serde(default)]
    pub(super) module_instance_id: Option<String>,
    #[serde(default)]
    pub(super) status: Option<ResultStatus>,
    #[serde(default)]
    pub(super) skip: i64,
    #[serde(default = "crate::api::pagination::default_limit")]
    pub(super) limit: i64,
}
