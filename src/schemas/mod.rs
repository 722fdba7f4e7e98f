use std::collections::HashMap;

use serde::Serialize;

use crate::core::time::format_primitive;
use crate::db::models::AuditEntry;
use crate::db::types::AuditEvent;

pub(crate) mod queue;
pub(crate) mod result;

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) service: String,
    pub(crate) status: String,
    pub(crate) components: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RootResponse {
    pub(crate) message: String,
    pub(crate) version: String,
    pub(crate) api_prefix: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct AuditEntryResponse {
    pub(crate) event: AuditEvent,
    pub(crate) message: Option<String>,
    pub(crate) details: serde_json::Value,
    pub(crate) created_at: String,
}

impl From<AuditEntry> for AuditEntryResponse {
    fn from(entry: AuditEntry) -> Self {
        Self {
            event: entry.event,
            message: entry.message,
            details: entry.details.0,
            created_at: format_primitive(entry.created_at),
        }
    }
}
