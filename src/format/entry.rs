//! Audit entry types.
//!
//! Defines the structure of emitted audit entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::input::{AuditAuth, AuditRequest, AuditResponse};

/// Whether an entry records the request or the response half of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Request,
    Response,
}

/// A single redacted audit entry.
///
/// Produced once per device per logged event and only ever read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub auth: AuditAuth,
    pub request: AuditRequest,
    /// Only present on response entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AuditResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    /// Serialize as one JSON document preceded by `prefix`, without a newline.
    pub fn to_json_bytes(&self, prefix: &str) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(prefix.as_bytes());
        serde_json::to_writer(&mut out, self)?;
        Ok(out)
    }
}
