//! Raw request/response data handed to the broker by the request layer.
//!
//! The same shapes are reused in emitted entries after redaction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Patch,
    Delete,
    List,
    Help,
}

/// Identity behind a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessor: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// The request being audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRequest {
    pub id: String,
    pub operation: Operation,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token_accessor: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl AuditRequest {
    pub fn new(id: impl Into<String>, operation: Operation, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation,
            path: path.into(),
            mount_type: None,
            remote_address: None,
            client_token: None,
            client_token_accessor: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_client_token(
        mut self,
        token: impl Into<String>,
        accessor: impl Into<String>,
    ) -> Self {
        self.client_token = Some(token.into());
        self.client_token_accessor = Some(accessor.into());
        self
    }
}

/// Response wrapping information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapInfo {
    pub token: String,
    pub accessor: String,
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_path: Option<String>,
}

/// The response being audited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditResponse {
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuditAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap_info: Option<WrapInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

impl AuditResponse {
    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }
}

/// Everything the broker needs to log one request or response event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogInput {
    #[serde(default)]
    pub auth: AuditAuth,
    pub request: AuditRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AuditResponse>,
    /// Error text when the underlying operation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogInput {
    pub fn request(auth: AuditAuth, request: AuditRequest) -> Self {
        Self {
            auth,
            request,
            response: None,
            error: None,
        }
    }

    pub fn with_response(mut self, response: AuditResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
