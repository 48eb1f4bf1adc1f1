//! Turns a raw [`LogInput`] into a redacted [`AuditEntry`].
//!
//! Formatting is a pure function of the input, the device's salt, its
//! options, and the timestamp captured by the broker.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::mount::FormatOptions;
use crate::salt::Salt;

use super::entry::{AuditEntry, EntryType};
use super::hasher::Hasher;
use super::input::{AuditAuth, AuditRequest, AuditResponse, LogInput, Operation, WrapInfo};

/// Formats entries for one device.
pub struct Formatter<'a> {
    options: &'a FormatOptions,
    hasher: Hasher<'a>,
}

impl<'a> Formatter<'a> {
    pub fn new(salt: &'a Salt, options: &'a FormatOptions) -> Self {
        Self {
            options,
            hasher: Hasher::new(salt, &options.hmac_keys),
        }
    }

    /// Build the entry for `input`. Response data is only carried on
    /// response entries.
    pub fn format(
        &self,
        input: &LogInput,
        entry_type: EntryType,
        time: DateTime<Utc>,
    ) -> AuditEntry {
        let response = match entry_type {
            EntryType::Request => None,
            EntryType::Response => Some(
                input
                    .response
                    .as_ref()
                    .map(|r| self.response(r, input.request.operation))
                    .unwrap_or_default(),
            ),
        };

        AuditEntry {
            time,
            entry_type,
            auth: self.auth(&input.auth),
            request: self.request(&input.request),
            response,
            error: input.error.clone(),
        }
    }

    fn raw(&self) -> bool {
        self.options.log_raw
    }

    fn token(&self, value: &Option<String>) -> Option<String> {
        match value {
            Some(v) if !self.raw() && !v.is_empty() => Some(self.hasher.hash_str(v)),
            other => other.clone(),
        }
    }

    fn accessor(&self, value: &Option<String>) -> Option<String> {
        if self.options.hmac_accessor {
            self.token(value)
        } else {
            value.clone()
        }
    }

    fn auth(&self, auth: &AuditAuth) -> AuditAuth {
        AuditAuth {
            client_token: self.token(&auth.client_token),
            accessor: self.accessor(&auth.accessor),
            ..auth.clone()
        }
    }

    fn request(&self, request: &AuditRequest) -> AuditRequest {
        let data = if self.raw() {
            request.data.clone()
        } else {
            self.hasher
                .redact_data(&request.data, &self.options.non_hmac_request_keys)
        };

        AuditRequest {
            client_token: self.token(&request.client_token),
            client_token_accessor: self.accessor(&request.client_token_accessor),
            data,
            ..request.clone()
        }
    }

    fn response(&self, response: &AuditResponse, operation: Operation) -> AuditResponse {
        let data = match elided_keys(&response.data, operation, self.options) {
            Some(keys) => {
                let keys: Vec<Value> = keys
                    .iter()
                    .map(|k| match k {
                        Value::String(s) if !self.raw() => Value::String(self.hasher.hash_str(s)),
                        other => other.clone(),
                    })
                    .collect();
                json!({ "keys": keys })
            }
            None if self.raw() => response.data.clone(),
            None => self
                .hasher
                .redact_data(&response.data, &self.options.non_hmac_response_keys),
        };

        AuditResponse {
            data,
            auth: response.auth.as_ref().map(|a| self.auth(a)),
            wrap_info: response.wrap_info.as_ref().map(|w| WrapInfo {
                token: self.token(&Some(w.token.clone())).unwrap_or_default(),
                accessor: self.accessor(&Some(w.accessor.clone())).unwrap_or_default(),
                ..w.clone()
            }),
            ..response.clone()
        }
    }
}

/// The key list of a list response when eliding is enabled.
fn elided_keys<'v>(
    data: &'v Value,
    operation: Operation,
    options: &FormatOptions,
) -> Option<&'v Vec<Value>> {
    if !options.elide_list_response || operation != Operation::List {
        return None;
    }
    data.get("keys").and_then(Value::as_array)
}
