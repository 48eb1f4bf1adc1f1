//! Audit entry formatting.
//!
//! Converts raw request/response data into redacted, serializable entries.
//!
//! ## Redaction
//!
//! - Client tokens and every string leaf in request/response data are
//!   replaced by `hmac-sha256:<hex>` keyed with the device's salt
//! - Values under credential-like keys are hashed whole
//! - Accessors are hashed when `hmac_accessor` is set
//! - `log_raw` disables hashing entirely

mod entry;
mod formatter;
mod hasher;
mod input;

pub use entry::{AuditEntry, EntryType};
pub use formatter::Formatter;
pub use hasher::{canonical_bytes, Hasher};
pub use input::{AuditAuth, AuditRequest, AuditResponse, LogInput, Operation, WrapInfo};
