//! Per-device salts used as HMAC keys for redaction.

mod manager;

pub use manager::{salt_storage_key, Salt, SaltManager, HMAC_PREFIX, SALT_LEN};
