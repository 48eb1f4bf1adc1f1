//! Audit Broker Library
//!
//! Fans request/response audit events out to every enabled audit device
//! (file, syslog, network socket, no-op), redacting sensitive values with a
//! per-device salted HMAC. A failure of any device not marked best-effort
//! fails the whole log call.

pub mod broker;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod mount;
pub mod salt;
pub mod storage;

pub use broker::Broker;
pub use error::{BrokerError, BrokerResult};
