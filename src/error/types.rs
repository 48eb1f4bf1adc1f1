//! Error types for the audit broker.

use std::fmt;

use thiserror::Error;

/// Main error type for the broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No enabled audit device is mounted at the path.
    #[error("No audit device mounted at '{path}'")]
    NotFound { path: String },

    /// Rejected device configuration.
    #[error("Invalid audit device configuration: {kind}")]
    InvalidConfig { kind: ConfigErrorKind },

    /// Mount table or salt persistence failed. Prior state is unchanged.
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// A single device failed to persist an entry.
    #[error("Audit device '{path}' failed: {kind}")]
    Device { path: String, kind: DeviceErrorKind },

    /// One or more mandatory devices failed during a fan-out.
    #[error(transparent)]
    AggregateLog(#[from] AggregateLogError),

    /// Settings file errors.
    #[error("Configuration error: {message}")]
    Settings { message: String },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub(crate) fn invalid(kind: ConfigErrorKind) -> Self {
        Self::InvalidConfig { kind }
    }
}

/// Configuration error kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    #[error("invalid mount path '{path}'")]
    InvalidPath { path: String },

    #[error("path '{path}' is already in use")]
    PathInUse { path: String },

    #[error("unknown audit device type '{name}'")]
    UnknownDeviceType { name: String },

    #[error("option '{key}' is not supported by {device_type} devices")]
    UnknownOption { device_type: String, key: String },

    #[error("missing required option '{key}'")]
    MissingOption { key: String },

    #[error("invalid value for option '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// Device failure kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceErrorKind {
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("I/O failure: {message}")]
    Io { message: String },

    #[error("connection has not been initialized")]
    NotConnected,

    #[error("salt unavailable: {message}")]
    Salt { message: String },
}

impl From<std::io::Error> for DeviceErrorKind {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

/// One failing device inside an [`AggregateLogError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub path: String,
    pub kind: DeviceErrorKind,
}

/// Every mandatory device failure from one fan-out call.
#[derive(Error, Debug, Clone)]
pub struct AggregateLogError {
    pub failures: Vec<DeviceFailure>,
}

impl AggregateLogError {
    /// Whether the failure list mentions the device mounted at `path`.
    pub fn references(&self, path: &str) -> bool {
        self.failures.iter().any(|f| f.path == path)
    }
}

impl fmt::Display for AggregateLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} audit device(s) failed to log the entry",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.path, failure.kind)?;
        }
        Ok(())
    }
}

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_display_lists_paths() {
        let err = AggregateLogError {
            failures: vec![
                DeviceFailure {
                    path: "net/".to_string(),
                    kind: DeviceErrorKind::NotConnected,
                },
                DeviceFailure {
                    path: "file/".to_string(),
                    kind: DeviceErrorKind::Timeout { timeout_ms: 50 },
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 audit device(s)"));
        assert!(msg.contains("net/: connection has not been initialized"));
        assert!(msg.contains("file/: timed out after 50ms"));
        assert!(err.references("net/"));
        assert!(!err.references("syslog/"));
    }
}
