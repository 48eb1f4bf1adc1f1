//! Mount table entry types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult, ConfigErrorKind};

use super::options::DeviceOptions;

/// Kind of sink an audit device writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    File,
    Syslog,
    Socket,
    Noop,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::File,
        DeviceType::Syslog,
        DeviceType::Socket,
        DeviceType::Noop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::File => "file",
            DeviceType::Syslog => "syslog",
            DeviceType::Socket => "socket",
            DeviceType::Noop => "noop",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                BrokerError::invalid(ConfigErrorKind::UnknownDeviceType {
                    name: s.to_string(),
                })
            })
    }
}

/// User-facing configuration of one audit device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDeviceConfig {
    /// Normalized mount path, always ending in `/`.
    pub path: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Local mounts are excluded from replication.
    #[serde(default)]
    pub local: bool,
}

impl AuditDeviceConfig {
    pub fn new(path: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            path: path.into(),
            device_type,
            description: String::new(),
            options: BTreeMap::new(),
            local: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }
}

/// A mounted device as held by the mount table.
///
/// `options` is the validated form of `config.options`; both always agree.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub config: AuditDeviceConfig,
    pub uuid: Uuid,
    /// Registration order.
    pub seq: u64,
    pub enabled: bool,
    pub options: DeviceOptions,
}

impl MountEntry {
    pub fn path(&self) -> &str {
        &self.config.path
    }

    pub fn device_type(&self) -> DeviceType {
        self.config.device_type
    }
}

/// Changes requested by a tune call.
///
/// `None` leaves the stored value alone. `Some(String::new())` clears the
/// description, which is different from not supplying one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuneInput {
    pub description: Option<String>,
    /// Replaces the whole option map when present.
    pub options: Option<BTreeMap<String, String>>,
}

impl TuneInput {
    pub fn description(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            options: None,
        }
    }

    pub fn options<I, K, V>(options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            description: None,
            options: Some(
                options
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

/// Normalize a mount path: trimmed, lowercase, exactly one trailing `/`.
pub fn normalize_path(raw: &str) -> BrokerResult<String> {
    let trimmed = raw.trim().trim_matches('/');
    let invalid = trimmed.is_empty()
        || trimmed
            .split('/')
            .any(|s| s.is_empty() || s == "." || s == ".." || s.chars().any(char::is_whitespace));

    if invalid {
        return Err(BrokerError::invalid(ConfigErrorKind::InvalidPath {
            path: raw.to_string(),
        }));
    }

    Ok(format!("{}/", trimmed.to_lowercase()))
}
