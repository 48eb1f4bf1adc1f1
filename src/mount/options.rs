//! Typed device options.
//!
//! The raw string map is only the wire form. It is parsed against an
//! allow-list per device type whenever a device is enabled, tuned, or loaded.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BrokerError, BrokerResult, ConfigErrorKind};

use super::entry::DeviceType;

/// Options accepted by every device type.
const COMMON_OPTIONS: &[&str] = &[
    "format",
    "prefix",
    "log_raw",
    "hmac_accessor",
    "elide_list_response",
    "elide_list_responses",
    "hmac_keys",
    "non_hmac_request_keys",
    "non_hmac_response_keys",
    "best_effort",
];

const FILE_OPTIONS: &[&str] = &["file_path", "mode", "fsync"];
const SYSLOG_OPTIONS: &[&str] = &["facility", "tag", "address"];
const SOCKET_OPTIONS: &[&str] = &["address", "socket_type", "write_timeout"];

const DEFAULT_FILE_MODE: u32 = 0o600;
/// Target of a file device whose options omit `file_path`.
pub const DEFAULT_FILE_PATH: &str = "stdout";
const DEFAULT_SYSLOG_TAG: &str = "audit-broker";
const DEFAULT_SYSLOG_SOCKET: &str = "/dev/log";
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Keys accepted for a device type.
pub fn allowed_options(device_type: DeviceType) -> impl Iterator<Item = &'static str> {
    let specific: &[&str] = match device_type {
        DeviceType::File => FILE_OPTIONS,
        DeviceType::Syslog => SYSLOG_OPTIONS,
        DeviceType::Socket => SOCKET_OPTIONS,
        DeviceType::Noop => &[],
    };
    COMMON_OPTIONS.iter().chain(specific.iter()).copied()
}

/// Validated options of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    pub format: FormatOptions,
    /// Failures are reported but never block the caller.
    pub best_effort: bool,
    pub sink: SinkOptions,
}

/// Redaction and serialization options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub log_raw: bool,
    pub hmac_accessor: bool,
    pub elide_list_response: bool,
    pub prefix: String,
    /// Extra field names whose whole value is hashed.
    pub hmac_keys: BTreeSet<String>,
    /// Top-level request data keys left in clear.
    pub non_hmac_request_keys: BTreeSet<String>,
    /// Top-level response data keys left in clear.
    pub non_hmac_response_keys: BTreeSet<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            log_raw: false,
            hmac_accessor: true,
            elide_list_response: false,
            prefix: String::new(),
            hmac_keys: BTreeSet::new(),
            non_hmac_request_keys: BTreeSet::new(),
            non_hmac_response_keys: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOptions {
    File(FileOptions),
    Syslog(SyslogOptions),
    Socket(SocketOptions),
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTarget {
    Path(PathBuf),
    Stdout,
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOptions {
    pub target: FileTarget,
    /// `None` leaves the file mode untouched.
    pub mode: Option<u32>,
    pub fsync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyslogAddress {
    Unix(PathBuf),
    Udp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyslogOptions {
    /// Numeric syslog facility code.
    pub facility: u8,
    pub tag: String,
    pub address: SyslogAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Tcp,
    Udp,
    Unix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub address: String,
    pub socket_type: SocketType,
    pub write_timeout: Duration,
}

impl DeviceOptions {
    /// Validate a raw option map for a device type.
    pub fn parse(device_type: DeviceType, raw: &BTreeMap<String, String>) -> BrokerResult<Self> {
        for key in raw.keys() {
            if !allowed_options(device_type).any(|allowed| allowed == key) {
                return Err(BrokerError::invalid(ConfigErrorKind::UnknownOption {
                    device_type: device_type.to_string(),
                    key: key.clone(),
                }));
            }
        }

        let opts = RawOptions(raw);

        if let Some(format) = opts.get("format") {
            if !format.eq_ignore_ascii_case("json") {
                return Err(invalid_value("format", format!("unsupported format '{}'", format)));
            }
        }

        let format = FormatOptions {
            log_raw: opts.bool("log_raw", false)?,
            hmac_accessor: opts.bool("hmac_accessor", true)?,
            elide_list_response: opts.bool("elide_list_response", false)?
                || opts.bool("elide_list_responses", false)?,
            prefix: opts.get("prefix").unwrap_or_default().to_string(),
            hmac_keys: opts.list("hmac_keys"),
            non_hmac_request_keys: opts.list("non_hmac_request_keys"),
            non_hmac_response_keys: opts.list("non_hmac_response_keys"),
        };

        let sink = match device_type {
            DeviceType::File => SinkOptions::File(parse_file(&opts)?),
            DeviceType::Syslog => SinkOptions::Syslog(parse_syslog(&opts)?),
            DeviceType::Socket => SinkOptions::Socket(parse_socket(&opts)?),
            DeviceType::Noop => SinkOptions::Noop,
        };

        Ok(Self {
            format,
            best_effort: opts.bool("best_effort", false)?,
            sink,
        })
    }
}

/// A missing `file_path` means stdout. Tuning replaces the whole option map,
/// so a tune that leaves it out moves the device there.
fn parse_file(opts: &RawOptions<'_>) -> BrokerResult<FileOptions> {
    let file_path = opts
        .get("file_path")
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_FILE_PATH);
    let target = match file_path {
        "stdout" => FileTarget::Stdout,
        "discard" => FileTarget::Discard,
        path => FileTarget::Path(PathBuf::from(path)),
    };

    let mode = match opts.get("mode") {
        None => Some(DEFAULT_FILE_MODE),
        Some(raw) => {
            let mode = u32::from_str_radix(raw, 8)
                .map_err(|_| invalid_value("mode", format!("'{}' is not an octal mode", raw)))?;
            if mode > 0o777 {
                return Err(invalid_value("mode", format!("'{}' is out of range", raw)));
            }
            (mode != 0).then_some(mode)
        }
    };

    Ok(FileOptions {
        target,
        mode,
        fsync: opts.bool("fsync", true)?,
    })
}

fn parse_syslog(opts: &RawOptions<'_>) -> BrokerResult<SyslogOptions> {
    let facility = match opts.get("facility") {
        None => 4,
        Some(name) => facility_code(name)
            .ok_or_else(|| invalid_value("facility", format!("unknown facility '{}'", name)))?,
    };

    let address = match opts.get("address") {
        None => SyslogAddress::Unix(PathBuf::from(DEFAULT_SYSLOG_SOCKET)),
        Some(addr) => match addr.strip_prefix("udp://") {
            Some(hostport) if !hostport.is_empty() => SyslogAddress::Udp(hostport.to_string()),
            Some(_) => return Err(invalid_value("address", "missing host:port".to_string())),
            None => SyslogAddress::Unix(PathBuf::from(addr.strip_prefix("unix://").unwrap_or(addr))),
        },
    };

    let tag = opts.get("tag").unwrap_or(DEFAULT_SYSLOG_TAG);
    if tag.is_empty() || tag.chars().any(|c| c.is_whitespace()) {
        return Err(invalid_value("tag", "must be a non-empty word".to_string()));
    }

    Ok(SyslogOptions {
        facility,
        tag: tag.to_string(),
        address,
    })
}

fn parse_socket(opts: &RawOptions<'_>) -> BrokerResult<SocketOptions> {
    let address = opts.require("address")?.to_string();

    let socket_type = match opts.get("socket_type").unwrap_or("tcp").to_lowercase().as_str() {
        "tcp" => SocketType::Tcp,
        "udp" => SocketType::Udp,
        "unix" => SocketType::Unix,
        other => {
            return Err(invalid_value(
                "socket_type",
                format!("'{}' is not one of tcp, udp, unix", other),
            ))
        }
    };

    let write_timeout = match opts.get("write_timeout") {
        None => DEFAULT_WRITE_TIMEOUT,
        Some(raw) => parse_duration(raw)
            .filter(|d| !d.is_zero())
            .ok_or_else(|| invalid_value("write_timeout", format!("'{}' is not a duration", raw)))?,
    };

    Ok(SocketOptions {
        address,
        socket_type,
        write_timeout,
    })
}

struct RawOptions<'a>(&'a BTreeMap<String, String>);

impl<'a> RawOptions<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).map(|v| v.trim())
    }

    fn require(&self, key: &str) -> BrokerResult<&'a str> {
        self.get(key).filter(|v| !v.is_empty()).ok_or_else(|| {
            BrokerError::invalid(ConfigErrorKind::MissingOption {
                key: key.to_string(),
            })
        })
    }

    fn bool(&self, key: &str, default: bool) -> BrokerResult<bool> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(invalid_value(key, format!("'{}' is not a boolean", v))),
            },
        }
    }

    fn list(&self, key: &str) -> BTreeSet<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn invalid_value(key: &str, message: String) -> BrokerError {
    BrokerError::invalid(ConfigErrorKind::InvalidValue {
        key: key.to_string(),
        message,
    })
}

fn facility_code(name: &str) -> Option<u8> {
    const NAMES: [&str; 16] = [
        "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron",
        "authpriv", "ftp", "ntp", "security", "console", "solaris-cron",
    ];
    let name = name.to_lowercase();
    if let Some(n) = name.strip_prefix("local") {
        return n.parse::<u8>().ok().filter(|n| *n <= 7).map(|n| 16 + n);
    }
    NAMES.iter().position(|f| *f == name).map(|i| i as u8)
}

/// Parse `500ms`, `2s`, `1m`, or a bare number of seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(s) = raw.strip_suffix('s') {
        return s.parse().ok().map(Duration::from_secs);
    }
    if let Some(m) = raw.strip_suffix('m') {
        return m
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs);
    }
    raw.parse().ok().map(Duration::from_secs)
}
