//! Mount table of configured audit devices.

mod entry;
mod options;
mod table;

pub use entry::{normalize_path, AuditDeviceConfig, DeviceType, MountEntry, TuneInput};
pub use options::{
    allowed_options, DeviceOptions, FileOptions, FileTarget, FormatOptions, SinkOptions,
    SocketOptions, SocketType, SyslogAddress, SyslogOptions,
};
pub use table::{MountTable, TableSnapshot, MOUNT_PREFIX};
