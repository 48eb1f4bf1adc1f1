//! Audit device sinks.
//!
//! Every variant is safe to call concurrently and serializes writes to its
//! own sink internally.

mod backoff;
mod factory;
mod file;
mod noop;
mod socket;
mod syslog;

pub use factory::{Constructor, DeviceFactory};
pub use file::FileDevice;
pub use noop::NoopDevice;
pub use socket::SocketDevice;
pub use syslog::SyslogDevice;

use crate::error::DeviceErrorKind;

/// A live audit device.
#[derive(Debug)]
pub enum Device {
    File(FileDevice),
    Syslog(SyslogDevice),
    Socket(SocketDevice),
    Noop(NoopDevice),
    /// Stands in for a mounted device that could not be built. Every write
    /// fails, so the mount still blocks logging unless it is best-effort.
    Unavailable { reason: String },
}

impl Device {
    /// Persist one serialized entry. `payload` carries no trailing newline.
    pub async fn log(&self, payload: Vec<u8>) -> Result<(), DeviceErrorKind> {
        match self {
            Device::File(d) => d.log(payload).await,
            Device::Syslog(d) => d.log(payload).await,
            Device::Socket(d) => d.log(payload).await,
            Device::Noop(d) => d.log(payload).await,
            Device::Unavailable { reason } => Err(unavailable(reason)),
        }
    }

    /// Reopen underlying files. Only file devices hold one.
    pub fn reopen(&self) -> Result<(), DeviceErrorKind> {
        match self {
            Device::File(d) => d.reopen().map_err(DeviceErrorKind::from),
            Device::Unavailable { reason } => Err(unavailable(reason)),
            _ => Ok(()),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Device::Unavailable { .. })
    }
}

fn unavailable(reason: &str) -> DeviceErrorKind {
    DeviceErrorKind::Io {
        message: format!("device could not be started: {}", reason),
    }
}
