//! Builds live devices from mount entries.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SocketConfig;
use crate::error::{BrokerError, BrokerResult, ConfigErrorKind, DeviceErrorKind};
use crate::mount::{DeviceType, MountEntry, SinkOptions};

use super::{Device, FileDevice, NoopDevice, SocketDevice, SyslogDevice};

/// Constructor for one device type.
pub type Constructor = Arc<dyn Fn(&MountEntry) -> BrokerResult<Device> + Send + Sync>;

/// Registry of device constructors keyed by type.
///
/// Built once at startup and handed to the broker.
#[derive(Clone)]
pub struct DeviceFactory {
    constructors: HashMap<DeviceType, Constructor>,
}

impl DeviceFactory {
    /// Factory with the built-in constructor for every device type.
    pub fn new(socket: SocketConfig) -> Self {
        let mut constructors: HashMap<DeviceType, Constructor> = HashMap::new();

        constructors.insert(
            DeviceType::File,
            Arc::new(|entry: &MountEntry| match &entry.options.sink {
                SinkOptions::File(opts) => FileDevice::open(opts)
                    .map(Device::File)
                    .map_err(|e| BrokerError::Device {
                        path: entry.path().to_string(),
                        kind: DeviceErrorKind::from(e),
                    }),
                _ => Err(mismatch(entry)),
            }),
        );
        constructors.insert(
            DeviceType::Syslog,
            Arc::new(|entry: &MountEntry| match &entry.options.sink {
                SinkOptions::Syslog(opts) => Ok(Device::Syslog(SyslogDevice::new(opts))),
                _ => Err(mismatch(entry)),
            }),
        );
        constructors.insert(
            DeviceType::Socket,
            Arc::new(move |entry: &MountEntry| match &entry.options.sink {
                SinkOptions::Socket(opts) => Ok(Device::Socket(SocketDevice::new(opts, &socket))),
                _ => Err(mismatch(entry)),
            }),
        );
        constructors.insert(
            DeviceType::Noop,
            Arc::new(|_: &MountEntry| Ok(Device::Noop(NoopDevice::new()))),
        );

        Self { constructors }
    }

    /// Replace the constructor for one type.
    pub fn with_constructor<F>(mut self, device_type: DeviceType, constructor: F) -> Self
    where
        F: Fn(&MountEntry) -> BrokerResult<Device> + Send + Sync + 'static,
    {
        self.constructors.insert(device_type, Arc::new(constructor));
        self
    }

    /// Build the live device for `entry`.
    pub fn build(&self, entry: &MountEntry) -> BrokerResult<Device> {
        let constructor = self.constructors.get(&entry.device_type()).ok_or_else(|| {
            BrokerError::invalid(ConfigErrorKind::UnknownDeviceType {
                name: entry.device_type().to_string(),
            })
        })?;
        constructor(entry)
    }
}

impl Default for DeviceFactory {
    fn default() -> Self {
        Self::new(SocketConfig::default())
    }
}

fn mismatch(entry: &MountEntry) -> BrokerError {
    BrokerError::invalid(ConfigErrorKind::InvalidValue {
        key: "type".to_string(),
        message: format!("options do not describe a {} device", entry.device_type()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{AuditDeviceConfig, DeviceOptions};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn entry(config: AuditDeviceConfig) -> MountEntry {
        let options = DeviceOptions::parse(config.device_type, &config.options).unwrap();
        MountEntry {
            config,
            uuid: Uuid::new_v4(),
            seq: 0,
            enabled: true,
            options,
        }
    }

    #[tokio::test]
    async fn test_builds_each_type() {
        let temp_dir = TempDir::new().unwrap();
        let factory = DeviceFactory::default();

        let file = entry(
            AuditDeviceConfig::new("file", DeviceType::File)
                .with_option("file_path", temp_dir.path().join("a.log").to_string_lossy()),
        );
        assert!(matches!(factory.build(&file).unwrap(), Device::File(_)));

        let syslog = entry(AuditDeviceConfig::new("syslog", DeviceType::Syslog));
        assert!(matches!(factory.build(&syslog).unwrap(), Device::Syslog(_)));

        let socket = entry(
            AuditDeviceConfig::new("net", DeviceType::Socket).with_option("address", "127.0.0.1:9"),
        );
        assert!(matches!(factory.build(&socket).unwrap(), Device::Socket(_)));

        let noop = entry(AuditDeviceConfig::new("noop", DeviceType::Noop));
        assert!(matches!(factory.build(&noop).unwrap(), Device::Noop(_)));
    }

    #[tokio::test]
    async fn test_injected_constructor() {
        let recorder = NoopDevice::recording();
        let shared = recorder.clone();
        let factory = DeviceFactory::default()
            .with_constructor(DeviceType::Noop, move |_| Ok(Device::Noop(shared.clone())));

        let device = factory
            .build(&entry(AuditDeviceConfig::new("noop", DeviceType::Noop)))
            .unwrap();
        device.log(br#"{"x":1}"#.to_vec()).await.unwrap();
        assert_eq!(recorder.entries().len(), 1);
    }

    #[test]
    fn test_unopenable_file_is_device_error() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let file = entry(
            AuditDeviceConfig::new("file", DeviceType::File)
                .with_option("file_path", blocker.join("audit.log").to_string_lossy()),
        );
        let err = DeviceFactory::default().build(&file).unwrap_err();
        assert!(matches!(err, BrokerError::Device { ref path, .. } if path == "file"));
    }
}
