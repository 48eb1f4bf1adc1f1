//! One fan-out pass over the active devices.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::device::Device;
use crate::error::{AggregateLogError, BrokerError, DeviceErrorKind, DeviceFailure};
use crate::format::{EntryType, Formatter, LogInput};
use crate::mount::MountEntry;
use crate::salt::SaltManager;

/// A mounted entry paired with its live device.
pub(crate) struct ActiveDevice {
    pub(crate) entry: Arc<MountEntry>,
    pub(crate) device: Arc<Device>,
}

/// Everything a fan-out pass needs, owned so it can run in its own task.
pub(crate) struct FanOut {
    pub(crate) devices: Arc<Vec<ActiveDevice>>,
    pub(crate) salts: Arc<SaltManager>,
    pub(crate) input: LogInput,
    pub(crate) entry_type: EntryType,
    pub(crate) time: DateTime<Utc>,
    pub(crate) device_timeout: Duration,
}

impl FanOut {
    /// Write to every device in registration order.
    ///
    /// Best-effort failures are logged and dropped; every other failure is
    /// collected into the returned error.
    pub(crate) async fn run(self) -> Result<(), AggregateLogError> {
        let mut failures = Vec::new();

        for active in self.devices.iter() {
            let path = active.entry.path();
            match self.log_one(active).await {
                Ok(()) => debug!(path = %path, entry_type = ?self.entry_type, "Audit entry logged"),
                Err(kind) if active.entry.options.best_effort => {
                    warn!(path = %path, error = %kind, "Best-effort audit device failed");
                }
                Err(kind) => {
                    error!(path = %path, error = %kind, "Audit device failed");
                    failures.push(DeviceFailure {
                        path: path.to_string(),
                        kind,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateLogError { failures })
        }
    }

    /// Salt lookup, formatting and the device write share one timeout.
    async fn log_one(&self, active: &ActiveDevice) -> Result<(), DeviceErrorKind> {
        with_timeout(self.device_timeout, self.write(active)).await
    }

    async fn write(&self, active: &ActiveDevice) -> Result<(), DeviceErrorKind> {
        let entry = &active.entry;
        let salts = Arc::clone(&self.salts);
        let uuid = entry.uuid;

        // The barrier does file I/O and decryption.
        let salt = match tokio::task::spawn_blocking(move || salts.get_salt(uuid)).await {
            Ok(Ok(salt)) => salt,
            Ok(Err(BrokerError::NotFound { .. })) => {
                debug!(path = %entry.path(), "Audit device was disabled during fan-out");
                return Ok(());
            }
            Ok(Err(e)) => {
                return Err(DeviceErrorKind::Salt {
                    message: e.to_string(),
                })
            }
            Err(e) => {
                return Err(DeviceErrorKind::Salt {
                    message: format!("salt lookup task failed: {}", e),
                })
            }
        };

        let formatted = Formatter::new(&salt, &entry.options.format).format(
            &self.input,
            self.entry_type,
            self.time,
        );
        let payload = formatted
            .to_json_bytes(&entry.options.format.prefix)
            .map_err(|e| DeviceErrorKind::Io {
                message: format!("failed to serialize entry: {}", e),
            })?;

        active.device.log(payload).await
    }
}

/// Bound a device operation. An elapsed timer is a device failure.
pub(crate) async fn with_timeout<F>(limit: Duration, operation: F) -> Result<(), DeviceErrorKind>
where
    F: Future<Output = Result<(), DeviceErrorKind>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(DeviceErrorKind::Timeout {
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NoopDevice;
    use crate::error::BrokerResult;
    use crate::format::{AuditAuth, AuditRequest, Operation};
    use crate::mount::{AuditDeviceConfig, DeviceOptions, DeviceType};
    use crate::salt::salt_storage_key;
    use crate::storage::{Barrier, InMemoryBarrier};
    use uuid::Uuid;

    /// Barrier whose reads stall.
    struct SlowBarrier {
        inner: InMemoryBarrier,
        delay: Duration,
    }

    impl Barrier for SlowBarrier {
        fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
            std::thread::sleep(self.delay);
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: &[u8]) -> BrokerResult<()> {
            self.inner.put(key, value)
        }
        fn delete(&self, key: &str) -> BrokerResult<()> {
            self.inner.delete(key)
        }
        fn list(&self, prefix: &str) -> BrokerResult<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    fn recording_device(path: &str) -> (ActiveDevice, NoopDevice) {
        let config = AuditDeviceConfig::new(path, DeviceType::Noop);
        let options = DeviceOptions::parse(config.device_type, &config.options).unwrap();
        let recorder = NoopDevice::recording();
        let active = ActiveDevice {
            entry: Arc::new(MountEntry {
                config,
                uuid: Uuid::new_v4(),
                seq: 0,
                enabled: true,
                options,
            }),
            device: Arc::new(Device::Noop(recorder.clone())),
        };
        (active, recorder)
    }

    fn fan_out(devices: Vec<ActiveDevice>, salts: Arc<SaltManager>, timeout: Duration) -> FanOut {
        let request = AuditRequest::new("req-1", Operation::Read, "secret/data/app");
        FanOut {
            devices: Arc::new(devices),
            salts,
            input: LogInput::request(AuditAuth::default(), request),
            entry_type: EntryType::Request,
            time: Utc::now(),
            device_timeout: timeout,
        }
    }

    #[tokio::test]
    async fn test_slow_salt_lookup_is_bounded() {
        let barrier = Arc::new(SlowBarrier {
            inner: InMemoryBarrier::new(),
            delay: Duration::from_millis(300),
        });
        let salts = Arc::new(SaltManager::new(barrier, Duration::from_secs(300)));
        let (active, recorder) = recording_device("slow/");

        let err = fan_out(vec![active], salts, Duration::from_millis(50))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].kind, DeviceErrorKind::Timeout { timeout_ms: 50 });
        assert!(recorder.entries().is_empty());
    }

    #[tokio::test]
    async fn test_removed_device_is_skipped_without_new_salt() {
        let barrier = Arc::new(InMemoryBarrier::new());
        let salts = Arc::new(SaltManager::new(barrier.clone(), Duration::from_secs(300)));
        let (gone, gone_recorder) = recording_device("gone/");
        let (kept, kept_recorder) = recording_device("kept/");
        let gone_uuid = gone.entry.uuid;
        salts.remove(gone_uuid).unwrap();

        fan_out(vec![gone, kept], salts, Duration::from_secs(1))
            .run()
            .await
            .unwrap();

        assert!(gone_recorder.entries().is_empty());
        assert_eq!(kept_recorder.entries().len(), 1);
        assert!(barrier.get(&salt_storage_key(&gone_uuid)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let ok = with_timeout(Duration::from_secs(1), async { Ok(()) }).await;
        assert_eq!(ok, Ok(()));

        let err = with_timeout(Duration::from_secs(1), async {
            Err(DeviceErrorKind::NotConnected)
        })
        .await;
        assert_eq!(err, Err(DeviceErrorKind::NotConnected));
    }

    #[tokio::test]
    async fn test_with_timeout_elapsed() {
        let err = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(err, Err(DeviceErrorKind::Timeout { timeout_ms: 10 }));
    }
}
