//! The audit broker.
//!
//! Owns the set of live devices derived from the mount table and fans every
//! request/response event out to them.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::device::{Device, DeviceFactory};
use crate::error::{AggregateLogError, BrokerError, BrokerResult, DeviceFailure};
use crate::format::{EntryType, LogInput};
use crate::mount::{AuditDeviceConfig, MountEntry, MountTable, TableSnapshot, TuneInput};
use crate::salt::SaltManager;

use super::fanout::{ActiveDevice, FanOut};

/// Routes audit events to every enabled device.
///
/// ## Fail-stop
///
/// A `log_*` call fails if any device not marked `best_effort` fails or
/// times out. Callers must treat that as the audited operation not having
/// happened.
pub struct Broker {
    table: Arc<MountTable>,
    salts: Arc<SaltManager>,
    factory: DeviceFactory,
    device_timeout: Duration,
    /// Swapped whole on every mount change; fan-outs keep the one they took.
    active: RwLock<Arc<Vec<ActiveDevice>>>,
}

impl Broker {
    /// Build a broker with a live device for every entry in `table`.
    ///
    /// A mount whose device cannot be built is kept in the active set as an
    /// [`Device::Unavailable`] placeholder: logging through it fails, while
    /// the mount itself can still be tuned or disabled.
    pub fn new(
        table: Arc<MountTable>,
        salts: Arc<SaltManager>,
        factory: DeviceFactory,
        config: &BrokerConfig,
    ) -> BrokerResult<Self> {
        let broker = Self {
            table,
            salts,
            factory,
            device_timeout: config.device_timeout(),
            active: RwLock::new(Arc::new(Vec::new())),
        };

        let failures = broker.rebuild(None);
        if failures.is_empty() {
            info!(devices = broker.active().len(), "Audit broker started");
        } else {
            warn!(
                devices = broker.active().len(),
                unavailable = failures.len(),
                "Audit broker started with unavailable devices"
            );
        }
        Ok(broker)
    }

    /// Log the request half of an operation.
    pub async fn log_request(&self, input: &LogInput) -> BrokerResult<()> {
        self.log(input, EntryType::Request).await
    }

    /// Log the response half of an operation.
    pub async fn log_response(&self, input: &LogInput) -> BrokerResult<()> {
        self.log(input, EntryType::Response).await
    }

    async fn log(&self, input: &LogInput, entry_type: EntryType) -> BrokerResult<()> {
        let devices = self.active();
        if devices.is_empty() {
            debug!(entry_type = ?entry_type, "No audit devices enabled");
            return Ok(());
        }

        let fan_out = FanOut {
            devices,
            salts: Arc::clone(&self.salts),
            input: input.clone(),
            entry_type,
            time: Utc::now(),
            device_timeout: self.device_timeout,
        };

        // The pass runs in its own task so a caller that gives up cannot
        // leave the devices half-written.
        match tokio::spawn(fan_out.run()).await {
            Ok(result) => result.map_err(BrokerError::from),
            Err(e) => Err(BrokerError::Io(std::io::Error::other(format!(
                "audit fan-out task failed: {}",
                e
            )))),
        }
    }

    /// Enable a new device. The device is built before anything is persisted.
    pub async fn register(&self, config: AuditDeviceConfig) -> BrokerResult<Arc<MountEntry>> {
        let (entry, device) = self
            .table
            .enable_with(config, |entry| self.factory.build(entry))
            .await?;
        self.rebuild(Some((Arc::clone(&entry), device)));
        Ok(entry)
    }

    /// Disable a device and drop its salt.
    pub async fn deregister(&self, path: &str) -> BrokerResult<Arc<MountEntry>> {
        let entry = self.table.disable(path).await?;
        self.rebuild(None);

        if let Err(e) = self.salts.remove(entry.uuid) {
            warn!(path = %entry.path(), error = %e, "Failed to remove salt of disabled device");
        }
        Ok(entry)
    }

    /// Tune a device. When its options change, the replacement device is
    /// built before the change is persisted; a build failure leaves the old
    /// configuration and device in place.
    pub async fn tune(&self, path: &str, input: TuneInput) -> BrokerResult<Arc<MountEntry>> {
        let (entry, device) = self
            .table
            .tune_with(path, input, |working| {
                let unchanged = self
                    .table
                    .snapshot()
                    .get(working.path())
                    .is_some_and(|current| current.options == working.options);
                if unchanged {
                    Ok(None)
                } else {
                    self.factory.build(working).map(Some)
                }
            })
            .await?;

        self.rebuild(device.map(|d| (Arc::clone(&entry), d)));
        Ok(entry)
    }

    /// Replace the salt of the device at `path`.
    pub fn rotate_salt(&self, path: &str) -> BrokerResult<()> {
        let entry = self.table.get(path)?;
        self.salts.rotate(entry.uuid)?;
        info!(path = %entry.path(), "Audit device salt rotated");
        Ok(())
    }

    /// Reopen file devices, e.g. after external log rotation.
    pub fn reload(&self) -> BrokerResult<()> {
        let failures: Vec<DeviceFailure> = self
            .active()
            .iter()
            .filter_map(|active| {
                active.device.reopen().err().map(|kind| {
                    error!(path = %active.entry.path(), error = %kind, "Failed to reopen audit device");
                    DeviceFailure {
                        path: active.entry.path().to_string(),
                        kind,
                    }
                })
            })
            .collect();

        if failures.is_empty() {
            info!("Audit devices reloaded");
            Ok(())
        } else {
            Err(AggregateLogError { failures }.into())
        }
    }

    /// Current mount table contents.
    pub fn list(&self) -> Arc<TableSnapshot> {
        self.table.snapshot()
    }

    /// Whether any device would receive an entry.
    pub fn has_devices(&self) -> bool {
        !self.active().is_empty()
    }

    fn active(&self) -> Arc<Vec<ActiveDevice>> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&active)
    }

    /// Re-derive the active set from the mount table.
    ///
    /// `prebuilt` supplies the device for an entry that was just enabled or
    /// tuned. Entries whose options are unchanged keep their live device;
    /// anything else, including a placeholder, is built fresh. Build failures
    /// are returned. The previous device stays in service for that entry, or
    /// a placeholder takes its place if there was none.
    fn rebuild(&self, mut prebuilt: Option<(Arc<MountEntry>, Device)>) -> Vec<BrokerError> {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        let snapshot = self.table.snapshot();
        let mut next = Vec::with_capacity(snapshot.len());
        let mut failures = Vec::new();

        for entry in snapshot.entries() {
            if prebuilt
                .as_ref()
                .is_some_and(|(built, _)| Arc::ptr_eq(built, entry))
            {
                if let Some((_, device)) = prebuilt.take() {
                    next.push(ActiveDevice {
                        entry: Arc::clone(entry),
                        device: Arc::new(device),
                    });
                    continue;
                }
            }

            let live = active.iter().find(|a| a.entry.uuid == entry.uuid);
            if let Some(live) = live
                .filter(|a| a.entry.options == entry.options && !a.device.is_unavailable())
            {
                next.push(ActiveDevice {
                    entry: Arc::clone(entry),
                    device: Arc::clone(&live.device),
                });
                continue;
            }

            match self.factory.build(entry) {
                Ok(device) => next.push(ActiveDevice {
                    entry: Arc::clone(entry),
                    device: Arc::new(device),
                }),
                Err(e) => {
                    error!(path = %entry.path(), error = %e, "Failed to build audit device");
                    match live.filter(|a| !a.device.is_unavailable()) {
                        Some(live) => next.push(ActiveDevice {
                            entry: Arc::clone(&live.entry),
                            device: Arc::clone(&live.device),
                        }),
                        None => next.push(ActiveDevice {
                            entry: Arc::clone(entry),
                            device: Arc::new(Device::Unavailable {
                                reason: e.to_string(),
                            }),
                        }),
                    }
                    failures.push(e);
                }
            }
        }

        *active = Arc::new(next);
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NoopDevice;
    use crate::error::{ConfigErrorKind, DeviceErrorKind};
    use crate::format::{AuditAuth, AuditRequest, Operation};
    use crate::mount::DeviceType;
    use crate::salt::{salt_storage_key, HMAC_PREFIX};
    use crate::storage::{Barrier, InMemoryBarrier};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Noop devices keyed by mount path, shared with the factory.
    #[derive(Clone, Default)]
    struct Recorders {
        devices: Arc<Mutex<HashMap<String, NoopDevice>>>,
        builds: Arc<AtomicUsize>,
        fail_builds: Arc<AtomicBool>,
    }

    impl Recorders {
        fn get(&self, path: &str) -> NoopDevice {
            self.devices
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_insert_with(NoopDevice::recording)
                .clone()
        }

        fn factory(&self) -> DeviceFactory {
            let recorders = self.clone();
            DeviceFactory::default().with_constructor(DeviceType::Noop, move |entry| {
                if recorders.fail_builds.load(Ordering::SeqCst) {
                    return Err(BrokerError::Device {
                        path: entry.path().to_string(),
                        kind: DeviceErrorKind::Io {
                            message: "sink directory is gone".to_string(),
                        },
                    });
                }
                recorders.builds.fetch_add(1, Ordering::SeqCst);
                Ok(Device::Noop(recorders.get(entry.path())))
            })
        }
    }

    struct Harness {
        barrier: Arc<InMemoryBarrier>,
        broker: Broker,
        recorders: Recorders,
    }

    fn harness(device_timeout_ms: u64) -> Harness {
        let barrier = Arc::new(InMemoryBarrier::new());
        let table = Arc::new(MountTable::new(barrier.clone()));
        let salts = Arc::new(SaltManager::new(barrier.clone(), Duration::from_secs(300)));
        let recorders = Recorders::default();
        let config = BrokerConfig {
            device_timeout_ms,
            ..BrokerConfig::default()
        };
        let broker = Broker::new(table, salts, recorders.factory(), &config).unwrap();
        Harness {
            barrier,
            broker,
            recorders,
        }
    }

    fn noop(path: &str) -> AuditDeviceConfig {
        AuditDeviceConfig::new(path, DeviceType::Noop)
    }

    fn input() -> LogInput {
        let request = AuditRequest::new("req-1", Operation::Update, "secret/data/app")
            .with_client_token("s.token", "acc-1")
            .with_data(serde_json::json!({"password": "hunter2"}));
        LogInput::request(AuditAuth::default(), request)
    }

    #[tokio::test]
    async fn test_log_without_devices_succeeds() {
        let h = harness(1_000);
        assert!(!h.broker.has_devices());
        h.broker.log_request(&input()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fans_out_with_per_device_salt() {
        let h = harness(1_000);
        h.broker.register(noop("a")).await.unwrap();
        h.broker.register(noop("b")).await.unwrap();
        assert!(h.broker.has_devices());

        h.broker.log_request(&input()).await.unwrap();

        let a = h.recorders.get("a/").json_entries();
        let b = h.recorders.get("b/").json_entries();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0]["type"], "request");

        let pa = a[0]["request"]["data"]["password"].as_str().unwrap();
        let pb = b[0]["request"]["data"]["password"].as_str().unwrap();
        assert!(pa.starts_with(HMAC_PREFIX));
        assert_ne!(pa, pb);
    }

    #[tokio::test]
    async fn test_mandatory_failure_fails_the_call() {
        let h = harness(1_000);
        h.broker
            .register(noop("soft").with_option("best_effort", "true"))
            .await
            .unwrap();
        h.broker.register(noop("hard")).await.unwrap();

        h.recorders
            .get("soft/")
            .fail_with(Some(DeviceErrorKind::NotConnected));
        h.broker.log_request(&input()).await.unwrap();

        h.recorders.get("hard/").fail_with(Some(DeviceErrorKind::Io {
            message: "disk full".to_string(),
        }));
        match h.broker.log_request(&input()).await {
            Err(BrokerError::AggregateLog(agg)) => {
                assert_eq!(agg.failures.len(), 1);
                assert!(agg.references("hard/"));
                assert!(!agg.references("soft/"));
            }
            other => panic!("expected aggregate error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_device_times_out() {
        let h = harness(50);
        h.broker.register(noop("slow")).await.unwrap();
        h.recorders
            .get("slow/")
            .delay(Some(Duration::from_millis(500)));

        match h.broker.log_request(&input()).await {
            Err(BrokerError::AggregateLog(agg)) => {
                assert_eq!(agg.failures[0].kind, DeviceErrorKind::Timeout { timeout_ms: 50 });
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fan_out_survives_caller_cancellation() {
        let h = harness(5_000);
        h.broker.register(noop("slow")).await.unwrap();
        let device = h.recorders.get("slow/");
        device.delay(Some(Duration::from_millis(100)));

        let input = input();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), h.broker.log_request(&input)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(device.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_tune_applies_to_next_entry() {
        let h = harness(1_000);
        h.broker.register(noop("file")).await.unwrap();

        h.broker
            .tune("file", TuneInput::options([("log_raw", "true")]))
            .await
            .unwrap();
        h.broker.log_request(&input()).await.unwrap();

        let entries = h.recorders.get("file/").json_entries();
        assert_eq!(entries[0]["request"]["data"]["password"], "hunter2");
    }

    #[tokio::test]
    async fn test_description_tune_keeps_live_device() {
        let h = harness(1_000);
        h.broker.register(noop("file")).await.unwrap();
        assert_eq!(h.recorders.builds.load(Ordering::SeqCst), 1);

        let entry = h
            .broker
            .tune("file/", TuneInput::description("primary"))
            .await
            .unwrap();
        assert_eq!(entry.config.description, "primary");
        assert_eq!(h.recorders.builds.load(Ordering::SeqCst), 1);

        h.broker
            .tune("file/", TuneInput::options([("hmac_accessor", "false")]))
            .await
            .unwrap();
        assert_eq!(h.recorders.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_tune_changes_nothing() {
        let h = harness(1_000);
        h.broker.register(noop("file")).await.unwrap();

        let err = h
            .broker
            .tune("file/", TuneInput::options([("file_path", "/tmp/x")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::InvalidConfig {
                kind: ConfigErrorKind::UnknownOption { .. }
            }
        ));

        assert!(h.broker.list().get("file/").unwrap().config.options.is_empty());
        h.broker.log_request(&input()).await.unwrap();
        let entries = h.recorders.get("file/").json_entries();
        assert_ne!(entries[0]["request"]["data"]["password"], "hunter2");
    }

    #[tokio::test]
    async fn test_tune_unknown_path() {
        let h = harness(1_000);
        let err = h
            .broker
            .tune("missing", TuneInput::description("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { ref path } if path == "missing/"));
    }

    #[tokio::test]
    async fn test_deregister_stops_logging_and_drops_salt() {
        let h = harness(1_000);
        let entry = h.broker.register(noop("gone")).await.unwrap();
        h.broker.log_request(&input()).await.unwrap();
        assert!(h.barrier.get(&salt_storage_key(&entry.uuid)).unwrap().is_some());

        h.broker.deregister("gone").await.unwrap();
        assert!(!h.broker.has_devices());
        assert!(h.barrier.get(&salt_storage_key(&entry.uuid)).unwrap().is_none());

        h.broker.log_request(&input()).await.unwrap();
        assert_eq!(h.recorders.get("gone/").entries().len(), 1);
    }

    #[tokio::test]
    async fn test_rotate_salt_changes_hashes() {
        let h = harness(1_000);
        h.broker.register(noop("rot")).await.unwrap();

        h.broker.log_request(&input()).await.unwrap();
        h.broker.rotate_salt("rot").unwrap();
        h.broker.log_request(&input()).await.unwrap();

        let entries = h.recorders.get("rot/").json_entries();
        assert_ne!(
            entries[0]["request"]["client_token"],
            entries[1]["request"]["client_token"]
        );
    }

    #[tokio::test]
    async fn test_response_entries_carry_response() {
        let h = harness(1_000);
        h.broker.register(noop("resp")).await.unwrap();

        let input = input().with_response(crate::format::AuditResponse::with_data(
            serde_json::json!({"lease_id": "db/creds/1"}),
        ));
        h.broker.log_response(&input).await.unwrap();

        let entries = h.recorders.get("resp/").json_entries();
        assert_eq!(entries[0]["type"], "response");
        assert!(entries[0]["response"]["data"]["lease_id"]
            .as_str()
            .unwrap()
            .starts_with(HMAC_PREFIX));
    }

    #[tokio::test]
    async fn test_unbuildable_device_fails_closed_but_stays_manageable() {
        let barrier = Arc::new(InMemoryBarrier::new());
        let table = Arc::new(MountTable::new(barrier.clone()));
        table.enable(noop("hard")).await.unwrap();
        table
            .enable(noop("soft").with_option("best_effort", "true"))
            .await
            .unwrap();

        let recorders = Recorders::default();
        recorders.fail_builds.store(true, Ordering::SeqCst);
        let salts = Arc::new(SaltManager::new(barrier, Duration::from_secs(300)));
        let broker =
            Broker::new(table, salts, recorders.factory(), &BrokerConfig::default()).unwrap();
        assert!(broker.has_devices());

        match broker.log_request(&input()).await {
            Err(BrokerError::AggregateLog(agg)) => {
                assert_eq!(agg.failures.len(), 1);
                assert!(agg.references("hard/"));
                assert!(matches!(agg.failures[0].kind, DeviceErrorKind::Io { .. }));
            }
            other => panic!("expected aggregate error, got {:?}", other),
        }
        assert!(broker.reload().is_err());

        broker
            .tune("hard", TuneInput::description("disk replaced"))
            .await
            .unwrap();
        broker.deregister("hard").await.unwrap();
        broker.log_request(&input()).await.unwrap();

        // The placeholder is retried on the next rebuild.
        recorders.fail_builds.store(false, Ordering::SeqCst);
        broker
            .tune("soft", TuneInput::description("back"))
            .await
            .unwrap();
        broker.log_request(&input()).await.unwrap();
        assert_eq!(recorders.get("soft/").entries().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_reopens_devices() {
        let h = harness(1_000);
        h.broker.register(noop("n")).await.unwrap();
        h.broker.reload().unwrap();
    }
}
