//! The persisted, ordered mount table of audit devices.
//!
//! Readers take cheap immutable snapshots. Writers hold a per-path lock for
//! read-modify-validate-persist and only take the snapshot write lock for the
//! final swap, so tunes on different paths run independently and a failed
//! write never becomes visible.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult, ConfigErrorKind};
use crate::storage::Barrier;

use super::entry::{normalize_path, AuditDeviceConfig, DeviceType, MountEntry, TuneInput};
use super::options::DeviceOptions;

/// Barrier prefix holding one record per mounted device.
pub const MOUNT_PREFIX: &str = "core/audit/";

/// Persisted form of a mount entry.
#[derive(Debug, Serialize, Deserialize)]
struct MountRecord {
    path: String,
    #[serde(rename = "type")]
    device_type: DeviceType,
    description: String,
    options: BTreeMap<String, String>,
    local: bool,
    enabled: bool,
    uuid: Uuid,
    seq: u64,
}

impl MountRecord {
    fn from_entry(entry: &MountEntry) -> Self {
        Self {
            path: entry.config.path.clone(),
            device_type: entry.config.device_type,
            description: entry.config.description.clone(),
            options: entry.config.options.clone(),
            local: entry.config.local,
            enabled: entry.enabled,
            uuid: entry.uuid,
            seq: entry.seq,
        }
    }

    fn into_entry(self) -> BrokerResult<MountEntry> {
        let options = DeviceOptions::parse(self.device_type, &self.options).map_err(|e| {
            BrokerError::storage(format!("stored options for '{}' are invalid: {}", self.path, e))
        })?;
        Ok(MountEntry {
            config: AuditDeviceConfig {
                path: self.path,
                device_type: self.device_type,
                description: self.description,
                options: self.options,
                local: self.local,
            },
            uuid: self.uuid,
            seq: self.seq,
            enabled: self.enabled,
            options,
        })
    }
}

fn record_key(uuid: &Uuid) -> String {
    format!("{}{}", MOUNT_PREFIX, uuid)
}

/// Immutable view of the mount table, ordered by registration.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    entries: Vec<Arc<MountEntry>>,
}

impl TableSnapshot {
    pub fn entries(&self) -> &[Arc<MountEntry>] {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&Arc<MountEntry>> {
        self.entries.iter().find(|e| e.config.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn replaced(&self, entry: Arc<MountEntry>) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|e| {
                if e.uuid == entry.uuid {
                    Arc::clone(&entry)
                } else {
                    Arc::clone(e)
                }
            })
            .collect();
        Self { entries }
    }

    fn with(&self, entry: Arc<MountEntry>) -> Self {
        let mut entries = self.entries.clone();
        entries.push(entry);
        entries.sort_by_key(|e| e.seq);
        Self { entries }
    }

    fn without(&self, uuid: Uuid) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| e.uuid != uuid)
                .cloned()
                .collect(),
        }
    }
}

/// The mount table.
pub struct MountTable {
    barrier: Arc<dyn Barrier>,
    current: RwLock<Arc<TableSnapshot>>,
    /// Serializes membership changes (enable/disable).
    membership: tokio::sync::Mutex<()>,
    path_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_seq: AtomicU64,
}

impl MountTable {
    /// An empty table persisting into `barrier`.
    pub fn new(barrier: Arc<dyn Barrier>) -> Self {
        Self::with_snapshot(barrier, TableSnapshot::default())
    }

    /// Load every enabled mount record from the barrier.
    pub fn load(barrier: Arc<dyn Barrier>) -> BrokerResult<Self> {
        let mut entries = Vec::new();
        for key in barrier.list(MOUNT_PREFIX)? {
            let Some(bytes) = barrier.get(&key)? else {
                continue;
            };
            let record: MountRecord = serde_json::from_slice(&bytes).map_err(|e| {
                BrokerError::storage(format!("corrupt mount record '{}': {}", key, e))
            })?;
            if !record.enabled {
                debug!(path = %record.path, "Skipping disabled mount record");
                continue;
            }
            entries.push(Arc::new(record.into_entry()?));
        }
        entries.sort_by_key(|e| e.seq);

        info!(count = entries.len(), "Mount table loaded");
        Ok(Self::with_snapshot(barrier, TableSnapshot { entries }))
    }

    fn with_snapshot(barrier: Arc<dyn Barrier>, snapshot: TableSnapshot) -> Self {
        let next_seq = snapshot.entries.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        Self {
            barrier,
            current: RwLock::new(Arc::new(snapshot)),
            membership: tokio::sync::Mutex::new(()),
            path_locks: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(next_seq),
        }
    }

    /// Current table contents.
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&current)
    }

    /// Look up an entry by (unnormalized) path.
    pub fn get(&self, path: &str) -> BrokerResult<Arc<MountEntry>> {
        let path = normalize_path(path)?;
        self.snapshot()
            .get(&path)
            .cloned()
            .ok_or(BrokerError::NotFound { path })
    }

    /// Mount a new device.
    pub async fn enable(&self, config: AuditDeviceConfig) -> BrokerResult<Arc<MountEntry>> {
        self.enable_with(config, |_| Ok(())).await.map(|(entry, _)| entry)
    }

    /// Mount a new device, running `prepare` on the validated entry before
    /// anything is persisted. An error from `prepare` aborts the enable.
    pub async fn enable_with<T, F>(
        &self,
        mut config: AuditDeviceConfig,
        prepare: F,
    ) -> BrokerResult<(Arc<MountEntry>, T)>
    where
        F: FnOnce(&MountEntry) -> BrokerResult<T>,
    {
        config.path = normalize_path(&config.path)?;
        let options = DeviceOptions::parse(config.device_type, &config.options)?;

        let _membership = self.membership.lock().await;

        let snapshot = self.snapshot();
        if let Some(existing) = snapshot.entries.iter().find(|e| {
            e.config.path.starts_with(&config.path) || config.path.starts_with(&e.config.path)
        }) {
            debug!(new = %config.path, existing = %existing.config.path, "Mount path conflict");
            return Err(BrokerError::invalid(ConfigErrorKind::PathInUse { path: config.path }));
        }

        let entry = MountEntry {
            config,
            uuid: Uuid::new_v4(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            enabled: true,
            options,
        };

        let prepared = prepare(&entry)?;
        self.persist(&entry)?;

        let entry = Arc::new(entry);
        self.publish(|snap| snap.with(Arc::clone(&entry)));

        info!(
            path = %entry.config.path,
            device_type = %entry.config.device_type,
            uuid = %entry.uuid,
            "Audit device enabled"
        );
        Ok((entry, prepared))
    }

    /// Unmount a device and delete its record.
    pub async fn disable(&self, path: &str) -> BrokerResult<Arc<MountEntry>> {
        let path = normalize_path(path)?;
        let _membership = self.membership.lock().await;
        let lock = self.path_lock(&path);
        let _path_guard = lock.lock().await;

        let entry = self
            .snapshot()
            .get(&path)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound { path: path.clone() })?;

        self.barrier.delete(&record_key(&entry.uuid))?;
        self.publish(|snap| snap.without(entry.uuid));

        self.path_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path);

        info!(path = %path, uuid = %entry.uuid, "Audit device disabled");
        Ok(entry)
    }

    /// Update a device's description and/or options.
    pub async fn tune(&self, path: &str, input: TuneInput) -> BrokerResult<Arc<MountEntry>> {
        self.tune_with(path, input, |_| Ok(())).await.map(|(entry, _)| entry)
    }

    /// Tune, running `prepare` on the validated working copy before it is
    /// persisted. Nothing changes if validation, `prepare`, or persistence
    /// fails.
    pub async fn tune_with<T, F>(
        &self,
        path: &str,
        input: TuneInput,
        prepare: F,
    ) -> BrokerResult<(Arc<MountEntry>, T)>
    where
        F: FnOnce(&MountEntry) -> BrokerResult<T>,
    {
        let path = normalize_path(path)?;
        let lock = self.path_lock(&path);
        let _path_guard = lock.lock().await;

        let current = self
            .snapshot()
            .get(&path)
            .cloned()
            .filter(|e| e.enabled)
            .ok_or_else(|| BrokerError::NotFound { path: path.clone() })?;

        let mut working = MountEntry::clone(&current);
        if let Some(description) = input.description {
            working.config.description = description;
        }
        if let Some(options) = input.options {
            working.options = DeviceOptions::parse(working.config.device_type, &options)?;
            working.config.options = options;
        }

        let prepared = prepare(&working)?;
        self.persist(&working)?;

        let entry = Arc::new(working);
        self.publish(|snap| snap.replaced(Arc::clone(&entry)));

        info!(path = %path, uuid = %entry.uuid, "Audit device tuned");
        Ok((entry, prepared))
    }

    fn persist(&self, entry: &MountEntry) -> BrokerResult<()> {
        let bytes = serde_json::to_vec(&MountRecord::from_entry(entry))?;
        self.barrier.put(&record_key(&entry.uuid), &bytes)
    }

    fn publish<F>(&self, update: F)
    where
        F: FnOnce(&TableSnapshot) -> TableSnapshot,
    {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Arc::new(update(&current));
    }

    fn path_lock(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.path_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(path.to_string()).or_default())
    }
}
