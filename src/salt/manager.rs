//! Per-device salt generation, persistence, caching, and rotation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};
use crate::storage::Barrier;

/// Salt length in bytes (256 bits).
pub const SALT_LEN: usize = 32;

/// Prefix identifying the hash algorithm in redaction tokens.
pub const HMAC_PREFIX: &str = "hmac-sha256:";

/// Storage key of a device's salt.
pub fn salt_storage_key(device_uuid: &Uuid) -> String {
    format!("audit/{}/salt", device_uuid)
}

/// A device's HMAC key.
pub struct Salt {
    device_uuid: Uuid,
    key: hmac::Key,
}

impl Salt {
    pub fn from_bytes(device_uuid: Uuid, bytes: &[u8; SALT_LEN]) -> Self {
        Self {
            device_uuid,
            key: hmac::Key::new(hmac::HMAC_SHA256, bytes),
        }
    }

    pub fn device_uuid(&self) -> Uuid {
        self.device_uuid
    }

    /// Hex HMAC-SHA256 of `data` keyed by this salt.
    pub fn hmac(&self, data: &[u8]) -> String {
        hex::encode(hmac::sign(&self.key, data).as_ref())
    }

    /// HMAC prefixed with the algorithm identifier, as written into entries.
    pub fn identified_hmac(&self, data: &[u8]) -> String {
        format!("{}{}", HMAC_PREFIX, self.hmac(data))
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Salt")
            .field("device_uuid", &self.device_uuid)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

struct CachedSalt {
    salt: Arc<Salt>,
    fetched_at: Instant,
}

type Slot = Arc<Mutex<Option<CachedSalt>>>;

/// Caches salts in front of the barrier.
///
/// Each device has its own slot lock, held across the barrier read and any
/// generation, so concurrent callers for one device agree on a single salt
/// while different devices never wait on each other.
///
/// Removed devices are remembered so a late lookup cannot recreate their
/// salt. Device ids are never reused.
pub struct SaltManager {
    barrier: Arc<dyn Barrier>,
    ttl: Duration,
    slots: Mutex<HashMap<Uuid, Slot>>,
    removed: Mutex<HashSet<Uuid>>,
    rng: SystemRandom,
}

impl SaltManager {
    pub fn new(barrier: Arc<dyn Barrier>, ttl: Duration) -> Self {
        Self {
            barrier,
            ttl,
            slots: Mutex::new(HashMap::new()),
            removed: Mutex::new(HashSet::new()),
            rng: SystemRandom::new(),
        }
    }

    fn slot(&self, device_uuid: Uuid) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(device_uuid).or_default())
    }

    fn ensure_present(&self, device_uuid: Uuid) -> BrokerResult<()> {
        let removed = self.removed.lock().unwrap_or_else(|e| e.into_inner());
        if removed.contains(&device_uuid) {
            return Err(BrokerError::NotFound {
                path: salt_storage_key(&device_uuid),
            });
        }
        Ok(())
    }

    /// Return the device's salt, creating and persisting one on first use.
    ///
    /// Fails with [`BrokerError::NotFound`] once the device has been removed.
    pub fn get_salt(&self, device_uuid: Uuid) -> BrokerResult<Arc<Salt>> {
        let slot = self.slot(device_uuid);
        let mut cached = slot.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_present(device_uuid)?;

        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&entry.salt));
            }
        }

        let key = salt_storage_key(&device_uuid);
        let salt = match self.barrier.get(&key)? {
            Some(bytes) => {
                let bytes: [u8; SALT_LEN] = bytes.as_slice().try_into().map_err(|_| {
                    BrokerError::storage(format!(
                        "salt for device {} is corrupt ({} bytes)",
                        device_uuid,
                        bytes.len()
                    ))
                })?;
                Arc::new(Salt::from_bytes(device_uuid, &bytes))
            }
            None => {
                let salt = self.generate_and_store(device_uuid)?;
                debug!(device = %device_uuid, "Generated salt");
                salt
            }
        };

        *cached = Some(CachedSalt {
            salt: Arc::clone(&salt),
            fetched_at: Instant::now(),
        });
        Ok(salt)
    }

    /// Replace the device's salt. Previously written entries are untouched.
    pub fn rotate(&self, device_uuid: Uuid) -> BrokerResult<Arc<Salt>> {
        let slot = self.slot(device_uuid);
        let mut cached = slot.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_present(device_uuid)?;

        let salt = self.generate_and_store(device_uuid)?;
        *cached = Some(CachedSalt {
            salt: Arc::clone(&salt),
            fetched_at: Instant::now(),
        });

        info!(device = %device_uuid, "Rotated salt");
        Ok(salt)
    }

    /// Drop the cached salt and its persisted record. Later lookups for the
    /// device fail instead of generating a new salt.
    pub fn remove(&self, device_uuid: Uuid) -> BrokerResult<()> {
        let slot = self.slot(device_uuid);
        let mut cached = slot.lock().unwrap_or_else(|e| e.into_inner());
        self.removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_uuid);
        self.barrier.delete(&salt_storage_key(&device_uuid))?;
        *cached = None;
        drop(cached);

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&device_uuid);
        Ok(())
    }

    fn generate_and_store(&self, device_uuid: Uuid) -> BrokerResult<Arc<Salt>> {
        let mut bytes = [0u8; SALT_LEN];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| BrokerError::storage("failed to generate salt"))?;
        self.barrier.put(&salt_storage_key(&device_uuid), &bytes)?;
        Ok(Arc::new(Salt::from_bytes(device_uuid, &bytes)))
    }
}
