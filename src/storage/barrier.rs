//! The storage barrier contract and an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::BrokerResult;

/// Key/value storage that encrypts everything written through it.
///
/// Keys are `/`-separated. `list` is shallow: it returns the full keys of
/// values stored directly under `prefix`, never of nested "directories".
pub trait Barrier: Send + Sync {
    fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> BrokerResult<()>;

    fn delete(&self, key: &str) -> BrokerResult<()>;

    fn list(&self, prefix: &str) -> BrokerResult<Vec<String>>;
}

/// Barrier backed by a map in process memory.
#[derive(Default)]
pub struct InMemoryBarrier {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Barrier for InMemoryBarrier {
    fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> BrokerResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> BrokerResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> BrokerResult<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .filter(|k| !k[prefix.len()..].contains('/'))
            .cloned()
            .collect())
    }
}
