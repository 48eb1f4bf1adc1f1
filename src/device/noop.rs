//! No-op audit device.
//!
//! Discards entries. A recording instance keeps every payload and can be
//! told to fail or stall, which is how the broker's fail-stop and timeout
//! handling is exercised without real sinks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::DeviceErrorKind;

#[derive(Debug, Default)]
struct State {
    record: bool,
    entries: Vec<Vec<u8>>,
    fail_with: Option<DeviceErrorKind>,
    delay: Option<Duration>,
}

/// Discarding sink. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct NoopDevice {
    state: Arc<Mutex<State>>,
}

impl NoopDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that keeps every payload it accepts.
    pub fn recording() -> Self {
        let device = Self::new();
        device.lock().record = true;
        device
    }

    /// Make every following write fail with `kind`, or succeed again with `None`.
    pub fn fail_with(&self, kind: Option<DeviceErrorKind>) {
        self.lock().fail_with = kind;
    }

    /// Stall every following write.
    pub fn delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Payloads accepted so far.
    pub fn entries(&self) -> Vec<Vec<u8>> {
        self.lock().entries.clone()
    }

    /// Accepted payloads parsed as JSON.
    pub fn json_entries(&self) -> Vec<serde_json::Value> {
        self.lock()
            .entries
            .iter()
            .filter_map(|e| serde_json::from_slice(e).ok())
            .collect()
    }

    pub async fn log(&self, payload: Vec<u8>) -> Result<(), DeviceErrorKind> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(kind) = &state.fail_with {
            return Err(kind.clone());
        }
        if state.record {
            state.entries.push(payload);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
