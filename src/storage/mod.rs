//! Storage barrier adapters.
//!
//! The barrier is the encrypted key/value layer that persists mount records
//! and salts. The broker only needs get/put/delete/list.

mod barrier;
mod file;

pub use barrier::{Barrier, InMemoryBarrier};
pub use file::{FileBarrier, BARRIER_KEY_LEN};
