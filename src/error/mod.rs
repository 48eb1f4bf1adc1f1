//! Error types for the audit broker.
//!
//! Provides a unified error handling system using thiserror.

mod types;

pub use types::*;
