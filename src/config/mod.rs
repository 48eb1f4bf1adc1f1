//! Configuration module for the audit broker.
//!
//! Handles loading and validating broker configuration from TOML files.

mod settings;

pub use settings::*;
