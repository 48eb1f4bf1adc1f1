//! Audit broker: fan-out of audit events to every enabled device.

mod fanout;
mod service;

pub use service::Broker;
