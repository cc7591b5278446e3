//! The core module holds the device, its queues, settings and the error type. Everything else builds on these.

pub mod device;
pub mod error;
pub mod queue;
pub mod settings;
