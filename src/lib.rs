//! edge-agent: service registration and policy synthesis for edge nodes
//!
//! The agent registers services published in an exchange catalog, merges
//! node-wide and per-service attributes into one configuration per service,
//! and writes the resulting policy documents that advertise the terms under
//! which this node will run each service.
//!
//! Long-running subsystems are hosted on [`worker::WorkerCore`], a small actor
//! that consumes the process-wide [`events::EventBus`] and a private command
//! queue.

pub mod arch;
pub mod attributes;
pub mod catalog;
pub mod config;
pub mod eventlog;
pub mod events;
pub mod persistence;
pub mod policy;
pub mod registrar;
pub mod resource;
pub mod worker;

pub use config::Config;
pub use registrar::{RegistrationError, ServiceRegistrar, ServiceRequest};

/// Seconds since the unix epoch.
pub(crate) fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
