//! docsync Registry - keeps a session's document handles in sync
//!
//! This crate provides:
//! - `DocumentHandleRegistry`: handle lifecycle, subscription membership and
//!   inbound dispatch for one client session
//! - `UpdateScheduler`: the frequency-limited, coalescing flush loop
//! - `RegistryConfig`: flush frequency, RPC timeout and subscription settings

pub mod config;
pub mod error;
pub mod registry;
pub mod scheduler;

pub use config::RegistryConfig;
pub use error::{Error, Result};
pub use registry::{DocumentHandleRegistry, Membership, RegistryStats};
pub use scheduler::{SchedulerConfig, UpdateScheduler};
