//! docsync - keeps CRDT documents in sync with a remote service
//!
//! Umbrella over the workspace crates:
//! - `docsync_core`: document handles and CRDT bookkeeping
//! - `docsync_service`: the remote service contract and its in-memory implementation
//! - `docsync_registry`: the per-session handle registry and flush scheduler

pub use docsync_core;
pub use docsync_registry;
pub use docsync_service;
