//! docsync Core - Document handles and CRDT bookkeeping
//!
//! This crate provides the leaf layer of docsync:
//! - Document identifiers and head-sets
//! - A bridge between automerge documents and JSON values
//! - `DocumentHandle`, the owner of one document and its sync state

pub mod crdt;
pub mod document;
pub mod error;
pub mod handle;

pub use automerge;

pub use crdt::Heads;
pub use document::DocumentId;
pub use error::{Error, Result};
pub use handle::{
    ChangeEvent, ChangeOrigin, DocumentHandle, DocumentStatus, HandleEvent, HandleObserver,
};
