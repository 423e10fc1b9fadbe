//! Error types for docsync Core

use crate::document::DocumentId;
use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Document has been deleted: {0}")]
    DeletedDocument(DocumentId),

    #[error("Invalid document ID: {0}")]
    InvalidDocumentId(String),

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("CRDT error: {0}")]
    Crdt(#[from] automerge::AutomergeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for docsync Core operations
pub type Result<T> = std::result::Result<T, Error>;
