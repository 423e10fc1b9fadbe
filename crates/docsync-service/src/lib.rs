//! docsync Service - the remote side of document sync
//!
//! Defines the contract a registry talks to:
//! - `subscribe`: a stream of inbound update batches for one subscription
//! - `update_subscription`: add/remove document IDs from a subscription
//! - `write`: one batched write of document mutations
//!
//! `MemoryDataService` implements it in-process for tests and demos.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use docsync_core::DocumentId;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryDataService;

/// Identifies one client session's subscription with the service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A mutation of one document, in either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub document_id: DocumentId,
    pub mutation: Bytes,
    /// Set on the first write of a document created by the client
    #[serde(default)]
    pub is_new: bool,
}

impl Update {
    pub fn new(document_id: DocumentId, mutation: impl Into<Bytes>) -> Self {
        Self {
            document_id,
            mutation: mutation.into(),
            is_new: false,
        }
    }

    pub fn created(document_id: DocumentId, mutation: impl Into<Bytes>) -> Self {
        Self {
            is_new: true,
            ..Self::new(document_id, mutation)
        }
    }
}

/// Subscription membership delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub subscription_id: SubscriptionId,
    pub add_ids: Vec<DocumentId>,
    pub remove_ids: Vec<DocumentId>,
}

/// One batched write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub subscription_id: SubscriptionId,
    pub updates: Vec<Update>,
}

/// Stream of inbound update batches
pub type UpdateStream = BoxStream<'static, Vec<Update>>;

/// Remote data service
#[async_trait]
pub trait DataService: Send + Sync {
    /// Open the inbound stream for a subscription. Dropping the stream ends
    /// the subscription.
    async fn subscribe(&self, subscription_id: &SubscriptionId) -> Result<UpdateStream, ServiceError>;

    /// Apply a membership delta to a subscription
    async fn update_subscription(
        &self,
        request: SubscriptionUpdate,
        timeout: Duration,
    ) -> Result<(), ServiceError>;

    /// Write a batch of document mutations
    async fn write(&self, request: WriteRequest, timeout: Duration) -> Result<(), ServiceError>;
}

/// Service error types
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("Rejected mutation for {document}: {reason}")]
    RejectedMutation { document: DocumentId, reason: String },

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}
