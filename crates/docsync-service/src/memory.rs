//! In-memory data service
//!
//! Plays the remote for tests and demos: it keeps one document per ID,
//! merges writes into it, and pushes each write to every other
//! subscription that follows the document.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use automerge::Automerge;
use bytes::Bytes;
use dashmap::DashMap;
use docsync_core::DocumentId;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    DataService, ServiceError, SubscriptionId, SubscriptionUpdate, Update, UpdateStream,
    WriteRequest,
};

struct Subscriber {
    sender: mpsc::UnboundedSender<Vec<Update>>,
    documents: HashSet<DocumentId>,
}

/// In-memory data service
///
/// Volatile; everything is lost when it is dropped.
pub struct MemoryDataService {
    documents: DashMap<DocumentId, Automerge>,
    subscriptions: DashMap<SubscriptionId, Subscriber>,
    /// Every accepted write, in order
    writes: Mutex<Vec<WriteRequest>>,
    /// Every accepted membership delta, in order
    subscription_updates: Mutex<Vec<SubscriptionUpdate>>,
    latency_ms: AtomicU64,
    failing: AtomicBool,
}

impl MemoryDataService {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            subscriptions: DashMap::new(),
            writes: Mutex::new(Vec::new()),
            subscription_updates: Mutex::new(Vec::new()),
            latency_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Delay every RPC by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make every RPC fail with `Unavailable` until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Copy of the stored document
    pub fn document(&self, id: &DocumentId) -> Option<Automerge> {
        self.documents.get(id).map(|doc| doc.value().clone())
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn is_subscribed(&self, subscription_id: &SubscriptionId, id: &DocumentId) -> bool {
        self.subscriptions
            .get(subscription_id)
            .map_or(false, |subscriber| subscriber.documents.contains(id))
    }

    pub fn writes(&self) -> Vec<WriteRequest> {
        self.writes.lock().clone()
    }

    pub fn subscription_updates(&self) -> Vec<SubscriptionUpdate> {
        self.subscription_updates.lock().clone()
    }

    /// Merge a mutation made by some other client and push it to every
    /// subscriber of the document.
    pub fn inject(&self, id: &DocumentId, mutation: impl Into<Bytes>) -> Result<(), ServiceError> {
        let mutation = mutation.into();
        self.merge(id, &mutation)?;
        self.fan_out(None, vec![Update::new(id.clone(), mutation)]);
        Ok(())
    }

    async fn simulate(&self, operation: &str, timeout: Duration) -> Result<(), ServiceError> {
        let latency = Duration::from_millis(self.latency_ms.load(Ordering::Relaxed));
        if latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ServiceError::DeadlineExceeded(timeout));
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.failing.load(Ordering::Relaxed) {
            return Err(ServiceError::Unavailable(format!("{} rejected", operation)));
        }
        Ok(())
    }

    fn merge(&self, id: &DocumentId, mutation: &[u8]) -> Result<(), ServiceError> {
        let mut doc = self
            .documents
            .entry(id.clone())
            .or_insert_with(Automerge::new);

        doc.load_incremental(mutation)
            .map(|_| ())
            .map_err(|e| ServiceError::RejectedMutation {
                document: id.clone(),
                reason: e.to_string(),
            })
    }

    /// Send each update to every subscriber of its document except `origin`.
    fn fan_out(&self, origin: Option<&SubscriptionId>, updates: Vec<Update>) {
        let mut closed = Vec::new();

        for entry in self.subscriptions.iter() {
            if Some(entry.key()) == origin {
                continue;
            }

            let batch: Vec<Update> = updates
                .iter()
                .filter(|update| entry.documents.contains(&update.document_id))
                .map(|update| Update::new(update.document_id.clone(), update.mutation.clone()))
                .collect();

            if !batch.is_empty() && entry.sender.send(batch).is_err() {
                closed.push(entry.key().clone());
            }
        }

        for subscription_id in closed {
            debug!(subscription = %subscription_id, "Dropping closed subscription");
            self.subscriptions.remove(&subscription_id);
        }
    }
}

impl Default for MemoryDataService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn subscribe(&self, subscription_id: &SubscriptionId) -> Result<UpdateStream, ServiceError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ServiceError::Unavailable("subscribe rejected".into()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let previous = self.subscriptions.insert(
            subscription_id.clone(),
            Subscriber {
                sender,
                documents: HashSet::new(),
            },
        );
        if previous.is_some() {
            warn!(subscription = %subscription_id, "Subscription replaced");
        }
        debug!(subscription = %subscription_id, "Subscription opened");

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|batch| (batch, receiver))
        });
        Ok(stream.boxed())
    }

    async fn update_subscription(
        &self,
        request: SubscriptionUpdate,
        timeout: Duration,
    ) -> Result<(), ServiceError> {
        self.simulate("update_subscription", timeout).await?;

        let mut subscriber = self
            .subscriptions
            .get_mut(&request.subscription_id)
            .ok_or_else(|| ServiceError::UnknownSubscription(request.subscription_id.clone()))?;

        // Removals go first so that an ID in both lists ends up followed.
        for id in &request.remove_ids {
            subscriber.documents.remove(id);
        }

        // Newly followed documents that already exist are sent whole.
        let mut initial = Vec::new();
        for id in &request.add_ids {
            if subscriber.documents.insert(id.clone()) {
                if let Some(doc) = self.documents.get(id) {
                    initial.push(Update::new(id.clone(), doc.save()));
                }
            }
        }

        if !initial.is_empty() && subscriber.sender.send(initial).is_err() {
            debug!(subscription = %request.subscription_id, "Subscriber went away");
        }
        drop(subscriber);

        debug!(
            subscription = %request.subscription_id,
            added = request.add_ids.len(),
            removed = request.remove_ids.len(),
            "Subscription updated"
        );
        self.subscription_updates.lock().push(request);
        Ok(())
    }

    async fn write(&self, request: WriteRequest, timeout: Duration) -> Result<(), ServiceError> {
        self.simulate("write", timeout).await?;

        if !self.subscriptions.contains_key(&request.subscription_id) {
            return Err(ServiceError::UnknownSubscription(request.subscription_id));
        }

        for update in &request.updates {
            self.merge(&update.document_id, &update.mutation)?;

            // Creators follow the documents they create.
            if update.is_new {
                if let Some(mut subscriber) = self.subscriptions.get_mut(&request.subscription_id) {
                    subscriber.documents.insert(update.document_id.clone());
                }
            }
        }

        debug!(
            subscription = %request.subscription_id,
            count = request.updates.len(),
            "Write accepted"
        );
        self.fan_out(Some(&request.subscription_id), request.updates.clone());
        self.writes.lock().push(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::transaction::Transactable;
    use automerge::ROOT;
    use docsync_core::crdt;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn doc_with_title(title: &str) -> Automerge {
        crdt::from_seed(&json!({ "title": title })).unwrap()
    }

    async fn next_batch(stream: &mut UpdateStream) -> Vec<Update> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("no batch received")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_write_fans_out_to_other_subscribers() {
        let service = MemoryDataService::new();
        let writer = SubscriptionId::new("writer");
        let reader = SubscriptionId::new("reader");
        let mut writer_stream = service.subscribe(&writer).await.unwrap();
        let mut reader_stream = service.subscribe(&reader).await.unwrap();

        let id = DocumentId::new("doc:1").unwrap();
        let doc = doc_with_title("first");
        service
            .write(
                WriteRequest {
                    subscription_id: writer.clone(),
                    updates: vec![Update::created(id.clone(), doc.save())],
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        assert!(service.is_subscribed(&writer, &id));

        service
            .update_subscription(
                SubscriptionUpdate {
                    subscription_id: reader.clone(),
                    add_ids: vec![id.clone()],
                    remove_ids: vec![],
                },
                TIMEOUT,
            )
            .await
            .unwrap();

        let initial = next_batch(&mut reader_stream).await;
        assert_eq!(initial.len(), 1);
        let mut replica = Automerge::new();
        replica.load_incremental(&initial[0].mutation).unwrap();
        assert_eq!(crdt::to_json(&replica).unwrap()["title"], json!("first"));

        let mut edited = doc.fork();
        let before = edited.get_heads();
        assert!(edited
            .transact(|tx| tx.put(ROOT, "title", "second"))
            .is_ok());
        service
            .write(
                WriteRequest {
                    subscription_id: writer.clone(),
                    updates: vec![Update::new(id.clone(), edited.save_after(&before))],
                },
                TIMEOUT,
            )
            .await
            .unwrap();

        let pushed = next_batch(&mut reader_stream).await;
        replica.load_incremental(&pushed[0].mutation).unwrap();
        assert_eq!(crdt::to_json(&replica).unwrap()["title"], json!("second"));

        // The writer never hears its own writes.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), writer_stream.next())
                .await
                .is_err()
        );
        assert_eq!(service.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_removed_documents_stop_flowing() {
        let service = MemoryDataService::new();
        let reader = SubscriptionId::new("reader");
        let mut stream = service.subscribe(&reader).await.unwrap();
        let id = DocumentId::new("doc:2").unwrap();

        service
            .update_subscription(
                SubscriptionUpdate {
                    subscription_id: reader.clone(),
                    add_ids: vec![id.clone()],
                    remove_ids: vec![],
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        service.inject(&id, doc_with_title("x").save()).unwrap();
        assert_eq!(next_batch(&mut stream).await.len(), 1);

        service
            .update_subscription(
                SubscriptionUpdate {
                    subscription_id: reader.clone(),
                    add_ids: vec![],
                    remove_ids: vec![id.clone()],
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        service.inject(&id, doc_with_title("y").save()).unwrap();

        assert!(!service.is_subscribed(&reader, &id));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stream.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unknown_subscription_rejected() {
        let service = MemoryDataService::new();
        let result = service
            .write(
                WriteRequest {
                    subscription_id: SubscriptionId::new("ghost"),
                    updates: vec![],
                },
                TIMEOUT,
            )
            .await;

        assert!(matches!(result, Err(ServiceError::UnknownSubscription(_))));
    }

    #[tokio::test]
    async fn test_failure_and_deadline_injection() {
        let service = MemoryDataService::new();
        let id = SubscriptionId::new("s");
        let _stream = service.subscribe(&id).await.unwrap();
        let request = WriteRequest {
            subscription_id: id,
            updates: vec![],
        };

        service.set_failing(true);
        assert!(matches!(
            service.write(request.clone(), TIMEOUT).await,
            Err(ServiceError::Unavailable(_))
        ));

        service.set_failing(false);
        service.set_latency(Duration::from_millis(200));
        assert!(matches!(
            service.write(request, Duration::from_millis(10)).await,
            Err(ServiceError::DeadlineExceeded(_))
        ));
        assert!(service.writes().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_stream_ends_subscription() {
        let service = MemoryDataService::new();
        let reader = SubscriptionId::new("reader");
        let stream = service.subscribe(&reader).await.unwrap();
        let id = DocumentId::new("doc:3").unwrap();
        service
            .update_subscription(
                SubscriptionUpdate {
                    subscription_id: reader.clone(),
                    add_ids: vec![id.clone()],
                    remove_ids: vec![],
                },
                TIMEOUT,
            )
            .await
            .unwrap();

        drop(stream);
        service.inject(&id, doc_with_title("z").save()).unwrap();

        assert!(!service.is_subscribed(&reader, &id));
    }
}
