//! Document handle registry - one client session's documents and their sync
//!
//! The registry owns every live handle of a session. Local edits mark a
//! handle dirty and trigger the scheduler; each flush sends the pending
//! subscription delta and then one batched write. Inbound batches from the
//! service are routed to the handle that owns the document.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use docsync_core::automerge::Automerge;
use docsync_core::{DocumentHandle, DocumentId, HandleObserver};
use docsync_service::{
    DataService, ServiceError, SubscriptionId, SubscriptionUpdate, Update, UpdateStream,
    WriteRequest,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::scheduler::UpdateScheduler;

/// Subscription membership of one document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Never requested; created documents stay here until their first write
    NotSubscribed,
    /// Add requested, not yet acknowledged
    PendingAdd,
    Subscribed,
    /// Removal requested, not yet acknowledged
    PendingRemove,
    Unsubscribed,
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live handles
    pub documents: usize,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub writes: u64,
    pub updates_sent: u64,
    pub updates_received: u64,
    /// Inbound updates for documents with no live handle
    pub dropped_updates: u64,
    pub subscription_updates: u64,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    writes: AtomicU64,
    updates_sent: AtomicU64,
    updates_received: AtomicU64,
    dropped_updates: AtomicU64,
    subscription_updates: AtomicU64,
}

#[derive(Default)]
struct RegistryState {
    handles: HashMap<DocumentId, Arc<DocumentHandle>>,
    /// Created here, first write not sent yet
    pending_init: HashSet<DocumentId>,
    /// Local edits since the last flush
    pending_write: HashSet<DocumentId>,
    pending_subscribe_add: HashSet<DocumentId>,
    pending_subscribe_remove: HashSet<DocumentId>,
    adding: HashSet<DocumentId>,
    removing: HashSet<DocumentId>,
    subscribed: HashSet<DocumentId>,
    unsubscribed: HashSet<DocumentId>,
}

impl RegistryState {
    fn resolve(
        &self,
        ids: &HashSet<DocumentId>,
        set: &'static str,
    ) -> Result<Vec<Arc<DocumentHandle>>> {
        ids.iter()
            .map(|id| {
                self.handles.get(id).cloned().ok_or_else(|| {
                    Error::InvariantViolation(format!("{} references missing handle {}", set, id))
                })
            })
            .collect()
    }

    fn is_live(&self, id: &DocumentId) -> bool {
        self.handles.contains_key(id) && !self.pending_subscribe_remove.contains(id)
    }

    fn membership(&self, id: &DocumentId) -> Membership {
        if self.pending_subscribe_add.contains(id) || self.adding.contains(id) {
            Membership::PendingAdd
        } else if self.pending_subscribe_remove.contains(id) || self.removing.contains(id) {
            Membership::PendingRemove
        } else if self.subscribed.contains(id) {
            Membership::Subscribed
        } else if self.unsubscribed.contains(id) {
            Membership::Unsubscribed
        } else {
            Membership::NotSubscribed
        }
    }
}

struct RegistryInner {
    service: Arc<dyn DataService>,
    config: RegistryConfig,
    subscription_id: SubscriptionId,
    state: Mutex<RegistryState>,
    /// Held for the whole of a flush so flushes never overlap
    flush_lock: tokio::sync::Mutex<()>,
    scheduler: UpdateScheduler,
    stats: Counters,
    open: AtomicBool,
}

impl RegistryInner {
    async fn call<T, F>(&self, operation: &'static str, rpc: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, ServiceError>>,
    {
        let timeout = self.config.rpc_timeout();
        match tokio::time::timeout(timeout, rpc).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout { operation, timeout }),
        }
    }

    async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        self.flush_subscriptions().await?;
        self.flush_writes().await?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn scheduled_flush(&self) {
        if let Err(e) = self.flush().await {
            self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Scheduled flush failed");
        }
    }

    async fn flush_subscriptions(&self) -> Result<()> {
        let (add_ids, remove_ids) = {
            let mut state = self.state.lock();
            let add_ids: Vec<DocumentId> = state.pending_subscribe_add.drain().collect();
            let remove_ids: Vec<DocumentId> = state.pending_subscribe_remove.drain().collect();
            state.adding.extend(add_ids.iter().cloned());
            state.removing.extend(remove_ids.iter().cloned());
            (add_ids, remove_ids)
        };

        if add_ids.is_empty() && remove_ids.is_empty() {
            return Ok(());
        }

        let request = SubscriptionUpdate {
            subscription_id: self.subscription_id.clone(),
            add_ids: add_ids.clone(),
            remove_ids: remove_ids.clone(),
        };
        let timeout = self.config.rpc_timeout();
        let result = self
            .call(
                "update_subscription",
                self.service.update_subscription(request, timeout),
            )
            .await;

        let mut state = self.state.lock();
        for id in &add_ids {
            state.adding.remove(id);
        }
        for id in &remove_ids {
            state.removing.remove(id);
        }

        match result {
            Ok(()) => {
                for id in remove_ids {
                    state.subscribed.remove(&id);
                    if !state.handles.contains_key(&id) {
                        state.unsubscribed.insert(id);
                    }
                }
                for id in add_ids {
                    if state.is_live(&id) {
                        state.unsubscribed.remove(&id);
                        state.subscribed.insert(id);
                    }
                }
                self.stats
                    .subscription_updates
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                // A delete since the snapshot supersedes the add.
                let requeue: Vec<DocumentId> = add_ids
                    .into_iter()
                    .filter(|id| state.is_live(id))
                    .collect();
                debug!(
                    added = requeue.len(),
                    removed = remove_ids.len(),
                    "Re-queued subscription delta"
                );
                state.pending_subscribe_add.extend(requeue);
                state.pending_subscribe_remove.extend(remove_ids);
                Err(e)
            }
        }
    }

    async fn flush_writes(&self) -> Result<()> {
        let (created, dirty) = {
            let mut state = self.state.lock();
            let created = state.resolve(&state.pending_init, "pending_init")?;
            let dirty = state.resolve(&state.pending_write, "pending_write")?;
            state.pending_init.clear();
            state.pending_write.clear();
            (created, dirty)
        };

        let mut updates = Vec::with_capacity(created.len() + dirty.len());
        for handle in &created {
            // Deleted since the snapshot.
            let Ok(mutation) = handle.extract_pending_mutation() else {
                continue;
            };
            updates.push(Update::created(
                handle.id().clone(),
                mutation.unwrap_or_default(),
            ));
        }
        for handle in &dirty {
            if let Ok(Some(mutation)) = handle.extract_pending_mutation() {
                updates.push(Update::new(handle.id().clone(), mutation));
            }
        }

        if updates.is_empty() {
            return Ok(());
        }

        let count = updates.len() as u64;
        let created_ids: Vec<DocumentId> = updates
            .iter()
            .filter(|update| update.is_new)
            .map(|update| update.document_id.clone())
            .collect();
        let request = WriteRequest {
            subscription_id: self.subscription_id.clone(),
            updates,
        };

        let timeout = self.config.rpc_timeout();
        self.call("write", self.service.write(request, timeout))
            .await?;

        {
            let mut state = self.state.lock();
            for id in created_ids {
                if state.is_live(&id) {
                    state.subscribed.insert(id);
                }
            }
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.updates_sent.fetch_add(count, Ordering::Relaxed);
        debug!(count, "Flushed pending mutations");
        Ok(())
    }

    fn dispatch(&self, batch: Vec<Update>) {
        for update in batch {
            let handle = self.state.lock().handles.get(&update.document_id).cloned();
            let Some(handle) = handle else {
                self.stats.dropped_updates.fetch_add(1, Ordering::Relaxed);
                warn!(document = %update.document_id, "Dropping update for unknown document");
                continue;
            };

            match handle.apply_remote_mutation(&update.mutation) {
                Ok(()) => {
                    self.stats.updates_received.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        document = %update.document_id,
                        size = update.mutation.len(),
                        "Applied remote mutation"
                    );
                }
                Err(e) => {
                    error!(
                        document = %update.document_id,
                        error = %e,
                        "Failed to apply remote mutation"
                    );
                }
            }
        }
    }
}

impl HandleObserver for RegistryInner {
    fn on_local_change(&self, document_id: &DocumentId) {
        {
            let mut state = self.state.lock();
            if !state.handles.contains_key(document_id) {
                return;
            }
            state.pending_write.insert(document_id.clone());
        }
        self.scheduler.trigger();
    }

    fn on_delete(&self, document_id: &DocumentId) {
        {
            let mut state = self.state.lock();
            if state.handles.remove(document_id).is_none() {
                return;
            }
            state.pending_init.remove(document_id);
            state.pending_write.remove(document_id);
            state.pending_subscribe_add.remove(document_id);
            state.subscribed.remove(document_id);
            state.pending_subscribe_remove.insert(document_id.clone());
        }
        debug!(document = %document_id, "Handle removed from registry");
        self.scheduler.trigger();
    }
}

async fn dispatch_loop(inner: Weak<RegistryInner>, mut stream: UpdateStream) {
    while let Some(batch) = stream.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(batch);
    }
    debug!("Inbound stream ended");
}

/// Owns the document handles of one client session.
///
/// ```ignore
/// let registry = DocumentHandleRegistry::new(service, RegistryConfig::default());
/// registry.open().await?;
///
/// let handle = registry.create_from(&json!({ "title": "notes" }))?;
/// handle.change(|tx| tx.put(ROOT, "title", "plans"))?;
///
/// registry.close().await?;
/// ```
pub struct DocumentHandleRegistry {
    inner: Arc<RegistryInner>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentHandleRegistry {
    pub fn new(service: Arc<dyn DataService>, config: RegistryConfig) -> Self {
        let subscription_id = config.subscription_id();
        let scheduler = UpdateScheduler::new(config.scheduler());

        Self {
            inner: Arc::new(RegistryInner {
                service,
                config,
                subscription_id,
                state: Mutex::new(RegistryState::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                scheduler,
                stats: Counters::default(),
                open: AtomicBool::new(false),
            }),
            dispatch: Mutex::new(None),
        }
    }

    pub fn subscription_id(&self) -> &SubscriptionId {
        &self.inner.subscription_id
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Subscribe to the service and start flushing.
    pub async fn open(&self) -> Result<()> {
        if self
            .inner
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyOpen);
        }

        let stream = match self
            .inner
            .call(
                "subscribe",
                self.inner.service.subscribe(&self.inner.subscription_id),
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.open.store(false, Ordering::Release);
                return Err(e);
            }
        };

        *self.dispatch.lock() = Some(tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            stream,
        )));

        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.start(move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.scheduled_flush().await;
                }
            }
        });

        info!(subscription = %self.inner.subscription_id, "Registry opened");
        Ok(())
    }

    /// Stop the scheduler, flush whatever is pending and unsubscribe.
    ///
    /// Returns the result of the final flush; the registry is closed either
    /// way.
    pub async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }

        self.inner.scheduler.stop().await;
        let result = self.inner.flush().await;

        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }
        self.inner.open.store(false, Ordering::Release);

        match &result {
            Ok(()) => info!(subscription = %self.inner.subscription_id, "Registry closed"),
            Err(e) => warn!(
                subscription = %self.inner.subscription_id,
                error = %e,
                "Registry closed with unflushed changes"
            ),
        }
        result
    }

    /// Flush now, waiting for the RPCs.
    pub async fn flush(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        self.inner.flush().await
    }

    /// A new, empty document
    pub fn create(&self) -> Arc<DocumentHandle> {
        self.register_created(DocumentHandle::new(DocumentId::generate()))
    }

    /// A new document initialized from `seed`
    pub fn create_from<T: Serialize>(&self, seed: &T) -> Result<Arc<DocumentHandle>> {
        let handle = DocumentHandle::create_from(DocumentId::generate(), seed)?;
        Ok(self.register_created(handle))
    }

    /// A new document loaded from a full save
    pub fn import(&self, bytes: &[u8]) -> Result<Arc<DocumentHandle>> {
        let doc = Automerge::load(bytes).map_err(docsync_core::Error::from)?;
        let handle = self.create();
        handle.update(move |_| Ok(doc))?;
        Ok(handle)
    }

    /// The handle for `id`, subscribing to it if it is not live yet.
    ///
    /// A new handle is pending until the service sends the document.
    pub fn find(&self, id: DocumentId) -> Arc<DocumentHandle> {
        let handle = {
            let mut state = self.inner.state.lock();
            if let Some(handle) = state.handles.get(&id) {
                return handle.clone();
            }

            let handle = Arc::new(DocumentHandle::find(id.clone()));
            handle.observe(self.observer());
            state.handles.insert(id.clone(), handle.clone());
            state.pending_subscribe_add.insert(id);
            handle
        };

        debug!(document = %handle.id(), "Finding document");
        self.inner.scheduler.trigger();
        handle
    }

    pub fn get(&self, id: &DocumentId) -> Option<Arc<DocumentHandle>> {
        self.inner.state.lock().handles.get(id).cloned()
    }

    /// Every live handle
    pub fn handles(&self) -> Vec<Arc<DocumentHandle>> {
        self.inner.state.lock().handles.values().cloned().collect()
    }

    pub fn membership(&self, id: &DocumentId) -> Membership {
        self.inner.state.lock().membership(id)
    }

    pub fn stats(&self) -> RegistryStats {
        let stats = &self.inner.stats;
        RegistryStats {
            documents: self.inner.state.lock().handles.len(),
            flushes: stats.flushes.load(Ordering::Relaxed),
            failed_flushes: stats.failed_flushes.load(Ordering::Relaxed),
            writes: stats.writes.load(Ordering::Relaxed),
            updates_sent: stats.updates_sent.load(Ordering::Relaxed),
            updates_received: stats.updates_received.load(Ordering::Relaxed),
            dropped_updates: stats.dropped_updates.load(Ordering::Relaxed),
            subscription_updates: stats.subscription_updates.load(Ordering::Relaxed),
        }
    }

    fn register_created(&self, handle: DocumentHandle) -> Arc<DocumentHandle> {
        let handle = Arc::new(handle);
        handle.observe(self.observer());
        {
            let mut state = self.inner.state.lock();
            state
                .handles
                .insert(handle.id().clone(), handle.clone());
            state.pending_init.insert(handle.id().clone());
        }

        debug!(document = %handle.id(), "Document created");
        self.inner.scheduler.trigger();
        handle
    }

    fn observer(&self) -> Weak<dyn HandleObserver> {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        weak
    }
}

impl Drop for DocumentHandleRegistry {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for DocumentHandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandleRegistry")
            .field("subscription_id", &self.inner.subscription_id)
            .field("open", &self.is_open())
            .finish()
    }
}
