//! Document handles - the single owner of one document and its sync bookkeeping

use std::sync::Weak;

use automerge::patches::TextRepresentation;
use automerge::transaction::Transaction;
use automerge::{Automerge, AutomergeError, Patch, ReadDoc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::crdt::{self, Heads};
use crate::document::DocumentId;
use crate::error::{Error, Result};

/// Default buffer size of the per-handle event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle status of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    /// Waiting for the first remote mutation
    Pending,
    /// Holds a usable document
    Ready,
    /// Tombstoned; every further operation fails
    Deleted,
}

/// Where a change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// A change to a handle's document
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub document_id: DocumentId,
    pub origin: ChangeOrigin,
    /// Heads after the change
    pub heads: Heads,
    /// Forward patches from the previous heads to `heads`
    pub patches: Vec<Patch>,
}

/// Events published to external listeners
#[derive(Debug, Clone)]
pub enum HandleEvent {
    Change(ChangeEvent),
    Deleted(DocumentId),
}

/// The internal listener of a handle.
///
/// Only local edits and deletion are reported; remote merges never need
/// to be written back.
pub trait HandleObserver: Send + Sync {
    fn on_local_change(&self, document_id: &DocumentId);
    fn on_delete(&self, document_id: &DocumentId);
}

struct HandleState {
    /// `None` once deleted
    doc: Option<Automerge>,
    last_synced_heads: Heads,
}

/// Owns exactly one automerge document.
///
/// All mutation goes through the handle so that it can track which heads
/// have already been handed out for sending.
pub struct DocumentHandle {
    id: DocumentId,
    state: Mutex<HandleState>,
    status: watch::Sender<DocumentStatus>,
    events: broadcast::Sender<HandleEvent>,
    observer: Mutex<Option<Weak<dyn HandleObserver>>>,
}

impl DocumentHandle {
    fn with_doc_state(id: DocumentId, doc: Automerge, status: DocumentStatus) -> Self {
        let (status, _) = watch::channel(status);
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);

        Self {
            id,
            state: Mutex::new(HandleState {
                doc: Some(doc),
                last_synced_heads: Heads::default(),
            }),
            status,
            events,
            observer: Mutex::new(None),
        }
    }

    /// A fresh, ready handle holding an empty document
    pub fn new(id: DocumentId) -> Self {
        Self::with_doc_state(id, Automerge::new(), DocumentStatus::Ready)
    }

    /// A fresh, ready handle whose document is initialized from `seed`
    pub fn create(id: DocumentId, seed: &serde_json::Value) -> Result<Self> {
        let doc = crdt::from_seed(seed)?;
        Ok(Self::with_doc_state(id, doc, DocumentStatus::Ready))
    }

    /// Like [`DocumentHandle::create`], seeding from any serializable value
    pub fn create_from<T: Serialize>(id: DocumentId, seed: &T) -> Result<Self> {
        Self::create(id, &serde_json::to_value(seed)?)
    }

    /// A pending handle for a document that lives elsewhere.
    ///
    /// It becomes ready on the first [`DocumentHandle::apply_remote_mutation`].
    pub fn find(id: DocumentId) -> Self {
        Self::with_doc_state(id, Automerge::new(), DocumentStatus::Pending)
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn status(&self) -> DocumentStatus {
        *self.status.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == DocumentStatus::Ready
    }

    pub fn is_deleted(&self) -> bool {
        self.status() == DocumentStatus::Deleted
    }

    /// Install the internal listener, replacing any previous one
    pub fn observe(&self, observer: Weak<dyn HandleObserver>) {
        *self.observer.lock() = Some(observer);
    }

    /// Listen for change and deletion events
    pub fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.events.subscribe()
    }

    /// Wait until the document is ready.
    ///
    /// Fails if the handle is deleted before it ever becomes ready.
    pub async fn when_ready(&self) -> Result<()> {
        let mut rx = self.status.subscribe();
        let status = rx
            .wait_for(|status| *status != DocumentStatus::Pending)
            .await
            .map(|status| *status)
            .unwrap_or(DocumentStatus::Deleted);

        match status {
            DocumentStatus::Deleted => Err(Error::DeletedDocument(self.id.clone())),
            _ => Ok(()),
        }
    }

    /// Wait until ready, then return a copy of the document
    pub async fn doc(&self) -> Result<Automerge> {
        self.when_ready().await?;
        self.doc_sync()
    }

    /// Copy of the current document, ready or not
    pub fn doc_sync(&self) -> Result<Automerge> {
        self.with_doc(Automerge::clone)
    }

    /// Read the current document in place
    pub fn with_doc<R>(&self, f: impl FnOnce(&Automerge) -> R) -> Result<R> {
        let state = self.state.lock();
        let doc = state
            .doc
            .as_ref()
            .ok_or_else(|| Error::DeletedDocument(self.id.clone()))?;
        Ok(f(doc))
    }

    /// The current document hydrated into JSON
    pub fn to_json(&self) -> Result<serde_json::Value> {
        self.with_doc(|doc| crdt::to_json(doc))?
    }

    /// The current document deserialized into `T`
    pub fn read<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }

    pub fn heads(&self) -> Result<Heads> {
        self.with_doc(Heads::of)
    }

    /// Heads that have already been handed out by `extract_pending_mutation`
    /// or absorbed from the remote
    pub fn last_synced_heads(&self) -> Heads {
        self.state.lock().last_synced_heads.clone()
    }

    /// Apply `mutator` to the document in one transaction.
    ///
    /// A failing mutator's error is returned as is; nothing is committed
    /// and no event is emitted.
    pub fn change<O, F>(&self, mutator: F) -> Result<O>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<O, AutomergeError>,
    {
        let (output, event) = {
            let mut state = self.state.lock();
            let doc = self.live_doc(&mut state)?;

            let before = Heads::of(doc);
            let output = doc.transact(mutator).map_err(|failure| failure.error)?.result;
            (output, self.change_event(doc, &before, ChangeOrigin::Local))
        };

        self.publish_local(event);
        Ok(output)
    }

    /// Apply `mutator` on a branch rooted at `heads` and merge it back.
    ///
    /// Returns the heads of the branch after the mutation, which is what
    /// later edits on the same branch should be rooted at.
    pub fn change_at<F>(&self, heads: &Heads, mutator: F) -> Result<Heads>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<(), AutomergeError>,
    {
        let (branch_heads, event) = {
            let mut state = self.state.lock();
            let doc = self.live_doc(&mut state)?;

            let before = Heads::of(doc);
            let mut branch = doc.fork_at(heads.as_slice())?;
            branch.transact(mutator).map_err(|failure| failure.error)?;
            let branch_heads = Heads::of(&branch);
            doc.merge(&mut branch)?;

            (branch_heads, self.change_event(doc, &before, ChangeOrigin::Local))
        };

        self.publish_local(event);
        Ok(branch_heads)
    }

    /// Replace the document with `transform(current)`
    pub fn update<F>(&self, transform: F) -> Result<()>
    where
        F: FnOnce(&Automerge) -> Result<Automerge>,
    {
        let event = {
            let mut state = self.state.lock();
            let HandleState {
                doc,
                last_synced_heads,
            } = &mut *state;
            let current = doc
                .as_mut()
                .ok_or_else(|| Error::DeletedDocument(self.id.clone()))?;

            let mut before = Heads::of(current);
            let replacement = transform(current)?;
            *current = replacement;

            // A wholesale replacement may not descend from what was synced.
            last_synced_heads.retain_known(current);
            before.retain_known(current);
            self.change_event(current, &before, ChangeOrigin::Local)
        };

        self.publish_local(event);
        Ok(())
    }

    /// Tombstone the handle.
    pub fn delete(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.doc.take().is_none() {
                return Err(Error::DeletedDocument(self.id.clone()));
            }
        }
        self.status.send_replace(DocumentStatus::Deleted);
        debug!(document = %self.id, "Document deleted");

        let _ = self.events.send(HandleEvent::Deleted(self.id.clone()));
        if let Some(observer) = self.observer() {
            observer.on_delete(&self.id);
        }
        Ok(())
    }

    /// Bytes of every change since the last extraction, or `None` if there
    /// is nothing new.
    pub fn extract_pending_mutation(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let HandleState {
            doc,
            last_synced_heads,
        } = &mut *state;
        let doc = doc
            .as_ref()
            .ok_or_else(|| Error::DeletedDocument(self.id.clone()))?;

        let current = Heads::of(doc);
        if current == *last_synced_heads {
            return Ok(None);
        }

        let bytes = doc.save_after(last_synced_heads.as_slice());
        trace!(
            document = %self.id,
            from = %last_synced_heads,
            to = %current,
            size = bytes.len(),
            "Extracted pending mutation"
        );
        *last_synced_heads = current;
        Ok(Some(bytes))
    }

    /// Merge bytes produced elsewhere into the document.
    ///
    /// The handle becomes ready once a merge leaves no change waiting on a
    /// missing dependency.
    pub fn apply_remote_mutation(&self, bytes: &[u8]) -> Result<()> {
        let (event, complete) = {
            let mut state = self.state.lock();
            let HandleState {
                doc,
                last_synced_heads,
            } = &mut *state;
            let doc = doc
                .as_mut()
                .ok_or_else(|| Error::DeletedDocument(self.id.clone()))?;

            let before = Heads::of(doc);
            doc.load_incremental(bytes)?;
            let after = Heads::of(doc);

            // With no unsent local edits the remote change needs no echo.
            if before == *last_synced_heads {
                *last_synced_heads = after;
            }

            // Changes queued on missing dependencies are not applied yet.
            let complete = doc.get_missing_deps(&[]).is_empty();
            (self.change_event(doc, &before, ChangeOrigin::Remote), complete)
        };

        let became_ready = complete
            && self.status.send_if_modified(|status| {
                if *status == DocumentStatus::Pending {
                    *status = DocumentStatus::Ready;
                    true
                } else {
                    false
                }
            });
        if became_ready {
            debug!(document = %self.id, "Document ready");
        }

        if let Some(event) = event {
            let _ = self.events.send(HandleEvent::Change(event));
        }
        Ok(())
    }

    fn live_doc<'a>(&self, state: &'a mut HandleState) -> Result<&'a mut Automerge> {
        state
            .doc
            .as_mut()
            .ok_or_else(|| Error::DeletedDocument(self.id.clone()))
    }

    fn change_event(&self, doc: &Automerge, before: &Heads, origin: ChangeOrigin) -> Option<ChangeEvent> {
        let after = Heads::of(doc);
        if after == *before {
            return None;
        }

        Some(ChangeEvent {
            document_id: self.id.clone(),
            origin,
            patches: doc.diff(before.as_slice(), after.as_slice(), TextRepresentation::String),
            heads: after,
        })
    }

    fn publish_local(&self, event: Option<ChangeEvent>) {
        let Some(event) = event else {
            return;
        };

        let _ = self.events.send(HandleEvent::Change(event));
        if let Some(observer) = self.observer() {
            observer.on_local_change(&self.id);
        }
    }

    fn observer(&self) -> Option<std::sync::Arc<dyn HandleObserver>> {
        self.observer.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}
