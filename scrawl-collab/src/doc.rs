//! Replicated document backed by a yrs CRDT.
//!
//! The merge algorithm is yrs's concern; this wrapper only adds what the
//! transport layer needs: origin-tagged delta events, full-state encoding,
//! and an explicit subscription contract (`subscribe` returns a handle,
//! dropping the handle detaches the listener — no global registries).
//!
//! All yrs access is serialized behind one mutex so transports and editor
//! input can share the document across tasks without overlapping
//! transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::protocol::{ClientId, Origin, SyncError};

/// Name of the root shared text holding the flat document content.
const CONTENT_ROOT: &str = "content";

/// A document delta with its source.
#[derive(Debug, Clone)]
pub struct DeltaEvent {
    /// v1-encoded yrs update (incremental delta or full state).
    pub update: Vec<u8>,
    pub origin: Origin,
}

type DeltaCallback = Box<dyn Fn(&DeltaEvent) + Send + Sync>;
type ListenerMap = Mutex<HashMap<u64, DeltaCallback>>;

/// Handle for a delta listener. Dropping it (or calling [`cancel`])
/// detaches the callback.
///
/// [`cancel`]: DeltaSubscription::cancel
pub struct DeltaSubscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl DeltaSubscription {
    pub fn cancel(self) {}
}

impl Drop for DeltaSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().remove(&self.id);
        }
    }
}

/// The shared document for one room session.
///
/// Emits a [`DeltaEvent`] on every local mutation and on every applied
/// remote delta, tagged with its [`Origin`] so the delivering transport
/// never re-broadcasts what it just applied.
pub struct ReplicatedDocument {
    doc: Mutex<Doc>,
    client_id: ClientId,
    listeners: Arc<ListenerMap>,
    next_listener: AtomicU64,
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let client_id = doc.client_id();
        Self {
            doc: Mutex::new(doc),
            client_id,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// The replica id used for origin tagging and peer-list exclusion.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Insert text at a flat character offset (local mutation).
    pub fn insert(&self, index: u32, chunk: &str) {
        let update = {
            let doc = self.doc.lock();
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(CONTENT_ROOT);
            text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.emit(update, Origin::Local);
    }

    /// Remove `len` characters starting at a flat offset (local mutation).
    pub fn remove(&self, index: u32, len: u32) {
        let update = {
            let doc = self.doc.lock();
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(CONTENT_ROOT);
            text.remove_range(&mut txn, index, len);
            txn.encode_update_v1()
        };
        self.emit(update, Origin::Local);
    }

    /// Apply an encoded delta from a peer (or a full-state sync — yrs
    /// treats both identically), then notify listeners with the given
    /// origin.
    pub fn apply_delta(&self, bytes: &[u8], origin: Origin) -> Result<(), SyncError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| SyncError::Deserialization(e.to_string()))?;
        {
            let doc = self.doc.lock();
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| SyncError::Document(e.to_string()))?;
        }
        self.emit(bytes.to_vec(), origin);
        Ok(())
    }

    /// Encode the full current state as one v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        let doc = self.doc.lock();
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Current flat text content.
    pub fn text(&self) -> String {
        let doc = self.doc.lock();
        let txn = doc.transact();
        txn.get_text(CONTENT_ROOT)
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    /// Register a delta listener; the returned handle detaches it when
    /// dropped.
    pub fn subscribe(
        &self,
        callback: impl Fn(&DeltaEvent) + Send + Sync + 'static,
    ) -> DeltaSubscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Box::new(callback));
        DeltaSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn emit(&self, update: Vec<u8>, origin: Origin) {
        if update.is_empty() {
            return;
        }
        let event = DeltaEvent { update, origin };
        let listeners = self.listeners.lock();
        for callback in listeners.values() {
            callback(&event);
        }
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}
