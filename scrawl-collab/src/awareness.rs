//! Ephemeral per-client awareness: presence and cursor/selection state.
//!
//! Each replica owns exactly one entry (its own); peers' entries are
//! read-only observations that arrive as encoded diffs over a transport.
//! Diffs are opaque byte payloads on the wire (bincode), so the transports
//! never look inside them.
//!
//! Selection is cleared explicitly (`selection = None`, never omitted)
//! when the owner blurs, leaves the editable mode, or the cursor no longer
//! falls inside any known block — peers' cursors disappear promptly
//! instead of going stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::protocol::{ClientId, Origin, SyncError};

/// Stable presence color derived from a client id hash, as `#rrggbb`.
pub fn color_for_client(client_id: ClientId) -> String {
    let hash = client_id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let r = (hash >> 16) & 0xFF;
    let g = (hash >> 8) & 0xFF;
    let b = hash & 0xFF;
    format!("#{r:02x}{g:02x}{b:02x}")
}

/// Block-relative selection range (flat offsets within one block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

impl SelectionRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// `(min, max)` regardless of direction.
    pub fn normalized(&self) -> (usize, usize) {
        if self.start <= self.end {
            (self.start, self.end)
        } else {
            (self.end, self.start)
        }
    }

    /// A bare caret rather than a range.
    pub fn is_degenerate(&self) -> bool {
        self.start == self.end
    }
}

/// Published selection: a block id plus a block-relative range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionState {
    pub block_id: String,
    pub range: SelectionRange,
    pub color: Option<String>,
}

/// Who a client is, for cursors and the peer list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub display_name: String,
    pub color: Option<String>,
    pub typing: Option<bool>,
}

impl PresenceState {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            color: None,
            typing: None,
        }
    }
}

/// One client's full awareness entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub presence: PresenceState,
    pub selection: Option<SelectionState>,
}

/// Wire payload of a diff: entries to upsert, `None` marks removal.
#[derive(Debug, Serialize, Deserialize)]
struct DiffPayload {
    entries: Vec<(ClientId, Option<AwarenessEntry>)>,
}

/// Result of applying a diff, delivered to listeners.
#[derive(Debug, Clone)]
pub struct AwarenessDiff {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: Origin,
}

impl AwarenessDiff {
    /// Every client id this diff touched, in added/updated/removed order.
    pub fn changed(&self) -> Vec<ClientId> {
        let mut ids =
            Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend_from_slice(&self.added);
        ids.extend_from_slice(&self.updated);
        ids.extend_from_slice(&self.removed);
        ids
    }
}

type AwarenessCallback = Box<dyn Fn(&AwarenessDiff) + Send + Sync>;
type ListenerMap = Mutex<HashMap<u64, AwarenessCallback>>;

/// Handle for an awareness listener; dropping it detaches the callback.
pub struct AwarenessSubscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl AwarenessSubscription {
    pub fn cancel(self) {}
}

impl Drop for AwarenessSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().remove(&self.id);
        }
    }
}

/// Registry of awareness entries for one room session.
pub struct AwarenessRegistry {
    local_id: ClientId,
    entries: RwLock<HashMap<ClientId, AwarenessEntry>>,
    listeners: Arc<ListenerMap>,
    next_listener: AtomicU64,
}

impl AwarenessRegistry {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            entries: RwLock::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    /// Whether the local client has published any state yet. Transports
    /// use this to decide whether to send the initial awareness message.
    pub fn has_local_state(&self) -> bool {
        self.entries.read().contains_key(&self.local_id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<AwarenessEntry> {
        self.entries.read().get(&client_id).cloned()
    }

    pub fn local_entry(&self) -> Option<AwarenessEntry> {
        self.get(self.local_id)
    }

    /// All entries except the local one.
    pub fn peers(&self) -> Vec<(ClientId, AwarenessEntry)> {
        self.entries
            .read()
            .iter()
            .filter(|(id, _)| **id != self.local_id)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    /// Replace the local presence, keeping any published selection.
    pub fn set_local_presence(&self, presence: PresenceState) {
        let added = {
            let mut entries = self.entries.write();
            match entries.get_mut(&self.local_id) {
                Some(entry) => {
                    entry.presence = presence;
                    false
                }
                None => {
                    entries.insert(
                        self.local_id,
                        AwarenessEntry {
                            presence,
                            selection: None,
                        },
                    );
                    true
                }
            }
        };
        self.emit_local(added);
    }

    /// Publish a selection, merged with (not replacing) the presence
    /// fields. A client with no presence yet gets an anonymous one so the
    /// entry is well-formed.
    pub fn set_local_selection(&self, selection: SelectionState) {
        let added = {
            let mut entries = self.entries.write();
            match entries.get_mut(&self.local_id) {
                Some(entry) => {
                    entry.selection = Some(selection);
                    false
                }
                None => {
                    entries.insert(
                        self.local_id,
                        AwarenessEntry {
                            presence: PresenceState::new("Anonymous"),
                            selection: Some(selection),
                        },
                    );
                    true
                }
            }
        };
        self.emit_local(added);
    }

    /// Explicitly null out the published selection.
    pub fn clear_local_selection(&self) {
        let changed = {
            let mut entries = self.entries.write();
            match entries.get_mut(&self.local_id) {
                Some(entry) if entry.selection.is_some() => {
                    entry.selection = None;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit_local(false);
        }
    }

    /// Flip the typing indicator on the local presence.
    pub fn set_local_typing(&self, typing: bool) {
        let changed = {
            let mut entries = self.entries.write();
            match entries.get_mut(&self.local_id) {
                Some(entry) => {
                    entry.presence.typing = Some(typing);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.emit_local(false);
        }
    }

    /// Remove the local entry (session teardown).
    pub fn remove_local(&self) {
        let removed = self.entries.write().remove(&self.local_id).is_some();
        if removed {
            self.emit(AwarenessDiff {
                added: Vec::new(),
                updated: Vec::new(),
                removed: vec![self.local_id],
                origin: Origin::Local,
            });
        }
    }

    /// Encode the current state of the given clients as a diff payload.
    /// Ids with no entry encode as removals.
    pub fn encode_diff(&self, client_ids: &[ClientId]) -> Result<Vec<u8>, SyncError> {
        let entries = self.entries.read();
        let payload = DiffPayload {
            entries: client_ids
                .iter()
                .map(|id| (*id, entries.get(id).cloned()))
                .collect(),
        };
        bincode::serde::encode_to_vec(&payload, bincode::config::standard())
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Encode every known entry (initial sync after connect).
    pub fn encode_all(&self) -> Result<Vec<u8>, SyncError> {
        let ids: Vec<ClientId> = self.entries.read().keys().copied().collect();
        self.encode_diff(&ids)
    }

    /// Apply an encoded diff from a peer. Entries for the local client id
    /// are skipped — each client owns only its own entry.
    pub fn apply_diff(&self, bytes: &[u8], origin: Origin) -> Result<AwarenessDiff, SyncError> {
        let (payload, _): (DiffPayload, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| SyncError::Deserialization(e.to_string()))?;

        let mut diff = AwarenessDiff {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        };

        {
            let mut entries = self.entries.write();
            for (client_id, entry) in payload.entries {
                if client_id == self.local_id {
                    continue;
                }
                match entry {
                    Some(entry) => {
                        if entries.insert(client_id, entry).is_some() {
                            diff.updated.push(client_id);
                        } else {
                            diff.added.push(client_id);
                        }
                    }
                    None => {
                        if entries.remove(&client_id).is_some() {
                            diff.removed.push(client_id);
                        }
                    }
                }
            }
        }

        if !diff.added.is_empty() || !diff.updated.is_empty() || !diff.removed.is_empty() {
            self.emit(diff.clone());
        }
        Ok(diff)
    }

    /// Register a diff listener; the returned handle detaches it when
    /// dropped.
    pub fn subscribe(
        &self,
        callback: impl Fn(&AwarenessDiff) + Send + Sync + 'static,
    ) -> AwarenessSubscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Box::new(callback));
        AwarenessSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn emit_local(&self, added: bool) {
        let (added, updated) = if added {
            (vec![self.local_id], Vec::new())
        } else {
            (Vec::new(), vec![self.local_id])
        };
        self.emit(AwarenessDiff {
            added,
            updated,
            removed: Vec::new(),
            origin: Origin::Local,
        });
    }

    fn emit(&self, diff: AwarenessDiff) {
        let listeners = self.listeners.lock();
        for callback in listeners.values() {
            callback(&diff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(local_id: ClientId) -> AwarenessRegistry {
        AwarenessRegistry::new(local_id)
    }

    fn selection(block: &str, start: usize, end: usize) -> SelectionState {
        SelectionState {
            block_id: block.into(),
            range: SelectionRange::new(start, end),
            color: None,
        }
    }

    #[test]
    fn test_local_presence_roundtrip() {
        let reg = registry(1);
        assert!(!reg.has_local_state());

        reg.set_local_presence(PresenceState::new("Alice"));
        assert!(reg.has_local_state());
        assert_eq!(reg.local_entry().unwrap().presence.display_name, "Alice");
    }

    #[test]
    fn test_selection_merges_with_presence() {
        let reg = registry(1);
        reg.set_local_presence(PresenceState::new("Alice"));
        reg.set_local_selection(selection("b1", 2, 5));

        let entry = reg.local_entry().unwrap();
        assert_eq!(entry.presence.display_name, "Alice");
        assert_eq!(entry.selection.unwrap().block_id, "b1");
    }

    #[test]
    fn test_clear_selection_keeps_presence() {
        let reg = registry(1);
        reg.set_local_presence(PresenceState::new("Alice"));
        reg.set_local_selection(selection("b1", 2, 5));
        reg.clear_local_selection();

        let entry = reg.local_entry().unwrap();
        assert_eq!(entry.presence.display_name, "Alice");
        assert!(entry.selection.is_none());
    }

    #[test]
    fn test_diff_transfers_entries() {
        let a = registry(1);
        a.set_local_presence(PresenceState::new("Alice"));
        a.set_local_selection(selection("b1", 0, 3));

        let b = registry(2);
        let diff = b.apply_diff(&a.encode_all().unwrap(), Origin::Local).unwrap();

        assert_eq!(diff.added, vec![1]);
        let entry = b.get(1).unwrap();
        assert_eq!(entry.presence.display_name, "Alice");
        assert_eq!(entry.selection.unwrap().range, SelectionRange::new(0, 3));
    }

    #[test]
    fn test_diff_removal() {
        let a = registry(1);
        a.set_local_presence(PresenceState::new("Alice"));

        let b = registry(2);
        b.apply_diff(&a.encode_all().unwrap(), Origin::Local).unwrap();
        assert!(b.get(1).is_some());

        a.remove_local();
        let removal = a.encode_diff(&[1]).unwrap();
        let diff = b.apply_diff(&removal, Origin::Local).unwrap();
        assert_eq!(diff.removed, vec![1]);
        assert!(b.get(1).is_none());
    }

    #[test]
    fn test_apply_skips_own_entry() {
        let a = registry(1);
        a.set_local_presence(PresenceState::new("Impostor"));
        let payload = a.encode_all().unwrap();

        let b = registry(1); // same client id
        b.set_local_presence(PresenceState::new("Real"));
        b.apply_diff(&payload, Origin::Local).unwrap();

        assert_eq!(b.local_entry().unwrap().presence.display_name, "Real");
    }

    #[test]
    fn test_peers_excludes_local() {
        let a = registry(1);
        a.set_local_presence(PresenceState::new("Alice"));

        let b = registry(2);
        b.set_local_presence(PresenceState::new("Bob"));
        b.apply_diff(&a.encode_all().unwrap(), Origin::Local).unwrap();

        let peers = b.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, 1);
    }

    #[test]
    fn test_subscribe_sees_diff_origin() {
        let reg = registry(2);
        let transport = crate::protocol::TransportId::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = reg.subscribe(move |diff| sink.lock().push(diff.origin));

        let remote = registry(1);
        remote.set_local_presence(PresenceState::new("Alice"));
        reg.apply_diff(&remote.encode_all().unwrap(), Origin::Remote(transport))
            .unwrap();

        assert!(seen.lock()[0].is_from(transport));
    }

    #[test]
    fn test_typing_indicator() {
        let reg = registry(1);
        reg.set_local_presence(PresenceState::new("Alice"));
        reg.set_local_typing(true);
        assert_eq!(reg.local_entry().unwrap().presence.typing, Some(true));
    }

    #[test]
    fn test_apply_garbage_errors() {
        let reg = registry(1);
        assert!(reg.apply_diff(&[0xFF, 0x01], Origin::Local).is_err());
    }

    #[test]
    fn test_color_for_client_stable() {
        assert_eq!(color_for_client(42), color_for_client(42));
        assert_ne!(color_for_client(1), color_for_client(2));
        assert!(color_for_client(7).starts_with('#'));
        assert_eq!(color_for_client(7).len(), 7);
    }

    #[test]
    fn test_changed_order() {
        let diff = AwarenessDiff {
            added: vec![1],
            updated: vec![2],
            removed: vec![3],
            origin: Origin::Local,
        };
        assert_eq!(diff.changed(), vec![1, 2, 3]);
    }
}
