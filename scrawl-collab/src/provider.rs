//! The collaboration provider: one object per room session.
//!
//! A provider owns the replicated document, the awareness registry, and
//! exactly one transport, chosen by [`TransportConfig`] at construction.
//! Everything above this layer (editor bindings, UI) talks to the
//! provider and never to a transport directly.
//!
//! `destroy` is idempotent and also runs on drop: it removes the local
//! awareness entry (so peers drop this cursor promptly) and then shuts
//! the transport down. After destroy, local edits still mutate the local
//! document but nothing leaves the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::awareness::{color_for_client, AwarenessEntry, AwarenessRegistry, PresenceState};
use crate::broadcast::{BroadcastBus, BroadcastTransport};
use crate::conflict::{Conflict, ConflictDetector};
use crate::direct::{DirectWebSocketTransport, DirectWsConfig};
use crate::doc::ReplicatedDocument;
use crate::protocol::{ClientId, ConnectionStatus};
use crate::rpc::{RpcWebSocketTransport, RpcWsConfig};
use crate::selection::{Block, SelectionTracker};
use crate::transport::Transport;

/// Which transport a provider session runs over. Room id is deliberately
/// not part of the config so one config can serve many rooms.
#[derive(Clone)]
pub enum TransportConfig {
    /// Same-device sync over a shared in-process bus.
    Broadcast { bus: Arc<BroadcastBus> },
    /// Plain JSON frames against a dedicated sync server.
    DirectWebSocket(DirectWsConfig),
    /// JSON-RPC envelopes against an embedding RPC endpoint.
    RpcWebSocket(RpcWsConfig),
}

/// One collaborative session on one room.
pub struct CollaborationProvider {
    room_id: String,
    doc: Arc<ReplicatedDocument>,
    awareness: Arc<AwarenessRegistry>,
    transport: Arc<dyn Transport>,
    selection: SelectionTracker,
    conflicts: ConflictDetector,
    destroyed: AtomicBool,
}

impl CollaborationProvider {
    /// Start a session with a fresh document. Must be called within a
    /// tokio runtime (transports spawn tasks).
    pub fn start(config: TransportConfig, room_id: impl Into<String>) -> Self {
        Self::start_with_document(config, room_id, Arc::new(ReplicatedDocument::new()))
    }

    /// Start a session reusing an existing document (e.g. re-joining a
    /// room after the transport config changed). Awareness starts fresh.
    pub fn start_with_document(
        config: TransportConfig,
        room_id: impl Into<String>,
        doc: Arc<ReplicatedDocument>,
    ) -> Self {
        let awareness = Arc::new(AwarenessRegistry::new(doc.client_id()));
        Self::start_with_state(config, room_id, doc, awareness)
    }

    /// Start a session reusing an existing document and awareness
    /// registry. The registry must be keyed by the document's client id.
    /// The registry outlives the session: `destroy` removes the local
    /// entry (so peers see the departure) but the caller's `Arc` stays
    /// valid for the next session.
    pub fn start_with_state(
        config: TransportConfig,
        room_id: impl Into<String>,
        doc: Arc<ReplicatedDocument>,
        awareness: Arc<AwarenessRegistry>,
    ) -> Self {
        let room_id = room_id.into();

        let transport: Arc<dyn Transport> = match config {
            TransportConfig::Broadcast { bus } => {
                BroadcastTransport::start(&bus, room_id.clone(), doc.clone(), awareness.clone())
            }
            TransportConfig::DirectWebSocket(config) => DirectWebSocketTransport::start(
                config,
                room_id.clone(),
                doc.clone(),
                awareness.clone(),
            ),
            TransportConfig::RpcWebSocket(config) => RpcWebSocketTransport::start(
                config,
                room_id.clone(),
                doc.clone(),
                awareness.clone(),
            ),
        };

        log::info!(
            "collaboration session started for room {room_id} (client {})",
            doc.client_id()
        );

        Self {
            room_id,
            doc: doc.clone(),
            awareness: awareness.clone(),
            transport,
            selection: SelectionTracker::new(awareness.clone()),
            conflicts: ConflictDetector::new(awareness),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    pub fn document(&self) -> &Arc<ReplicatedDocument> {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<AwarenessRegistry> {
        &self.awareness
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    /// Watch channel for status changes, for UI indicators.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.subscribe_status()
    }

    /// Publish the local presence, with a stable per-client color.
    pub fn set_presence(&self, display_name: impl Into<String>) {
        let mut presence = PresenceState::new(display_name);
        presence.color = Some(color_for_client(self.client_id()));
        self.awareness.set_local_presence(presence);
    }

    pub fn set_typing(&self, typing: bool) {
        self.awareness.set_local_typing(typing);
    }

    /// Publish the local selection mapped onto the given block layout.
    pub fn update_selection(&self, blocks: &[Block], start: usize, end: usize) {
        self.selection.update(blocks, start, end);
    }

    pub fn clear_selection(&self) {
        self.selection.clear();
    }

    /// Peers whose published selection overlaps the local one.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.conflicts()
    }

    /// Everyone else in the room.
    pub fn peers(&self) -> Vec<(ClientId, AwarenessEntry)> {
        self.awareness.peers()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear the session down. Safe to call more than once; only the
    /// first call does anything.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Announce the departure while the transport is still up.
        self.awareness.remove_local();
        self.transport.shutdown();
        log::info!("collaboration session for room {} destroyed", self.room_id);
    }
}

impl Drop for CollaborationProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    fn broadcast_config(bus: &Arc<BroadcastBus>) -> TransportConfig {
        TransportConfig::Broadcast { bus: bus.clone() }
    }

    #[tokio::test]
    async fn test_two_providers_converge() {
        let bus = Arc::new(BroadcastBus::new());
        let a = CollaborationProvider::start(broadcast_config(&bus), "room");
        let b = CollaborationProvider::start(broadcast_config(&bus), "room");

        a.document().insert(0, "hello");
        sleep(Duration::from_millis(50)).await;

        assert_eq!(b.document().text(), "hello");
        assert_eq!(a.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_destroy_idempotent() {
        let bus = Arc::new(BroadcastBus::new());
        let provider = CollaborationProvider::start(broadcast_config(&bus), "room");

        provider.destroy();
        provider.destroy();
        assert!(provider.is_destroyed());
        assert_eq!(provider.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_destroy_removes_presence_from_peers() {
        let bus = Arc::new(BroadcastBus::new());
        let a = CollaborationProvider::start(broadcast_config(&bus), "room");
        let b = CollaborationProvider::start(broadcast_config(&bus), "room");

        a.set_presence("Alice");
        sleep(Duration::from_millis(50)).await;
        assert_eq!(b.peers().len(), 1);

        a.destroy();
        sleep(Duration::from_millis(50)).await;
        assert!(b.peers().is_empty());
    }

    #[tokio::test]
    async fn test_edits_after_destroy_stay_local() {
        let bus = Arc::new(BroadcastBus::new());
        let a = CollaborationProvider::start(broadcast_config(&bus), "room");
        let b = CollaborationProvider::start(broadcast_config(&bus), "room");

        a.destroy();
        a.document().insert(0, "local only");
        sleep(Duration::from_millis(50)).await;

        assert_eq!(a.document().text(), "local only");
        assert_eq!(b.document().text(), "");
    }

    #[tokio::test]
    async fn test_presence_carries_stable_color() {
        let bus = Arc::new(BroadcastBus::new());
        let provider = CollaborationProvider::start(broadcast_config(&bus), "room");

        provider.set_presence("Alice");
        let entry = provider.awareness().local_entry().unwrap();
        assert_eq!(
            entry.presence.color,
            Some(color_for_client(provider.client_id()))
        );
    }

    #[tokio::test]
    async fn test_start_with_existing_awareness() {
        let bus = Arc::new(BroadcastBus::new());
        let doc = Arc::new(ReplicatedDocument::new());
        let awareness = Arc::new(AwarenessRegistry::new(doc.client_id()));
        awareness.set_local_presence(PresenceState::new("Alice"));

        let a = CollaborationProvider::start_with_state(
            broadcast_config(&bus),
            "room",
            doc,
            awareness.clone(),
        );
        let b = CollaborationProvider::start(broadcast_config(&bus), "room");

        // The pre-seeded presence flows to peers once the session is up.
        a.set_typing(true);
        sleep(Duration::from_millis(50)).await;
        let peers = b.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].1.presence.display_name, "Alice");

        // Destroying the session clears the local entry but the caller's
        // registry stays usable for the next session.
        a.destroy();
        assert!(awareness.local_entry().is_none());
        awareness.set_local_presence(PresenceState::new("Alice again"));
        assert!(awareness.local_entry().is_some());
    }

    #[tokio::test]
    async fn test_selection_and_conflicts_via_provider() {
        let bus = Arc::new(BroadcastBus::new());
        let a = CollaborationProvider::start(broadcast_config(&bus), "room");
        let b = CollaborationProvider::start(broadcast_config(&bus), "room");

        let blocks = vec![Block::new("b1", 0, 40)];
        a.update_selection(&blocks, 2, 5);
        b.update_selection(&blocks, 4, 8);
        sleep(Duration::from_millis(50)).await;

        let conflicts = a.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].client_id, b.client_id());
    }
}
