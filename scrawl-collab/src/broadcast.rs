//! Same-device transport over an in-process pub/sub bus.
//!
//! Replicas that share one [`BroadcastBus`] (multiple views/tabs of the
//! same app instance) sync through a room-scoped tokio broadcast channel.
//! No network, no handshake, no reconnection: frames are tagged with the
//! sender's client id, self-tagged frames are skipped on receipt, and
//! everything else is applied directly.
//!
//! A newly joined replica publishes nothing on join; it catches up on the
//! next delta from any peer (or by making its own first edit). Lazy
//! resync is a recorded design choice — the CRDT merge makes the eventual
//! full state subsume anything missed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::awareness::AwarenessRegistry;
use crate::doc::ReplicatedDocument;
use crate::protocol::{ClientId, ConnectionStatus, Origin, TransportId};
use crate::transport::{ShutdownSignal, StatusCell, Transport, TransportStats, TransportStatsSnapshot};

/// Channel name prefix; the full channel key is `scrawl-room:<room id>`.
const CHANNEL_PREFIX: &str = "scrawl-room:";

const DEFAULT_CAPACITY: usize = 256;

/// One frame on the bus.
#[derive(Debug, Clone)]
pub struct BusFrame {
    pub room_id: String,
    /// Client id of the publishing replica, for self-echo suppression.
    pub origin: ClientId,
    pub payload: BusPayload,
}

#[derive(Debug, Clone)]
pub enum BusPayload {
    Delta(Vec<u8>),
    Awareness(Vec<u8>),
}

/// Registry of room-scoped broadcast channels, shared by every replica on
/// the device.
pub struct BroadcastBus {
    channels: Mutex<HashMap<String, broadcast::Sender<BusFrame>>>,
    capacity: usize,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how many frames a lagging subscriber may buffer
    /// before it starts dropping.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Get or create the channel for a room.
    pub fn channel(&self, room_id: &str) -> broadcast::Sender<BusFrame> {
        let key = format!("{CHANNEL_PREFIX}{room_id}");
        let mut channels = self.channels.lock();
        channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn room_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriptions {
    _doc: crate::doc::DeltaSubscription,
    _awareness: crate::awareness::AwarenessSubscription,
}

/// The same-device transport.
pub struct BroadcastTransport {
    id: TransportId,
    room_id: String,
    status: Arc<StatusCell>,
    stats: Arc<TransportStats>,
    shutdown: Arc<ShutdownSignal>,
    subscriptions: Mutex<Option<Subscriptions>>,
}

impl BroadcastTransport {
    /// Attach to the bus and start syncing. Must be called within a tokio
    /// runtime (spawns the inbound reader task).
    pub fn start(
        bus: &BroadcastBus,
        room_id: impl Into<String>,
        doc: Arc<ReplicatedDocument>,
        awareness: Arc<AwarenessRegistry>,
    ) -> Arc<Self> {
        let room_id = room_id.into();
        let id = TransportId::new();
        let local_id = doc.client_id();
        let status = Arc::new(StatusCell::new(ConnectionStatus::Connecting));
        let stats = Arc::new(TransportStats::default());
        let shutdown = Arc::new(ShutdownSignal::new());

        let sender = bus.channel(&room_id);
        let inbound = sender.subscribe();

        // Outbound: republish local deltas, skipping our own echoes.
        let doc_sub = {
            let sender = sender.clone();
            let room_id = room_id.clone();
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            doc.subscribe(move |event| {
                if event.origin.is_from(id) || shutdown.is_shutdown() {
                    return;
                }
                let frame = BusFrame {
                    room_id: room_id.clone(),
                    origin: local_id,
                    payload: BusPayload::Delta(event.update.clone()),
                };
                match sender.send(frame) {
                    Ok(_) => stats.record_sent(),
                    Err(_) => stats.record_dropped(),
                }
            })
        };

        let awareness_sub = {
            let sender = sender.clone();
            let room_id = room_id.clone();
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            let awareness = awareness.clone();
            awareness.clone().subscribe(move |diff| {
                if diff.origin.is_from(id) || shutdown.is_shutdown() {
                    return;
                }
                let payload = match awareness.encode_diff(&diff.changed()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("failed to encode awareness diff: {e}");
                        return;
                    }
                };
                let frame = BusFrame {
                    room_id: room_id.clone(),
                    origin: local_id,
                    payload: BusPayload::Awareness(payload),
                };
                match sender.send(frame) {
                    Ok(_) => stats.record_sent(),
                    Err(_) => stats.record_dropped(),
                }
            })
        };

        let transport = Arc::new(Self {
            id,
            room_id: room_id.clone(),
            status: status.clone(),
            stats: stats.clone(),
            shutdown: shutdown.clone(),
            subscriptions: Mutex::new(Some(Subscriptions {
                _doc: doc_sub,
                _awareness: awareness_sub,
            })),
        });

        tokio::spawn(Self::read_loop(
            inbound,
            room_id,
            id,
            local_id,
            doc,
            awareness,
            stats,
            shutdown.subscribe(),
        ));

        // No handshake on a local channel.
        status.set(ConnectionStatus::Connected);
        transport
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_loop(
        mut inbound: broadcast::Receiver<BusFrame>,
        room_id: String,
        id: TransportId,
        local_id: ClientId,
        doc: Arc<ReplicatedDocument>,
        awareness: Arc<AwarenessRegistry>,
        stats: Arc<TransportStats>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                frame = inbound.recv() => match frame {
                    Ok(frame) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if frame.room_id != room_id || frame.origin == local_id {
                            continue;
                        }
                        match frame.payload {
                            BusPayload::Delta(bytes) => {
                                match doc.apply_delta(&bytes, Origin::Remote(id)) {
                                    Ok(()) => stats.record_applied(),
                                    Err(e) => log::warn!("dropping bus delta: {e}"),
                                }
                            }
                            BusPayload::Awareness(bytes) => {
                                match awareness.apply_diff(&bytes, Origin::Remote(id)) {
                                    Ok(_) => stats.record_applied(),
                                    Err(e) => log::warn!("dropping bus awareness diff: {e}"),
                                }
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("broadcast transport lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        log::debug!("broadcast reader for room {room_id} stopped");
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Transport for BroadcastTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn shutdown(&self) {
        if self.shutdown.trigger() {
            self.subscriptions.lock().take();
            self.status.set(ConnectionStatus::Disconnected);
            log::info!("broadcast transport for room {} shut down", self.room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::PresenceState;
    use tokio::time::{sleep, Duration};

    fn replica() -> (Arc<ReplicatedDocument>, Arc<AwarenessRegistry>) {
        let doc = Arc::new(ReplicatedDocument::new());
        let awareness = Arc::new(AwarenessRegistry::new(doc.client_id()));
        (doc, awareness)
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_delta_reaches_peer() {
        let bus = BroadcastBus::new();
        let (doc_a, aw_a) = replica();
        let (doc_b, aw_b) = replica();

        let _ta = BroadcastTransport::start(&bus, "room", doc_a.clone(), aw_a);
        let _tb = BroadcastTransport::start(&bus, "room", doc_b.clone(), aw_b);

        doc_a.insert(0, "hello");
        settle().await;

        assert_eq!(doc_b.text(), "hello");
    }

    #[tokio::test]
    async fn test_self_frames_not_reapplied() {
        let bus = BroadcastBus::new();
        let (doc, awareness) = replica();
        let transport = BroadcastTransport::start(&bus, "room", doc.clone(), awareness);

        doc.insert(0, "solo");
        settle().await;

        let stats = transport.stats();
        assert_eq!(stats.frames_sent, 1);
        // Our own frame loops back but must not be applied.
        assert_eq!(stats.frames_applied, 0);
        assert_eq!(doc.text(), "solo");
    }

    #[tokio::test]
    async fn test_remote_apply_not_rebroadcast() {
        let bus = BroadcastBus::new();
        let (doc_a, aw_a) = replica();
        let (doc_b, aw_b) = replica();

        let ta = BroadcastTransport::start(&bus, "room", doc_a.clone(), aw_a);
        let tb = BroadcastTransport::start(&bus, "room", doc_b.clone(), aw_b);

        doc_a.insert(0, "x");
        settle().await;

        // B applied A's frame but must not have broadcast anything itself.
        assert_eq!(tb.stats().frames_applied, 1);
        assert_eq!(tb.stats().frames_sent, 0);
        assert_eq!(ta.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let bus = BroadcastBus::new();
        let (doc_a, aw_a) = replica();
        let (doc_b, aw_b) = replica();

        let _ta = BroadcastTransport::start(&bus, "room-1", doc_a.clone(), aw_a);
        let _tb = BroadcastTransport::start(&bus, "room-2", doc_b.clone(), aw_b);

        doc_a.insert(0, "private");
        settle().await;

        assert_eq!(doc_b.text(), "");
        assert_eq!(bus.room_count(), 2);
    }

    #[tokio::test]
    async fn test_awareness_reaches_peer() {
        let bus = BroadcastBus::new();
        let (doc_a, aw_a) = replica();
        let (doc_b, aw_b) = replica();

        let _ta = BroadcastTransport::start(&bus, "room", doc_a.clone(), aw_a.clone());
        let _tb = BroadcastTransport::start(&bus, "room", doc_b.clone(), aw_b.clone());

        aw_a.set_local_presence(PresenceState::new("Alice"));
        settle().await;

        let peers = aw_b.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].1.presence.display_name, "Alice");
        // B never sees itself in its peer list.
        assert!(peers.iter().all(|(id, _)| *id != doc_b.client_id()));
    }

    #[tokio::test]
    async fn test_shutdown_stops_application() {
        let bus = BroadcastBus::new();
        let (doc_a, aw_a) = replica();
        let (doc_b, aw_b) = replica();

        let _ta = BroadcastTransport::start(&bus, "room", doc_a.clone(), aw_a);
        let tb = BroadcastTransport::start(&bus, "room", doc_b.clone(), aw_b);

        tb.shutdown();
        assert_eq!(tb.status(), ConnectionStatus::Disconnected);

        doc_a.insert(0, "after");
        settle().await;

        assert_eq!(doc_b.text(), "");
    }

    #[tokio::test]
    async fn test_shutdown_idempotent() {
        let bus = BroadcastBus::new();
        let (doc, awareness) = replica();
        let transport = BroadcastTransport::start(&bus, "room", doc, awareness);

        transport.shutdown();
        transport.shutdown();
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_status_connected_after_start() {
        let bus = BroadcastBus::new();
        let (doc, awareness) = replica();
        let transport = BroadcastTransport::start(&bus, "room", doc, awareness);
        assert_eq!(transport.status(), ConnectionStatus::Connected);
    }
}
