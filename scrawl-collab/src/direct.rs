//! Direct WebSocket transport: plain JSON frames against a sync server.
//!
//! One supervisor task owns the whole connection lifecycle — connect,
//! handshake, pump, reconnect — so there is never more than one socket or
//! one pending retry timer per transport. On every successful open the
//! transport first sends a full-state `sync` frame, then (if the local
//! client has published anything) its full awareness state, in that order.
//!
//! Outbound frames are best-effort: while not connected they are counted
//! as dropped, never queued. The full-state sync on reconnect subsumes
//! whatever was missed.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::awareness::AwarenessRegistry;
use crate::backoff::{BackoffConfig, ReconnectBackoff};
use crate::doc::ReplicatedDocument;
use crate::protocol::{ConnectionStatus, DirectMessage, Origin, TransportId};
use crate::transport::{ShutdownSignal, StatusCell, Transport, TransportStats, TransportStatsSnapshot};

/// Produces a fresh auth token for each connection attempt, so a rotated
/// token is picked up on the next retry without restarting the transport.
pub type TokenProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Direct transport endpoint configuration. The room id is not part of
/// the config; it is supplied per session.
#[derive(Clone)]
pub struct DirectWsConfig {
    /// Base endpoint, e.g. `ws://host:port/sync`. The room id is appended
    /// as a path segment.
    pub url: String,
    pub token: Option<TokenProvider>,
    pub backoff: BackoffConfig,
}

impl DirectWsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            backoff: BackoffConfig::default(),
        }
    }

    /// The URL for one connection attempt, token freshly computed.
    fn connect_url(&self, room_id: &str) -> String {
        let base = self.url.trim_end_matches('/');
        match &self.token {
            Some(provider) => format!("{base}/{room_id}?token={}", provider()),
            None => format!("{base}/{room_id}"),
        }
    }
}

struct Subscriptions {
    _doc: crate::doc::DeltaSubscription,
    _awareness: crate::awareness::AwarenessSubscription,
}

enum CloseReason {
    Shutdown,
    Closed,
    Failed,
}

/// The direct WebSocket transport.
pub struct DirectWebSocketTransport {
    id: TransportId,
    room_id: String,
    status: Arc<StatusCell>,
    stats: Arc<TransportStats>,
    shutdown: Arc<ShutdownSignal>,
    subscriptions: Mutex<Option<Subscriptions>>,
}

impl DirectWebSocketTransport {
    /// Start the transport and its supervisor task. Must be called within
    /// a tokio runtime.
    pub fn start(
        config: DirectWsConfig,
        room_id: impl Into<String>,
        doc: Arc<ReplicatedDocument>,
        awareness: Arc<AwarenessRegistry>,
    ) -> Arc<Self> {
        let room_id = room_id.into();
        let id = TransportId::new();
        let status = Arc::new(StatusCell::new(ConnectionStatus::Connecting));
        let stats = Arc::new(TransportStats::default());
        let shutdown = Arc::new(ShutdownSignal::new());

        let (out_tx, out_rx) = mpsc::unbounded_channel::<DirectMessage>();

        // Outbound: forward local deltas while connected, drop otherwise.
        let doc_sub = {
            let out_tx = out_tx.clone();
            let room_id = room_id.clone();
            let status = status.clone();
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            doc.subscribe(move |event| {
                if event.origin.is_from(id) || shutdown.is_shutdown() {
                    return;
                }
                if status.get() != ConnectionStatus::Connected {
                    stats.record_dropped();
                    return;
                }
                let msg = DirectMessage::Update {
                    room_id: room_id.clone(),
                    update: event.update.clone(),
                };
                if out_tx.send(msg).is_ok() {
                    stats.record_sent();
                }
            })
        };

        let awareness_sub = {
            let out_tx = out_tx.clone();
            let room_id = room_id.clone();
            let status = status.clone();
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            let awareness = awareness.clone();
            awareness.clone().subscribe(move |diff| {
                if diff.origin.is_from(id) || shutdown.is_shutdown() {
                    return;
                }
                if status.get() != ConnectionStatus::Connected {
                    stats.record_dropped();
                    return;
                }
                let payload = match awareness.encode_diff(&diff.changed()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("failed to encode awareness diff: {e}");
                        return;
                    }
                };
                let msg = DirectMessage::Awareness {
                    room_id: room_id.clone(),
                    payload,
                };
                if out_tx.send(msg).is_ok() {
                    stats.record_sent();
                }
            })
        };

        tokio::spawn(supervise(
            config,
            room_id.clone(),
            id,
            doc,
            awareness,
            status.clone(),
            stats.clone(),
            out_rx,
            shutdown.subscribe(),
        ));

        Arc::new(Self {
            id,
            room_id,
            status,
            stats,
            shutdown,
            subscriptions: Mutex::new(Some(Subscriptions {
                _doc: doc_sub,
                _awareness: awareness_sub,
            })),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Transport for DirectWebSocketTransport {
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
            log::info!("direct transport for room {} shut down", self.room_id);
        }
    }
}

/// The connection lifecycle loop. Exits only on shutdown.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    config: DirectWsConfig,
    room_id: String,
    id: TransportId,
    doc: Arc<ReplicatedDocument>,
    awareness: Arc<AwarenessRegistry>,
    status: Arc<StatusCell>,
    stats: Arc<TransportStats>,
    mut out_rx: mpsc::UnboundedReceiver<DirectMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = ReconnectBackoff::new(config.backoff.clone());

    'reconnect: loop {
        if *shutdown_rx.borrow() {
            break;
        }
        backoff.connecting();
        status.set(ConnectionStatus::Connecting);

        let url = config.connect_url(&room_id);
        let stream = tokio::select! {
            _ = shutdown_rx.changed() => break 'reconnect,
            result = tokio_tungstenite::connect_async(&url) => match result {
                Ok((stream, _)) => stream,
                Err(e) => {
                    log::warn!("direct connect to room {room_id} failed: {e}");
                    status.set(ConnectionStatus::Error);
                    if !wait_retry(&mut backoff, &mut shutdown_rx).await {
                        break 'reconnect;
                    }
                    continue 'reconnect;
                }
            },
        };

        let (mut sink, mut reader) = stream.split();

        // Connected from the moment the socket opens. A delta emitted
        // while the handshake is still in flight then queues into
        // `out_rx` and goes out right after the sync frame, instead of
        // being dropped between `encode_state` and the status flip.
        backoff.connected();
        status.set(ConnectionStatus::Connected);
        log::info!("direct transport connected to room {room_id}");

        // Handshake: full document state first, then awareness.
        let sync = DirectMessage::Sync {
            room_id: room_id.clone(),
            update: doc.encode_state(),
        };
        if send_frame(&mut sink, &sync).await.is_err() {
            status.set(ConnectionStatus::Error);
            if !wait_retry(&mut backoff, &mut shutdown_rx).await {
                break 'reconnect;
            }
            continue 'reconnect;
        }
        if awareness.has_local_state() {
            match awareness.encode_all() {
                Ok(payload) => {
                    let msg = DirectMessage::Awareness {
                        room_id: room_id.clone(),
                        payload,
                    };
                    if send_frame(&mut sink, &msg).await.is_err() {
                        status.set(ConnectionStatus::Error);
                        if !wait_retry(&mut backoff, &mut shutdown_rx).await {
                            break 'reconnect;
                        }
                        continue 'reconnect;
                    }
                }
                Err(e) => log::warn!("failed to encode initial awareness: {e}"),
            }
        }

        let reason = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break CloseReason::Shutdown,
                outbound = out_rx.recv() => match outbound {
                    Some(msg) => {
                        if send_frame(&mut sink, &msg).await.is_err() {
                            break CloseReason::Failed;
                        }
                    }
                    None => break CloseReason::Shutdown,
                },
                inbound = reader.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if *shutdown_rx.borrow() {
                            break CloseReason::Shutdown;
                        }
                        handle_text(text.as_str(), &room_id, id, &doc, &awareness, &stats);
                    }
                    Some(Ok(Message::Close(_))) => break CloseReason::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("direct socket error in room {room_id}: {e}");
                        break CloseReason::Failed;
                    }
                    None => break CloseReason::Closed,
                },
            }
        };

        match reason {
            CloseReason::Shutdown => break 'reconnect,
            CloseReason::Closed => status.set(ConnectionStatus::Disconnected),
            CloseReason::Failed => status.set(ConnectionStatus::Error),
        }
        if !wait_retry(&mut backoff, &mut shutdown_rx).await {
            break 'reconnect;
        }
    }

    backoff.shutdown();
    status.set(ConnectionStatus::Disconnected);
    log::debug!("direct supervisor for room {room_id} stopped");
}

/// Sleep out the backoff delay. Returns `false` when shutdown interrupted
/// the wait.
async fn wait_retry(
    backoff: &mut ReconnectBackoff,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let delay = backoff.next_retry();
    log::debug!("retrying in {delay:?}");
    tokio::select! {
        _ = shutdown_rx.changed() => false,
        _ = tokio::time::sleep(delay) => {
            backoff.retry_elapsed();
            true
        }
    }
}

async fn send_frame<S>(sink: &mut S, msg: &DirectMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match msg.encode() {
        Ok(text) => text,
        Err(e) => {
            log::warn!("failed to encode outbound frame: {e}");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Decode and apply one inbound text frame. Malformed or foreign-room
/// frames are dropped with a log line; they never tear the connection
/// down.
fn handle_text(
    text: &str,
    room_id: &str,
    id: TransportId,
    doc: &ReplicatedDocument,
    awareness: &AwarenessRegistry,
    stats: &TransportStats,
) {
    let msg = match DirectMessage::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("dropping malformed direct frame: {e}");
            return;
        }
    };
    if msg.room_id() != room_id {
        log::debug!("ignoring frame for foreign room {}", msg.room_id());
        return;
    }
    match msg {
        DirectMessage::Sync { update, .. } | DirectMessage::Update { update, .. } => {
            match doc.apply_delta(&update, Origin::Remote(id)) {
                Ok(()) => stats.record_applied(),
                Err(e) => log::warn!("dropping inbound delta: {e}"),
            }
        }
        DirectMessage::Awareness { payload, .. } => {
            match awareness.apply_diff(&payload, Origin::Remote(id)) {
                Ok(_) => stats.record_applied(),
                Err(e) => log::warn!("dropping inbound awareness diff: {e}"),
            }
        }
    }
}
