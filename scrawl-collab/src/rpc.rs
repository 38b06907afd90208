//! JSON-RPC WebSocket transport for embedding sync inside an existing
//! RPC endpoint.
//!
//! Frames are JSON-RPC 2.0 envelopes (`collab/subscribe`, `collab/sync`,
//! `collab/update`, `collab/awareness`) with binary payloads base64-encoded
//! in `params`. At connect time the client requests one sub-protocol,
//! `mcp-binary` or `mcp-json` depending on [`RpcWsConfig::binary`]; when
//! the server accepts `mcp-binary`, document deltas travel as raw binary
//! frames instead of enveloped base64, skipping both encodings. A server
//! that rejects the offer outright (no sub-protocol in its response) gets
//! one immediate retry without the header and plain JSON envelopes from
//! then on. Inbound binary frames are always treated as raw deltas,
//! whatever was negotiated.
//!
//! The handshake — subscribe, then full-state sync, then awareness — is
//! replayed on every (re)connect with fresh sequence numbers. A server
//! that already saw this session may deliver some frames twice; the CRDT
//! merge and last-writer-wins awareness make redelivery harmless.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::awareness::AwarenessRegistry;
use crate::backoff::{BackoffConfig, ReconnectBackoff};
use crate::direct::TokenProvider;
use crate::doc::ReplicatedDocument;
use crate::protocol::{
    ConnectionStatus, Origin, PayloadParams, RpcIncoming, RpcRequest, SubscribeParams, SyncError,
    TransportId, CAPABILITY_AWARENESS_V1, CAPABILITY_DELTA_V1, METHOD_AWARENESS, METHOD_SUBSCRIBE,
    METHOD_SYNC, METHOD_UPDATE, SUBPROTOCOL_BINARY, SUBPROTOCOL_JSON,
};
use crate::transport::{ShutdownSignal, StatusCell, Transport, TransportStats, TransportStatsSnapshot};

/// RPC transport endpoint configuration. As with the direct transport the
/// room id is supplied per session, not in the config.
#[derive(Clone)]
pub struct RpcWsConfig {
    /// Full endpoint URL; `sid` and `token` are appended as query params.
    pub url: String,
    /// Session id carried both in the URL and in `collab/subscribe`, so
    /// the server can correlate a reconnect with the prior session.
    pub session_id: Option<String>,
    pub token: Option<TokenProvider>,
    /// Request the `mcp-binary` sub-protocol instead of `mcp-json`. The
    /// fast path only engages when the server accepts the offer.
    pub binary: bool,
    pub backoff: BackoffConfig,
}

impl RpcWsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session_id: None,
            token: None,
            binary: false,
            backoff: BackoffConfig::default(),
        }
    }

    fn connect_url(&self) -> String {
        let mut url = self.url.clone();
        let mut sep = if url.contains('?') { '&' } else { '?' };
        if let Some(sid) = &self.session_id {
            url.push(sep);
            url.push_str(&format!("sid={sid}"));
            sep = '&';
        }
        if let Some(provider) = &self.token {
            url.push(sep);
            url.push_str(&format!("token={}", provider()));
        }
        url
    }
}

/// Outbound payload, sequenced and framed by the supervisor at write time
/// so the negotiated sub-protocol can pick the encoding.
enum OutFrame {
    Delta(Vec<u8>),
    Awareness(Vec<u8>),
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

/// The JSON-RPC WebSocket transport.
pub struct RpcWebSocketTransport {
    id: TransportId,
    room_id: String,
    status: Arc<StatusCell>,
    stats: Arc<TransportStats>,
    shutdown: Arc<ShutdownSignal>,
    seq: Arc<AtomicU64>,
    subscriptions: Mutex<Option<Subscriptions>>,
}

impl RpcWebSocketTransport {
    /// Start the transport and its supervisor task. Must be called within
    /// a tokio runtime.
    pub fn start(
        config: RpcWsConfig,
        room_id: impl Into<String>,
        doc: Arc<ReplicatedDocument>,
        awareness: Arc<AwarenessRegistry>,
    ) -> Arc<Self> {
        let room_id = room_id.into();
        let id = TransportId::new();
        let status = Arc::new(StatusCell::new(ConnectionStatus::Connecting));
        let stats = Arc::new(TransportStats::default());
        let shutdown = Arc::new(ShutdownSignal::new());
        let seq = Arc::new(AtomicU64::new(1));

        let (out_tx, out_rx) = mpsc::unbounded_channel::<OutFrame>();

        let doc_sub = {
            let out_tx = out_tx.clone();
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
                if out_tx.send(OutFrame::Delta(event.update.clone())).is_ok() {
                    stats.record_sent();
                }
            })
        };

        let awareness_sub = {
            let out_tx = out_tx.clone();
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
                if out_tx.send(OutFrame::Awareness(payload)).is_ok() {
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
            seq.clone(),
            out_rx,
            shutdown.subscribe(),
        ));

        Arc::new(Self {
            id,
            room_id,
            status,
            stats,
            shutdown,
            seq,
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

    /// The next sequence number an outbound request would take.
    pub fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

impl Transport for RpcWebSocketTransport {
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
            log::info!("rpc transport for room {} shut down", self.room_id);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    config: RpcWsConfig,
    room_id: String,
    id: TransportId,
    doc: Arc<ReplicatedDocument>,
    awareness: Arc<AwarenessRegistry>,
    status: Arc<StatusCell>,
    stats: Arc<TransportStats>,
    seq: Arc<AtomicU64>,
    mut out_rx: mpsc::UnboundedReceiver<OutFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = ReconnectBackoff::new(config.backoff.clone());
    // Dropped to `None` (no header, JSON envelopes) once a server rejects
    // the sub-protocol offer; stays dropped across reconnects.
    let mut offer = Some(if config.binary {
        SUBPROTOCOL_BINARY
    } else {
        SUBPROTOCOL_JSON
    });

    'reconnect: loop {
        if *shutdown_rx.borrow() {
            break;
        }
        backoff.connecting();
        status.set(ConnectionStatus::Connecting);

        let request = match build_request(&config, offer) {
            Ok(request) => request,
            Err(e) => {
                // A malformed endpoint URL will never connect; park in
                // Error instead of hot-looping.
                log::error!("invalid rpc endpoint {}: {e}", config.url);
                status.set(ConnectionStatus::Error);
                let _ = shutdown_rx.changed().await;
                break 'reconnect;
            }
        };

        let (stream, response) = tokio::select! {
            _ = shutdown_rx.changed() => break 'reconnect,
            result = tokio_tungstenite::connect_async(request) => match result {
                Ok(ok) => ok,
                Err(tokio_tungstenite::tungstenite::Error::Protocol(
                    ProtocolError::SecWebSocketSubProtocolError(_),
                )) if offer.is_some() => {
                    // The endpoint is reachable, it just does not speak
                    // sub-protocols. Retry right away without the header.
                    log::info!(
                        "rpc server for room {room_id} rejected the sub-protocol offer; \
                         falling back to plain JSON envelopes"
                    );
                    offer = None;
                    continue 'reconnect;
                }
                Err(e) => {
                    log::warn!("rpc connect to room {room_id} failed: {e}");
                    status.set(ConnectionStatus::Error);
                    if !wait_retry(&mut backoff, &mut shutdown_rx).await {
                        break 'reconnect;
                    }
                    continue 'reconnect;
                }
            },
        };

        let binary_deltas = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .map(|proto| proto == SUBPROTOCOL_BINARY)
            .unwrap_or(false);
        let (mut sink, mut reader) = stream.split();

        // Connected from the moment the socket opens. A delta emitted
        // while the handshake is still in flight then queues into
        // `out_rx` and goes out right after the sync frame, instead of
        // being dropped between `encode_state` and the status flip.
        backoff.connected();
        status.set(ConnectionStatus::Connected);
        log::info!(
            "rpc transport connected to room {room_id} (binary deltas: {binary_deltas})"
        );

        // Handshake: subscribe, full-state sync, then awareness, each with
        // a fresh seq.
        let handshake = handshake(
            &mut sink,
            &config,
            &room_id,
            &doc,
            &awareness,
            &seq,
        )
        .await;
        if handshake.is_err() {
            status.set(ConnectionStatus::Error);
            if !wait_retry(&mut backoff, &mut shutdown_rx).await {
                break 'reconnect;
            }
            continue 'reconnect;
        }

        let reason = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break CloseReason::Shutdown,
                outbound = out_rx.recv() => match outbound {
                    Some(frame) => {
                        let message = match encode_out_frame(frame, &room_id, &seq, binary_deltas) {
                            Ok(message) => message,
                            Err(e) => {
                                log::warn!("failed to encode outbound rpc frame: {e}");
                                continue;
                            }
                        };
                        if sink.send(message).await.is_err() {
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
                    Some(Ok(Message::Binary(data))) => {
                        if *shutdown_rx.borrow() {
                            break CloseReason::Shutdown;
                        }
                        // Raw delta fast path.
                        match doc.apply_delta(&data, Origin::Remote(id)) {
                            Ok(()) => stats.record_applied(),
                            Err(e) => log::warn!("dropping inbound binary delta: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) => break CloseReason::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("rpc socket error in room {room_id}: {e}");
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
    log::debug!("rpc supervisor for room {room_id} stopped");
}

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

/// Build the upgrade request. `offer` is the single sub-protocol to
/// request, or `None` to connect without the header.
fn build_request(
    config: &RpcWsConfig,
    offer: Option<&str>,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SyncError> {
    let mut request = config
        .connect_url()
        .into_client_request()
        .map_err(|e| SyncError::Serialization(e.to_string()))?;
    if let Some(proto) = offer {
        let value =
            HeaderValue::from_str(proto).map_err(|e| SyncError::Serialization(e.to_string()))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }
    Ok(request)
}

async fn handshake<S>(
    sink: &mut S,
    config: &RpcWsConfig,
    room_id: &str,
    doc: &ReplicatedDocument,
    awareness: &AwarenessRegistry,
    seq: &AtomicU64,
) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let subscribe = RpcRequest::new(
        seq.fetch_add(1, Ordering::SeqCst),
        METHOD_SUBSCRIBE,
        SubscribeParams {
            room_id: room_id.to_string(),
            session_id: config.session_id.clone(),
            token: config.token.as_ref().map(|provider| provider()),
            capabilities: vec![CAPABILITY_DELTA_V1.into(), CAPABILITY_AWARENESS_V1.into()],
        },
    );
    send_request(sink, &subscribe).await?;

    let sync_seq = seq.fetch_add(1, Ordering::SeqCst);
    let sync = RpcRequest::new(
        sync_seq,
        METHOD_SYNC,
        PayloadParams {
            room_id: room_id.to_string(),
            seq: sync_seq,
            payload_b64: BASE64.encode(doc.encode_state()),
        },
    );
    send_request(sink, &sync).await?;

    if awareness.has_local_state() {
        match awareness.encode_all() {
            Ok(payload) => {
                let aw_seq = seq.fetch_add(1, Ordering::SeqCst);
                let msg = RpcRequest::new(
                    aw_seq,
                    METHOD_AWARENESS,
                    PayloadParams {
                        room_id: room_id.to_string(),
                        seq: aw_seq,
                        payload_b64: BASE64.encode(payload),
                    },
                );
                send_request(sink, &msg).await?;
            }
            Err(e) => log::warn!("failed to encode initial awareness: {e}"),
        }
    }
    Ok(())
}

async fn send_request<S, P>(sink: &mut S, request: &RpcRequest<P>) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
    P: serde::Serialize,
{
    let text = match request.encode() {
        Ok(text) => text,
        Err(e) => {
            log::warn!("failed to encode rpc request: {e}");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

fn encode_out_frame(
    frame: OutFrame,
    room_id: &str,
    seq: &AtomicU64,
    binary_deltas: bool,
) -> Result<Message, SyncError> {
    match frame {
        OutFrame::Delta(bytes) if binary_deltas => Ok(Message::Binary(bytes.into())),
        OutFrame::Delta(bytes) => {
            let n = seq.fetch_add(1, Ordering::SeqCst);
            let request = RpcRequest::new(
                n,
                METHOD_UPDATE,
                PayloadParams {
                    room_id: room_id.to_string(),
                    seq: n,
                    payload_b64: BASE64.encode(bytes),
                },
            );
            Ok(Message::Text(request.encode()?.into()))
        }
        OutFrame::Awareness(bytes) => {
            let n = seq.fetch_add(1, Ordering::SeqCst);
            let request = RpcRequest::new(
                n,
                METHOD_AWARENESS,
                PayloadParams {
                    room_id: room_id.to_string(),
                    seq: n,
                    payload_b64: BASE64.encode(bytes),
                },
            );
            Ok(Message::Text(request.encode()?.into()))
        }
    }
}

/// Decode and apply one inbound JSON-RPC frame.
fn handle_text(
    text: &str,
    room_id: &str,
    id: TransportId,
    doc: &ReplicatedDocument,
    awareness: &AwarenessRegistry,
    stats: &TransportStats,
) {
    let frame = match RpcIncoming::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("dropping malformed rpc frame: {e}");
            return;
        }
    };
    if frame.is_ack() {
        log::trace!("rpc ack: {:?}", frame.id);
        return;
    }
    let Some(method) = frame.method.as_deref() else {
        log::debug!("ignoring rpc frame with neither method nor result");
        return;
    };
    let params: PayloadParams = match frame
        .params
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(params)) => params,
        Ok(None) => {
            log::warn!("rpc {method} frame missing params");
            return;
        }
        Err(e) => {
            log::warn!("dropping rpc {method} frame with bad params: {e}");
            return;
        }
    };
    if params.room_id != room_id {
        log::debug!("ignoring rpc frame for foreign room {}", params.room_id);
        return;
    }
    let payload = match BASE64.decode(&params.payload_b64) {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!("dropping rpc {method} frame with bad base64: {e}");
            return;
        }
    };
    match method {
        METHOD_SYNC | METHOD_UPDATE => match doc.apply_delta(&payload, Origin::Remote(id)) {
            Ok(()) => stats.record_applied(),
            Err(e) => log::warn!("dropping inbound delta: {e}"),
        },
        METHOD_AWARENESS => match awareness.apply_diff(&payload, Origin::Remote(id)) {
            Ok(_) => stats.record_applied(),
            Err(e) => log::warn!("dropping inbound awareness diff: {e}"),
        },
        other => log::debug!("ignoring unknown rpc method {other}"),
    }
}
