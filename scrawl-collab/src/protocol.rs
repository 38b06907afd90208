//! Shared protocol types and wire formats for the collaboration transports.
//!
//! Two wire encodings live here:
//!
//! - [`DirectMessage`] — plain JSON text frames for the direct WebSocket
//!   transport. One logical message per frame, deltas carried as arrays of
//!   byte values. Simple over efficient, by intent.
//! - JSON-RPC 2.0 envelopes for the RPC transport (`collab/subscribe`,
//!   `collab/sync`, `collab/update`, `collab/awareness`), with binary
//!   payloads base64-encoded inside `params`.
//!
//! Echo suppression is carried by [`Origin`]: every delta/diff application
//! is tagged with where it came from, and a transport never re-broadcasts
//! an event tagged with its own [`TransportId`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer id of a connected replica instance (the yrs client id).
pub type ClientId = u64;

/// Identity of a single transport instance.
///
/// Fresh per construction; used inside [`Origin`] so echo suppression is an
/// equality check on a tagged value rather than a reference comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportId(Uuid);

impl TransportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransportId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of a document delta or awareness diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A mutation made by this replica (editor input, selection change).
    Local,
    /// A mutation delivered by the transport with the given id.
    Remote(TransportId),
}

impl Origin {
    /// Whether this mutation was delivered by the transport `id`.
    pub fn is_from(&self, id: TransportId) -> bool {
        matches!(self, Origin::Remote(t) if *t == id)
    }
}

/// Connection lifecycle surfaced to UI consumers.
///
/// Starts `Disconnected`, moves to `Connecting` when a transport is
/// constructed, `Connected` on a successful handshake, and back to
/// `Disconnected` (clean close) or `Error` (transport failure). Both close
/// and error schedule a reconnect; neither is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Direct WebSocket transport wire messages.
///
/// ```text
/// { "type": "sync"|"update", "roomId": string, "update": number[] }
/// { "type": "awareness", "roomId": string, "payload": number[] }
/// ```
///
/// `sync` and `update` are both document deltas — a `sync` payload is
/// simply a full-state delta, which the CRDT merge treats identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DirectMessage {
    Sync {
        #[serde(rename = "roomId")]
        room_id: String,
        update: Vec<u8>,
    },
    Update {
        #[serde(rename = "roomId")]
        room_id: String,
        update: Vec<u8>,
    },
    Awareness {
        #[serde(rename = "roomId")]
        room_id: String,
        payload: Vec<u8>,
    },
}

impl DirectMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::Deserialization(e.to_string()))
    }

    /// The room this message is scoped to.
    pub fn room_id(&self) -> &str {
        match self {
            Self::Sync { room_id, .. }
            | Self::Update { room_id, .. }
            | Self::Awareness { room_id, .. } => room_id,
        }
    }
}

// ── JSON-RPC framing (RPC transport) ────────────────────────────────

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_SUBSCRIBE: &str = "collab/subscribe";
pub const METHOD_SYNC: &str = "collab/sync";
pub const METHOD_UPDATE: &str = "collab/update";
pub const METHOD_AWARENESS: &str = "collab/awareness";

/// WebSocket sub-protocol tokens requested at connect time.
pub const SUBPROTOCOL_JSON: &str = "mcp-json";
pub const SUBPROTOCOL_BINARY: &str = "mcp-binary";

/// Capability tags advertised in `collab/subscribe`.
pub const CAPABILITY_DELTA_V1: &str = "delta-v1";
pub const CAPABILITY_AWARENESS_V1: &str = "awareness-v1";

/// Params for `collab/subscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeParams {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub capabilities: Vec<String>,
}

/// Params for `collab/sync`, `collab/update` and `collab/awareness`.
///
/// `seq` is the sender's locally monotonic sequence number, doubled as the
/// JSON-RPC request id and usable as an application-level ordering hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadParams {
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub seq: u64,
    #[serde(rename = "payloadB64")]
    pub payload_b64: String,
}

/// An outbound JSON-RPC request/notification.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<P: Serialize> {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: &'static str,
    pub params: P,
}

impl<P: Serialize> RpcRequest<P> {
    pub fn new(seq: u64, method: &'static str, params: P) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: seq.to_string(),
            method,
            params,
        }
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

/// An inbound JSON-RPC frame, parsed loosely.
///
/// Only `method`-bearing frames (requests/notifications) are acted on.
/// `result`-bearing frames are acks; they are accepted and ignored,
/// reserved for future ack-based flow control.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcIncoming {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl RpcIncoming {
    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::Deserialization(e.to_string()))
    }

    /// Whether this is an ack (`result` present, no `method`).
    pub fn is_ack(&self) -> bool {
        self.method.is_none() && self.result.is_some()
    }
}

/// Errors raised inside the sync layer.
///
/// None of these ever propagate synchronously to UI code; failure is
/// expressed through the observable [`ConnectionStatus`] and malformed
/// inbound frames are dropped where they are decoded.
#[derive(Debug, Clone)]
pub enum SyncError {
    Serialization(String),
    Deserialization(String),
    Document(String),
    ChannelClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::Document(e) => write!(f, "Document error: {e}"),
            Self::ChannelClosed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_sync_wire_shape() {
        let msg = DirectMessage::Sync {
            room_id: "room-1".into(),
            update: vec![1, 2, 3],
        };
        let json = msg.encode().unwrap();
        assert!(json.contains("\"type\":\"sync\""));
        assert!(json.contains("\"roomId\":\"room-1\""));
        assert!(json.contains("\"update\":[1,2,3]"));
    }

    #[test]
    fn test_direct_awareness_wire_shape() {
        let msg = DirectMessage::Awareness {
            room_id: "room-1".into(),
            payload: vec![9, 8],
        };
        let json = msg.encode().unwrap();
        assert!(json.contains("\"type\":\"awareness\""));
        assert!(json.contains("\"payload\":[9,8]"));
    }

    #[test]
    fn test_direct_message_roundtrip() {
        let msg = DirectMessage::Update {
            room_id: "doc".into(),
            update: vec![0, 255, 42],
        };
        let decoded = DirectMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.room_id(), "doc");
    }

    #[test]
    fn test_direct_decode_garbage() {
        assert!(DirectMessage::decode("not json").is_err());
        assert!(DirectMessage::decode("{\"type\":\"unknown\"}").is_err());
    }

    #[test]
    fn test_rpc_subscribe_wire_shape() {
        let req = RpcRequest::new(
            1,
            METHOD_SUBSCRIBE,
            SubscribeParams {
                room_id: "room-1".into(),
                session_id: Some("sid-1".into()),
                token: None,
                capabilities: vec![CAPABILITY_DELTA_V1.into()],
            },
        );
        let json = req.encode().unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":\"1\""));
        assert!(json.contains("\"method\":\"collab/subscribe\""));
        assert!(json.contains("\"sessionId\":\"sid-1\""));
        // Absent token must be omitted, not null.
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_rpc_payload_wire_shape() {
        let req = RpcRequest::new(
            7,
            METHOD_UPDATE,
            PayloadParams {
                room_id: "r".into(),
                seq: 7,
                payload_b64: "AAEC".into(),
            },
        );
        let json = req.encode().unwrap();
        assert!(json.contains("\"payloadB64\":\"AAEC\""));
        assert!(json.contains("\"seq\":7"));
    }

    #[test]
    fn test_rpc_incoming_method_frame() {
        let text = r#"{"jsonrpc":"2.0","id":"3","method":"collab/update","params":{"roomId":"r","seq":3,"payloadB64":"AA=="}}"#;
        let frame = RpcIncoming::decode(text).unwrap();
        assert_eq!(frame.method.as_deref(), Some("collab/update"));
        assert!(!frame.is_ack());
    }

    #[test]
    fn test_rpc_incoming_ack_frame() {
        let text = r#"{"jsonrpc":"2.0","id":"3","result":{}}"#;
        let frame = RpcIncoming::decode(text).unwrap();
        assert!(frame.is_ack());
    }

    #[test]
    fn test_origin_is_from() {
        let a = TransportId::new();
        let b = TransportId::new();
        assert!(Origin::Remote(a).is_from(a));
        assert!(!Origin::Remote(a).is_from(b));
        assert!(!Origin::Local.is_from(a));
    }

    #[test]
    fn test_status_display_strings() {
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
        assert_eq!(ConnectionStatus::Error.to_string(), "error");
    }
}
