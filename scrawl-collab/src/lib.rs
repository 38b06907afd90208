//! # scrawl-collab — Real-time sync layer for the Scrawl editor
//!
//! CRDT-backed multiplayer editing with pluggable transports and
//! cursor/selection awareness.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────┐
//! │ CollaborationProvider │  one per room session
//! └───────────┬───────────┘
//!             │ owns
//!     ┌───────┴────────┬───────────────────┐
//!     ▼                ▼                   ▼
//! ┌─────────┐  ┌────────────────┐  ┌──────────────┐
//! │ Yrs Doc │  │ AwarenessReg.  │  │ Transport    │
//! │ (local) │  │ (presence/sel) │  │ (1 of 3)     │
//! └─────────┘  └────────────────┘  └──────┬───────┘
//!                                         │
//!                   ┌─────────────────────┼─────────────────────┐
//!                   ▼                     ▼                     ▼
//!            ┌────────────┐      ┌───────────────┐     ┌──────────────┐
//!            │ Broadcast  │      │ Direct WS     │     │ JSON-RPC WS  │
//!            │ (in-proc)  │      │ (JSON frames) │     │ (enveloped)  │
//!            └────────────┘      └───────────────┘     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`doc`] — Yrs-backed replicated document with origin-tagged deltas
//! - [`awareness`] — ephemeral presence and selection state
//! - [`protocol`] — wire formats for both WebSocket transports
//! - [`transport`] — the transport contract and shared plumbing
//! - [`broadcast`] — same-device sync over an in-process bus
//! - [`direct`] — direct WebSocket transport with reconnection
//! - [`rpc`] — JSON-RPC WebSocket transport with a binary fast path
//! - [`backoff`] — exponential reconnect backoff
//! - [`selection`] — flat-offset to block-relative selection mapping
//! - [`conflict`] — advisory overlap detection between peer selections
//! - [`provider`] — the per-session entry point tying it all together

pub mod awareness;
pub mod backoff;
pub mod broadcast;
pub mod conflict;
pub mod direct;
pub mod doc;
pub mod protocol;
pub mod provider;
pub mod rpc;
pub mod selection;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    color_for_client, AwarenessDiff, AwarenessEntry, AwarenessRegistry, AwarenessSubscription,
    PresenceState, SelectionRange, SelectionState,
};
pub use backoff::{BackoffConfig, ReconnectBackoff, RetryState};
pub use broadcast::{BroadcastBus, BroadcastTransport, BusFrame, BusPayload};
pub use conflict::{ranges_overlap, Conflict, ConflictDetector};
pub use direct::{DirectWebSocketTransport, DirectWsConfig, TokenProvider};
pub use doc::{DeltaEvent, DeltaSubscription, ReplicatedDocument};
pub use protocol::{
    ClientId, ConnectionStatus, DirectMessage, Origin, SyncError, TransportId,
};
pub use provider::{CollaborationProvider, TransportConfig};
pub use rpc::{RpcWebSocketTransport, RpcWsConfig};
pub use selection::{block_containing, map_selection, Block, SelectionTracker};
pub use transport::{Transport, TransportStats, TransportStatsSnapshot};
