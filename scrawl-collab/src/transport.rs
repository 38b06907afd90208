//! The transport contract shared by all three transports.
//!
//! Exactly three implementations exist — same-device broadcast, direct
//! WebSocket, JSON-RPC WebSocket — selected at provider construction via
//! [`TransportConfig`](crate::provider::TransportConfig). Each owns its
//! tokio tasks and exposes an observable [`ConnectionStatus`] through a
//! watch channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::watch;

use crate::protocol::{ConnectionStatus, TransportId};

/// Common surface of the three transports.
///
/// `shutdown` is synchronous and idempotent: after it returns, no further
/// socket or channel event mutates the document or awareness registry.
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;
    fn status(&self) -> ConnectionStatus;
    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus>;
    fn shutdown(&self);
}

/// Observable connection status cell.
pub struct StatusCell {
    tx: watch::Sender<ConnectionStatus>,
}

impl StatusCell {
    pub fn new(initial: ConnectionStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, status: ConnectionStatus) {
        let previous = self.tx.send_replace(status);
        if previous != status {
            log::debug!("status: {previous} -> {status}");
        }
    }

    pub fn get(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

/// One-shot shutdown signal shared between a transport handle and its
/// spawned tasks.
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
    triggered: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    /// Trip the signal. Returns `true` on the first call only.
    pub fn trigger(&self) -> bool {
        let first = !self.triggered.swap(true, Ordering::SeqCst);
        if first {
            let _ = self.tx.send(true);
        }
        first
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-transport frame counters, tracked via atomics so the send/apply
/// paths never take a lock.
#[derive(Debug, Default)]
pub struct TransportStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_applied: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_applied: u64,
}

impl TransportStats {
    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self) {
        self.frames_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_applied: self.frames_applied.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_cell_set_get() {
        let cell = StatusCell::new(ConnectionStatus::Disconnected);
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);

        cell.set(ConnectionStatus::Connecting);
        assert_eq!(cell.get(), ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn test_status_cell_watch() {
        let cell = StatusCell::new(ConnectionStatus::Disconnected);
        let mut rx = cell.subscribe();

        cell.set(ConnectionStatus::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_shutdown_signal_fires_once() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_shutdown_signal_wakes_subscriber() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn test_stats_counters() {
        let stats = TransportStats::default();
        stats.record_sent();
        stats.record_sent();
        stats.record_dropped();
        stats.record_applied();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.frames_applied, 1);
    }
}
