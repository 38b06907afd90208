//! Detection of overlapping selections between peers.
//!
//! Purely advisory: the CRDT already resolves concurrent edits, so a
//! "conflict" here only drives UI hints ("Alice is editing this
//! sentence"). Overlap is computed on normalized half-open ranges, which
//! makes edge-touching selections non-conflicting and direction
//! irrelevant.

use std::sync::Arc;

use crate::awareness::{AwarenessRegistry, SelectionRange, SelectionState};
use crate::protocol::ClientId;

/// Whether two ranges overlap, after normalizing direction. Half-open
/// semantics: ranges that merely touch at an endpoint do not overlap,
/// and degenerate (caret) ranges overlap nothing.
pub fn ranges_overlap(a: SelectionRange, b: SelectionRange) -> bool {
    if a.is_degenerate() || b.is_degenerate() {
        return false;
    }
    let (a_min, a_max) = a.normalized();
    let (b_min, b_max) = b.normalized();
    a_min < b_max && b_min < a_max
}

/// One peer whose selection overlaps the local one.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub client_id: ClientId,
    pub block_id: String,
    pub range: SelectionRange,
}

/// Compares the local published selection against every peer's.
pub struct ConflictDetector {
    awareness: Arc<AwarenessRegistry>,
}

impl ConflictDetector {
    pub fn new(awareness: Arc<AwarenessRegistry>) -> Self {
        Self { awareness }
    }

    /// Peers overlapping the local published selection. Empty when no
    /// local selection is published or it is a bare caret.
    pub fn conflicts(&self) -> Vec<Conflict> {
        match self.awareness.local_entry().and_then(|entry| entry.selection) {
            Some(selection) => self.conflicts_for(&selection),
            None => Vec::new(),
        }
    }

    /// Peers overlapping the given selection.
    pub fn conflicts_for(&self, selection: &SelectionState) -> Vec<Conflict> {
        if selection.range.is_degenerate() {
            return Vec::new();
        }
        self.awareness
            .peers()
            .into_iter()
            .filter_map(|(client_id, entry)| {
                let peer = entry.selection?;
                if peer.block_id == selection.block_id
                    && ranges_overlap(peer.range, selection.range)
                {
                    Some(Conflict {
                        client_id,
                        block_id: peer.block_id,
                        range: peer.range,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Whether any peer currently overlaps the local selection.
    pub fn has_conflict(&self) -> bool {
        !self.conflicts().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::PresenceState;
    use crate::protocol::Origin;

    fn range(start: usize, end: usize) -> SelectionRange {
        SelectionRange::new(start, end)
    }

    fn selection(block: &str, start: usize, end: usize) -> SelectionState {
        SelectionState {
            block_id: block.into(),
            range: range(start, end),
            color: None,
        }
    }

    /// Registry seeded with one peer selection delivered as a diff.
    fn registry_with_peer(
        local_id: ClientId,
        peer_id: ClientId,
        peer_selection: Option<SelectionState>,
    ) -> Arc<AwarenessRegistry> {
        let peer = AwarenessRegistry::new(peer_id);
        peer.set_local_presence(PresenceState::new("Peer"));
        if let Some(sel) = peer_selection {
            peer.set_local_selection(sel);
        }
        let registry = Arc::new(AwarenessRegistry::new(local_id));
        registry
            .apply_diff(&peer.encode_all().unwrap(), Origin::Local)
            .unwrap();
        registry
    }

    #[test]
    fn test_overlap_truth_table() {
        assert!(ranges_overlap(range(2, 5), range(4, 8)));
        // Edge-touching ranges do not conflict.
        assert!(!ranges_overlap(range(2, 4), range(4, 6)));
        assert!(ranges_overlap(range(3, 10), range(4, 6)));
        // Direction never matters.
        assert!(ranges_overlap(range(10, 3), range(6, 4)));
    }

    #[test]
    fn test_overlap_symmetric() {
        assert_eq!(
            ranges_overlap(range(2, 5), range(4, 8)),
            ranges_overlap(range(4, 8), range(2, 5))
        );
    }

    #[test]
    fn test_degenerate_overlaps_nothing() {
        assert!(!ranges_overlap(range(5, 5), range(0, 10)));
        assert!(!ranges_overlap(range(0, 10), range(5, 5)));
    }

    #[test]
    fn test_conflict_detected_same_block() {
        let registry = registry_with_peer(1, 2, Some(selection("b1", 4, 8)));
        registry.set_local_selection(selection("b1", 2, 5));

        let conflicts = ConflictDetector::new(registry).conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].client_id, 2);
        assert_eq!(conflicts[0].block_id, "b1");
        assert_eq!(conflicts[0].range, range(4, 8));
    }

    #[test]
    fn test_no_conflict_across_blocks() {
        let registry = registry_with_peer(1, 2, Some(selection("b2", 4, 8)));
        registry.set_local_selection(selection("b1", 2, 5));

        assert!(ConflictDetector::new(registry).conflicts().is_empty());
    }

    #[test]
    fn test_degenerate_local_selection_never_conflicts() {
        let registry = registry_with_peer(1, 2, Some(selection("b1", 0, 100)));
        registry.set_local_selection(selection("b1", 5, 5));

        assert!(ConflictDetector::new(registry).conflicts().is_empty());
    }

    #[test]
    fn test_no_local_selection_means_no_conflicts() {
        let registry = registry_with_peer(1, 2, Some(selection("b1", 0, 10)));
        let detector = ConflictDetector::new(registry);
        assert!(detector.conflicts().is_empty());
        assert!(!detector.has_conflict());
    }

    #[test]
    fn test_peer_without_selection_ignored() {
        let registry = registry_with_peer(1, 2, None);
        registry.set_local_selection(selection("b1", 2, 5));

        assert!(ConflictDetector::new(registry).conflicts().is_empty());
    }

    #[test]
    fn test_multiple_conflicting_peers() {
        let registry = registry_with_peer(1, 2, Some(selection("b1", 4, 8)));
        // Seed a second peer the same way.
        let other = AwarenessRegistry::new(3);
        other.set_local_presence(PresenceState::new("Other"));
        other.set_local_selection(selection("b1", 0, 3));
        registry
            .apply_diff(&other.encode_all().unwrap(), Origin::Local)
            .unwrap();

        registry.set_local_selection(selection("b1", 2, 5));
        let detector = ConflictDetector::new(registry);
        assert_eq!(detector.conflicts().len(), 2);
        assert!(detector.has_conflict());
    }
}
