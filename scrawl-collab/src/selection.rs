//! Mapping editor selections onto blocks for awareness publication.
//!
//! The editor reports selections as flat document offsets; peers want
//! them block-relative so a cursor stays attached to its paragraph while
//! other blocks change around it. [`map_selection`] does the conversion;
//! [`SelectionTracker`] feeds the result into the awareness registry,
//! clearing the published selection whenever the cursor falls outside
//! every known block.

use std::sync::Arc;

use crate::awareness::{
    color_for_client, AwarenessRegistry, SelectionRange, SelectionState,
};

/// One block of the document layout, in flat document offsets.
/// `start..end` is half-open for content, but a caret sitting exactly at
/// `end` still belongs to this block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: String,
    pub start: usize,
    pub end: usize,
}

impl Block {
    pub fn new(id: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            id: id.into(),
            start,
            end,
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a flat offset falls in this block, end-inclusive so a
    /// caret at the block boundary maps to the earlier block.
    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset <= self.end
    }
}

/// The first block containing `offset` (blocks are scanned in layout
/// order, so a boundary offset resolves to the earlier block).
pub fn block_containing(blocks: &[Block], offset: usize) -> Option<&Block> {
    blocks.iter().find(|block| block.contains(offset))
}

/// Map a flat document selection to a block-relative range.
///
/// The selection anchors to the block containing its lower endpoint; the
/// upper endpoint is clamped to that block. A bare caret is widened to a
/// one-character range when room exists, so peers render a visible
/// cursor; a caret at the very end of a block stays degenerate.
///
/// Returns `None` when the selection falls outside every block.
pub fn map_selection(blocks: &[Block], start: usize, end: usize) -> Option<(String, SelectionRange)> {
    let (min, max) = if start <= end { (start, end) } else { (end, start) };
    let block = block_containing(blocks, min)?;

    let local_start = min - block.start;
    let mut local_end = max.min(block.end) - block.start;
    if local_start == local_end && local_end < block.len() {
        local_end += 1;
    }
    Some((block.id.clone(), SelectionRange::new(local_start, local_end)))
}

/// Publishes the local selection into the awareness registry as the
/// editor cursor moves.
pub struct SelectionTracker {
    awareness: Arc<AwarenessRegistry>,
}

impl SelectionTracker {
    pub fn new(awareness: Arc<AwarenessRegistry>) -> Self {
        Self { awareness }
    }

    /// Publish the selection `start..end` against the given block layout.
    /// Falls back to clearing when no block contains it.
    pub fn update(&self, blocks: &[Block], start: usize, end: usize) {
        match map_selection(blocks, start, end) {
            Some((block_id, range)) => {
                self.awareness.set_local_selection(SelectionState {
                    block_id,
                    range,
                    color: Some(color_for_client(self.awareness.local_id())),
                });
            }
            None => self.awareness.clear_local_selection(),
        }
    }

    /// Clear the published selection (blur, mode exit).
    pub fn clear(&self) {
        self.awareness.clear_local_selection();
    }
}
