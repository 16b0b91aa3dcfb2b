//! Undo/redo of mask layers by whole-layer snapshots.

use std::collections::VecDeque;

use tracing::debug;

use crate::mask::{MaskLayerKind, MaskLayers};
use crate::pixel_buffer::PixelBuffer;

pub const MAX_UNDO_DEPTH: usize = 15;

/// A layer's pixels at some point in time. `None` means the layer did not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub layer: MaskLayerKind,
    pub pixels: Option<PixelBuffer>,
}

#[derive(Debug, Clone, Default)]
pub struct MaskHistory {
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
}

impl MaskHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current state of `layer`. Must be called once before every
    /// mutating mask operation; invalidates the redo stack.
    pub fn snapshot(&mut self, masks: &MaskLayers, layer: MaskLayerKind) {
        self.push_undo(HistoryEntry {
            layer,
            pixels: masks.get(layer).cloned(),
        });
        self.redo.clear();
    }

    /// Returns `false` (and changes nothing) when there is nothing to undo.
    pub fn undo(&mut self, masks: &mut MaskLayers) -> bool {
        let Some(entry) = self.undo.pop_back() else {
            return false;
        };
        debug!(layer = %entry.layer, "undo");
        self.redo.push(HistoryEntry {
            layer: entry.layer,
            pixels: masks.get(entry.layer).cloned(),
        });
        masks.set(entry.layer, entry.pixels);
        true
    }

    pub fn redo(&mut self, masks: &mut MaskLayers) -> bool {
        let Some(entry) = self.redo.pop() else {
            return false;
        };
        debug!(layer = %entry.layer, "redo");
        self.push_undo(HistoryEntry {
            layer: entry.layer,
            pixels: masks.get(entry.layer).cloned(),
        });
        masks.set(entry.layer, entry.pixels);
        true
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    /// Undo entries, oldest first.
    pub fn undo_entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.undo.iter()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    fn push_undo(&mut self, entry: HistoryEntry) {
        if self.undo.len() == MAX_UNDO_DEPTH {
            self.undo.pop_front();
        }
        self.undo.push_back(entry);
    }
}
