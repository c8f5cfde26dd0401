//! Marker handles and their shared state.
//!
//! A handle is the long-lived object an owner keeps. It wraps an `Arc` around
//! the marker's shared state while the tree holds only a `Weak`; dropping the
//! last handle therefore makes the tree's entry collectable without any
//! explicit removal call. The `Drop` impl below is the removal signal: it
//! bumps the owning tree's dead-reference counter, and the tree purges the
//! entry lazily once enough of them pile up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::MarkerError;
use crate::tree::MarkerTree;

/// Unique, monotonically assigned marker identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerId(pub u64);

/// Boundary behaviour of a marker.
///
/// A greedy boundary absorbs text inserted exactly at it. `sticky_right`
/// only matters for zero-length markers: it decides whether the point rides
/// along with an insertion at its exact offset or stays put in front of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Anchoring {
    pub greedy_left: bool,
    pub greedy_right: bool,
    pub sticky_right: bool,
}

impl Anchoring {
    /// Both boundaries greedy; the marker swallows text typed at either end.
    pub fn greedy() -> Self {
        Self {
            greedy_left: true,
            greedy_right: true,
            sticky_right: false,
        }
    }

    /// Zero-length anchor that moves past text inserted at its offset.
    pub fn sticky_right() -> Self {
        Self {
            greedy_left: false,
            greedy_right: false,
            sticky_right: true,
        }
    }
}

/// Sentinel for "not attached to any tree node".
pub(crate) const DETACHED: u64 = u64::MAX;

/// State shared between a handle and the tree node that owns it.
///
/// `node` is a packed `(slot index, generation)` pair into the tree's node
/// arena, or [`DETACHED`]. It is atomic so that `is_valid()` and the `Drop`
/// impl never need the tree lock.
pub(crate) struct MarkerCore {
    id: u64,
    node: AtomicU64,
    tree: Weak<MarkerTree>,
}

impl MarkerCore {
    pub(crate) fn new(id: u64, tree: Weak<MarkerTree>) -> Self {
        Self {
            id,
            node: AtomicU64::new(DETACHED),
            tree,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn node_key(&self) -> u64 {
        self.node.load(Ordering::Acquire)
    }

    pub(crate) fn set_node(&self, packed: u64) {
        self.node.store(packed, Ordering::Release);
    }

    pub(crate) fn detach(&self) {
        self.node.store(DETACHED, Ordering::Release);
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.node_key() != DETACHED
    }

    pub(crate) fn tree(&self) -> Option<Arc<MarkerTree>> {
        self.tree.upgrade()
    }
}

impl Drop for MarkerCore {
    fn drop(&mut self) {
        // Abandoned while still in the tree: leave a note for the lazy purge.
        // Disposed and invalidated markers are already detached and were
        // accounted for at removal time.
        if self.is_attached() {
            if let Some(tree) = self.tree.upgrade() {
                tree.note_dead_reference();
            }
        }
    }
}

/// Generic position anchor: a handle to one `[start, end)` interval kept in
/// sync with buffer edits.
///
/// Cloning is cheap and shares the underlying marker. The marker stays alive
/// while at least one clone exists; callers that need a "still exists"
/// guarantee must hold one.
#[derive(Clone)]
pub struct RangeAnchor {
    core: Arc<MarkerCore>,
}

impl RangeAnchor {
    pub(crate) fn from_core(core: Arc<MarkerCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<MarkerCore> {
        &self.core
    }

    pub fn id(&self) -> MarkerId {
        MarkerId(self.core.id())
    }

    /// Current absolute bounds, or `None` for a disposed/invalidated marker.
    ///
    /// Cost: O(log n) — walks the node's root path accumulating pending
    /// shifts under a (recursive) read lock, so it is safe to call from
    /// inside traversal visitors.
    pub fn range(&self) -> Option<(u64, u64)> {
        self.core.tree()?.range_of(&self.core)
    }

    pub fn start(&self) -> Option<u64> {
        self.range().map(|(s, _)| s)
    }

    pub fn end(&self) -> Option<u64> {
        self.range().map(|(_, e)| e)
    }

    /// False once the marker was disposed, invalidated by an edit, or its
    /// tree was dropped.
    pub fn is_valid(&self) -> bool {
        self.core.is_attached() && self.core.tree().is_some()
    }

    /// Explicit removal. Returns `false` if the marker was already gone;
    /// operating on a stale handle is never an error.
    pub fn dispose(&self) -> bool {
        match self.core.tree() {
            Some(tree) => tree.remove(&self.core),
            None => false,
        }
    }

    /// Moves the marker, preserving handle identity. Returns `false` on a
    /// stale handle or an out-of-document range.
    pub fn change_bounds(&self, start: u64, end: u64, anchoring: Anchoring, layer: u16) -> bool {
        match self.core.tree() {
            Some(tree) => tree.change_bounds(&self.core, start, end, anchoring, layer),
            None => false,
        }
    }
}

impl PartialEq for RangeAnchor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for RangeAnchor {}

impl std::fmt::Debug for RangeAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeAnchor")
            .field("id", &self.core.id())
            .field("range", &self.range())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A foldable region of text. Both boundaries are non-greedy so that typing
/// at the edges of a fold does not silently grow it.
pub struct FoldRegion {
    anchor: RangeAnchor,
}

impl FoldRegion {
    pub fn new(tree: &Arc<MarkerTree>, start: u64, end: u64) -> Result<Self, MarkerError> {
        tree.create(start, end, Anchoring::default(), 0)
            .map(|anchor| Self { anchor })
    }

    pub fn anchor(&self) -> &RangeAnchor {
        &self.anchor
    }

    pub fn range(&self) -> Option<(u64, u64)> {
        self.anchor.range()
    }

    pub fn is_valid(&self) -> bool {
        self.anchor.is_valid()
    }

    pub fn dispose(&self) -> bool {
        self.anchor.dispose()
    }
}

/// A caret position or selection span. Collapsed selections are sticky to
/// the right so the caret rides along with typed text.
pub struct SelectionAnchor {
    anchor: RangeAnchor,
}

impl SelectionAnchor {
    pub fn new(tree: &Arc<MarkerTree>, start: u64, end: u64) -> Result<Self, MarkerError> {
        tree.create(start, end, Anchoring::sticky_right(), 0)
            .map(|anchor| Self { anchor })
    }

    pub fn anchor(&self) -> &RangeAnchor {
        &self.anchor
    }

    pub fn range(&self) -> Option<(u64, u64)> {
        self.anchor.range()
    }

    /// Caret offset (the selection start).
    pub fn offset(&self) -> Option<u64> {
        self.anchor.start()
    }

    pub fn is_valid(&self) -> bool {
        self.anchor.is_valid()
    }

    pub fn dispose(&self) -> bool {
        self.anchor.dispose()
    }
}

/// Zero-length anchor for an inline widget rendered at a buffer offset.
pub struct InlayAnchor {
    anchor: RangeAnchor,
}

impl InlayAnchor {
    /// `sticky_right` decides whether the widget ends up before or after
    /// text typed exactly at its offset.
    pub fn new(tree: &Arc<MarkerTree>, offset: u64, sticky_right: bool) -> Result<Self, MarkerError> {
        let anchoring = Anchoring {
            sticky_right,
            ..Anchoring::default()
        };
        tree.create(offset, offset, anchoring, 0)
            .map(|anchor| Self { anchor })
    }

    pub fn anchor(&self) -> &RangeAnchor {
        &self.anchor
    }

    pub fn offset(&self) -> Option<u64> {
        self.anchor.start()
    }

    pub fn is_valid(&self) -> bool {
        self.anchor.is_valid()
    }

    pub fn dispose(&self) -> bool {
        self.anchor.dispose()
    }
}

/// A highlighted range. `layer` feeds the tie-break ordering: when several
/// highlighters cover identical bounds, higher layers win.
pub struct Highlighter {
    anchor: RangeAnchor,
    layer: u16,
}

impl Highlighter {
    pub fn new(
        tree: &Arc<MarkerTree>,
        start: u64,
        end: u64,
        anchoring: Anchoring,
        layer: u16,
    ) -> Result<Self, MarkerError> {
        tree.create(start, end, anchoring, layer)
            .map(|anchor| Self { anchor, layer })
    }

    pub fn anchor(&self) -> &RangeAnchor {
        &self.anchor
    }

    pub fn layer(&self) -> u16 {
        self.layer
    }

    pub fn range(&self) -> Option<(u64, u64)> {
        self.anchor.range()
    }

    pub fn is_valid(&self) -> bool {
        self.anchor.is_valid()
    }

    pub fn dispose(&self) -> bool {
        self.anchor.dispose()
    }
}
