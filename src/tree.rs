//! The live interval tree.
//!
//! Intervals live in a red-black tree ordered by start offset (ties broken by
//! a pluggable comparator over end, anchoring and layer). Two augmentations
//! keep bulk edits and overlap queries cheap:
//!
//! - every node carries a pending shift `delta` that applies to its whole
//!   subtree, so moving "everything right of the edit" is O(1) plus lazy
//!   push-down on later descents;
//! - every node carries `max_end`, the largest interval end in its subtree,
//!   stored in the node's own delta frame, which lets queries prune whole
//!   subtrees.
//!
//! The frame convention: a node's `start`/`end`/`max_end` are absolute once
//! every `delta` on its root path, the node's own included, has been added.
//! The local invariant is frame-free:
//! `max_end == max(end, left.max_end + left.delta, right.max_end + right.delta)`.
//!
//! Nodes are stored in an arena (`Vec` plus free list) and addressed by
//! `(index, generation)` pairs so a stale handle can never read a recycled
//! slot. Markers with identical start and ordering key share one node; each
//! node holds weak references to its markers, and dropped handles are swept
//! out lazily once a third of the tree is dead.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::edit::{offset_by, DocumentEdit};
use crate::error::MarkerError;
use crate::marker::{Anchoring, MarkerCore, RangeAnchor, DETACHED};

/// Nil child/parent sentinel in the node arena.
const NIL: u32 = u32::MAX;

/// Expensive O(n) structure checking, compiled in for tests and the `verify`
/// feature.
const VERIFY: bool = cfg!(any(test, feature = "verify"));

fn pack(index: u32, generation: u32) -> u64 {
    (generation as u64) << 32 | index as u64
}

fn unpack(key: u64) -> (u32, u32) {
    (key as u32, (key >> 32) as u32)
}

// --- ordering ---------------------------------------------------------------

/// Ordering key for intervals that share a start offset.
#[derive(Debug, Clone, Copy)]
pub struct TieBreak {
    pub end: u64,
    pub anchoring: Anchoring,
    pub layer: u16,
}

/// Comparator over equal-start intervals. `Equal` means the intervals merge
/// into a single node, so a comparator must only return `Equal` for intervals
/// it considers interchangeable.
pub type TieBreakFn = fn(&TieBreak, &TieBreak) -> CmpOrdering;

/// Default equal-start ordering: higher layer first, greedy-left before
/// non-greedy, then smaller end, greedy-right first, sticky-right first.
pub fn default_tie_break(a: &TieBreak, b: &TieBreak) -> CmpOrdering {
    b.layer
        .cmp(&a.layer)
        .then(b.anchoring.greedy_left.cmp(&a.anchoring.greedy_left))
        .then(a.end.cmp(&b.end))
        .then(b.anchoring.greedy_right.cmp(&a.anchoring.greedy_right))
        .then(b.anchoring.sticky_right.cmp(&a.anchoring.sticky_right))
}

// --- node arena -------------------------------------------------------------

struct Node {
    start: u64,
    end: u64,
    /// Pending shift for this node and everything below it.
    delta: i64,
    /// Largest interval end in this subtree, in this node's delta frame.
    max_end: u64,
    red: bool,
    parent: u32,
    left: u32,
    right: u32,
    /// Bumped when the slot is freed; guards against stale packed keys.
    generation: u32,
    /// Cleared when a consistency violation isolates the node.
    valid: bool,
    anchoring: Anchoring,
    layer: u16,
    /// Markers sharing this interval. Weak so that dropping the last handle
    /// makes the entry collectable.
    keys: SmallVec<[std::sync::Weak<MarkerCore>; 2]>,
}

struct TreeInner {
    nodes: Vec<Node>,
    free: Vec<u32>,
    root: u32,
    node_count: usize,
    /// Total weak keys stored, dead ones included.
    key_count: usize,
    /// Structural modification counter, checked across traversals.
    mod_count: u64,
    doc_len: u64,
    /// Set by `on_before_edit`, cleared by `on_after_edit`.
    pending_edit: Option<DocumentEdit>,
    bulk_depth: u32,
    /// Designated writer thread, recorded on the first edit hook.
    writer: Option<ThreadId>,
    tie_break: TieBreakFn,
}

impl TreeInner {
    fn alloc(&mut self, start: u64, end: u64, anchoring: Anchoring, layer: u16) -> u32 {
        self.node_count += 1;
        let node = |generation| Node {
            start,
            end,
            delta: 0,
            max_end: end,
            red: true,
            parent: NIL,
            left: NIL,
            right: NIL,
            generation,
            valid: true,
            anchoring,
            layer,
            keys: SmallVec::new(),
        };
        match self.free.pop() {
            Some(idx) => {
                let generation = self.nodes[idx as usize].generation;
                self.nodes[idx as usize] = node(generation);
                idx
            }
            None => {
                let idx = self.nodes.len() as u32;
                self.nodes.push(node(0));
                idx
            }
        }
    }

    /// Returns an unlinked slot to the free list. The generation bump
    /// invalidates every packed key still pointing here.
    fn release(&mut self, idx: u32) {
        self.node_count -= 1;
        let n = &mut self.nodes[idx as usize];
        n.generation = n.generation.wrapping_add(1);
        n.valid = false;
        n.keys.clear();
        n.parent = NIL;
        n.left = NIL;
        n.right = NIL;
        self.free.push(idx);
    }

    fn resolve(&self, key: u64) -> Option<u32> {
        if key == DETACHED {
            return None;
        }
        let (idx, generation) = unpack(key);
        let node = self.nodes.get(idx as usize)?;
        (node.generation == generation && node.valid).then_some(idx)
    }

    fn is_red(&self, idx: u32) -> bool {
        idx != NIL && self.nodes[idx as usize].red
    }

    fn has_alive_key(&self, idx: u32) -> bool {
        self.nodes[idx as usize]
            .keys
            .iter()
            .any(|w| w.strong_count() > 0)
    }

    // --- delta and max_end maintenance ---

    /// Applies the node's pending shift to its own bounds and hands it down
    /// to the children. Requires every ancestor to be pushed already.
    fn push_delta(&mut self, idx: u32) {
        if idx == NIL {
            return;
        }
        let delta = self.nodes[idx as usize].delta;
        if delta == 0 {
            return;
        }
        let n = &mut self.nodes[idx as usize];
        n.start = offset_by(n.start, delta);
        n.end = offset_by(n.end, delta);
        n.max_end = offset_by(n.max_end, delta);
        n.delta = 0;
        let (left, right) = (n.left, n.right);
        if left != NIL {
            self.nodes[left as usize].delta += delta;
        }
        if right != NIL {
            self.nodes[right as usize].delta += delta;
        }
    }

    /// Pushes every delta on the root path down to `idx`, top first.
    fn push_delta_from_root(&mut self, idx: u32) {
        let mut path: SmallVec<[u32; 24]> = SmallVec::new();
        let mut i = idx;
        while i != NIL {
            path.push(i);
            i = self.nodes[i as usize].parent;
        }
        for &i in path.iter().rev() {
            self.push_delta(i);
        }
    }

    /// Recomputes `max_end` from the children. Frame-free.
    fn correct_max(&mut self, idx: u32) {
        let n = &self.nodes[idx as usize];
        let mut max = n.end;
        for child in [n.left, n.right] {
            if child != NIL {
                let c = &self.nodes[child as usize];
                max = max.max(offset_by(c.max_end, c.delta));
            }
        }
        self.nodes[idx as usize].max_end = max;
    }

    fn correct_max_up(&mut self, mut idx: u32) {
        while idx != NIL {
            self.correct_max(idx);
            idx = self.nodes[idx as usize].parent;
        }
    }

    /// Pushes every pending delta in the subtree. Idempotent.
    fn push_all(&mut self, idx: u32) {
        if idx == NIL {
            return;
        }
        self.push_delta(idx);
        let (left, right) = {
            let n = &self.nodes[idx as usize];
            (n.left, n.right)
        };
        self.push_all(left);
        self.push_all(right);
    }

    // --- rotations ---

    fn rotate_left(&mut self, x: u32) {
        self.push_delta(x);
        let y = self.nodes[x as usize].right;
        self.push_delta(y);
        let y_left = self.nodes[y as usize].left;
        self.nodes[x as usize].right = y_left;
        if y_left != NIL {
            self.nodes[y_left as usize].parent = x;
        }
        let xp = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.nodes[xp as usize].left == x {
            self.nodes[xp as usize].left = y;
        } else {
            self.nodes[xp as usize].right = y;
        }
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].parent = y;
        self.correct_max(x);
        self.correct_max(y);
    }

    fn rotate_right(&mut self, x: u32) {
        self.push_delta(x);
        let y = self.nodes[x as usize].left;
        self.push_delta(y);
        let y_right = self.nodes[y as usize].right;
        self.nodes[x as usize].left = y_right;
        if y_right != NIL {
            self.nodes[y_right as usize].parent = x;
        }
        let xp = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.nodes[xp as usize].right == x {
            self.nodes[xp as usize].right = y;
        } else {
            self.nodes[xp as usize].left = y;
        }
        self.nodes[y as usize].right = x;
        self.nodes[x as usize].parent = y;
        self.correct_max(x);
        self.correct_max(y);
    }

    // --- insertion ---

    /// Descends from the root looking for the place of the detached slot
    /// `new` (bounds absolute, delta zero, links nil). Returns the node now
    /// carrying the interval: `new` itself after linking and rebalancing, or
    /// an existing node with an equal ordering key to merge into.
    ///
    /// Path nodes found with no surviving marker are appended to `gced`; the
    /// caller removes them once its own bookkeeping is done.
    fn find_or_insert(&mut self, new: u32, gced: &mut Vec<u32>) -> u32 {
        if self.root == NIL {
            self.root = new;
            self.nodes[new as usize].red = false;
            return new;
        }
        let (start, key) = {
            let n = &self.nodes[new as usize];
            (
                n.start,
                TieBreak {
                    end: n.end,
                    anchoring: n.anchoring,
                    layer: n.layer,
                },
            )
        };
        let mut current = self.root;
        loop {
            self.push_delta(current);
            if !self.has_alive_key(current) {
                gced.push(current);
            }
            let (cur_start, cur_key, cur_left, cur_right) = {
                let c = &self.nodes[current as usize];
                (
                    c.start,
                    TieBreak {
                        end: c.end,
                        anchoring: c.anchoring,
                        layer: c.layer,
                    },
                    c.left,
                    c.right,
                )
            };
            let ord = if start != cur_start {
                start.cmp(&cur_start)
            } else {
                (self.tie_break)(&key, &cur_key)
            };
            match ord {
                CmpOrdering::Equal => return current,
                CmpOrdering::Less => {
                    if cur_left == NIL {
                        self.nodes[current as usize].left = new;
                        break;
                    }
                    current = cur_left;
                }
                CmpOrdering::Greater => {
                    if cur_right == NIL {
                        self.nodes[current as usize].right = new;
                        break;
                    }
                    current = cur_right;
                }
            }
        }
        self.nodes[new as usize].parent = current;
        self.correct_max_up(new);
        self.insert_fixup(new);
        new
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while z != self.root && self.is_red(self.nodes[z as usize].parent) {
            let zp = self.nodes[z as usize].parent;
            let zpp = self.nodes[zp as usize].parent;
            if zp == self.nodes[zpp as usize].left {
                let uncle = self.nodes[zpp as usize].right;
                if self.is_red(uncle) {
                    self.nodes[zp as usize].red = false;
                    self.nodes[uncle as usize].red = false;
                    self.nodes[zpp as usize].red = true;
                    z = zpp;
                } else {
                    if z == self.nodes[zp as usize].right {
                        z = zp;
                        self.rotate_left(z);
                    }
                    let zp = self.nodes[z as usize].parent;
                    let zpp = self.nodes[zp as usize].parent;
                    self.nodes[zp as usize].red = false;
                    self.nodes[zpp as usize].red = true;
                    self.rotate_right(zpp);
                }
            } else {
                let uncle = self.nodes[zpp as usize].left;
                if self.is_red(uncle) {
                    self.nodes[zp as usize].red = false;
                    self.nodes[uncle as usize].red = false;
                    self.nodes[zpp as usize].red = true;
                    z = zpp;
                } else {
                    if z == self.nodes[zp as usize].left {
                        z = zp;
                        self.rotate_right(z);
                    }
                    let zp = self.nodes[z as usize].parent;
                    let zpp = self.nodes[zp as usize].parent;
                    self.nodes[zp as usize].red = false;
                    self.nodes[zpp as usize].red = true;
                    self.rotate_left(zpp);
                }
            }
        }
        let root = self.root;
        self.nodes[root as usize].red = false;
    }

    // --- deletion ---

    fn transplant(&mut self, u: u32, v: u32) {
        let up = self.nodes[u as usize].parent;
        if up == NIL {
            self.root = v;
        } else if self.nodes[up as usize].left == u {
            self.nodes[up as usize].left = v;
        } else {
            self.nodes[up as usize].right = v;
        }
        if v != NIL {
            self.nodes[v as usize].parent = up;
        }
    }

    /// Removes `z` from the tree structure. The slot stays allocated, with
    /// its bounds left in absolute form; the caller reuses or releases it.
    fn unlink(&mut self, z: u32) {
        self.push_delta_from_root(z);
        let mut y_red = self.nodes[z as usize].red;
        let x: u32;
        let xp: u32;
        let z_left = self.nodes[z as usize].left;
        let z_right = self.nodes[z as usize].right;
        if z_left == NIL {
            x = z_right;
            xp = self.nodes[z as usize].parent;
            self.transplant(z, z_right);
        } else if z_right == NIL {
            x = z_left;
            xp = self.nodes[z as usize].parent;
            self.transplant(z, z_left);
        } else {
            // In-order successor, pushing deltas on the way down so the
            // relinking below happens in a zero-delta frame.
            let mut y = z_right;
            self.push_delta(y);
            while self.nodes[y as usize].left != NIL {
                y = self.nodes[y as usize].left;
                self.push_delta(y);
            }
            y_red = self.nodes[y as usize].red;
            x = self.nodes[y as usize].right;
            if self.nodes[y as usize].parent == z {
                xp = y;
            } else {
                xp = self.nodes[y as usize].parent;
                self.transplant(y, x);
                let zr = self.nodes[z as usize].right;
                self.nodes[y as usize].right = zr;
                self.nodes[zr as usize].parent = y;
            }
            self.transplant(z, y);
            let zl = self.nodes[z as usize].left;
            self.nodes[y as usize].left = zl;
            self.nodes[zl as usize].parent = y;
            self.nodes[y as usize].red = self.nodes[z as usize].red;
        }
        self.nodes[z as usize].parent = NIL;
        self.nodes[z as usize].left = NIL;
        self.nodes[z as usize].right = NIL;
        self.correct_max_up(xp);
        if !y_red {
            self.delete_fixup(x, xp);
        }
    }

    /// CLRS delete fixup adapted to a nil sentinel: `x` may be `NIL`, so its
    /// parent is threaded through explicitly.
    fn delete_fixup(&mut self, mut x: u32, mut xp: u32) {
        while x != self.root && !self.is_red(x) {
            if xp == NIL {
                break;
            }
            if x == self.nodes[xp as usize].left {
                let mut w = self.nodes[xp as usize].right;
                if w == NIL {
                    break;
                }
                if self.is_red(w) {
                    self.nodes[w as usize].red = false;
                    self.nodes[xp as usize].red = true;
                    self.rotate_left(xp);
                    w = self.nodes[xp as usize].right;
                }
                let (wl, wr) = {
                    let n = &self.nodes[w as usize];
                    (n.left, n.right)
                };
                if !self.is_red(wl) && !self.is_red(wr) {
                    self.nodes[w as usize].red = true;
                    x = xp;
                    xp = self.nodes[x as usize].parent;
                } else {
                    if !self.is_red(wr) {
                        self.nodes[wl as usize].red = false;
                        self.nodes[w as usize].red = true;
                        self.rotate_right(w);
                        w = self.nodes[xp as usize].right;
                    }
                    self.nodes[w as usize].red = self.nodes[xp as usize].red;
                    self.nodes[xp as usize].red = false;
                    let wr = self.nodes[w as usize].right;
                    self.nodes[wr as usize].red = false;
                    self.rotate_left(xp);
                    x = self.root;
                    xp = NIL;
                }
            } else {
                let mut w = self.nodes[xp as usize].left;
                if w == NIL {
                    break;
                }
                if self.is_red(w) {
                    self.nodes[w as usize].red = false;
                    self.nodes[xp as usize].red = true;
                    self.rotate_right(xp);
                    w = self.nodes[xp as usize].left;
                }
                let (wl, wr) = {
                    let n = &self.nodes[w as usize];
                    (n.left, n.right)
                };
                if !self.is_red(wl) && !self.is_red(wr) {
                    self.nodes[w as usize].red = true;
                    x = xp;
                    xp = self.nodes[x as usize].parent;
                } else {
                    if !self.is_red(wl) {
                        self.nodes[wr as usize].red = false;
                        self.nodes[w as usize].red = true;
                        self.rotate_left(w);
                        w = self.nodes[xp as usize].left;
                    }
                    self.nodes[w as usize].red = self.nodes[xp as usize].red;
                    self.nodes[xp as usize].red = false;
                    let wl = self.nodes[w as usize].left;
                    self.nodes[wl as usize].red = false;
                    self.rotate_right(xp);
                    x = self.root;
                    xp = NIL;
                }
            }
        }
        if x != NIL {
            self.nodes[x as usize].red = false;
        }
    }

    fn note_writer(&mut self) {
        if cfg!(debug_assertions) {
            let me = std::thread::current().id();
            match self.writer {
                None => self.writer = Some(me),
                Some(writer) => {
                    debug_assert_eq!(writer, me, "edit hooks must come from a single writer thread")
                }
            }
        }
    }
}

// --- the tree ---------------------------------------------------------------

/// The interval-tracking engine for one document. Shared as `Arc<MarkerTree>`
/// between the text buffer (which feeds it edits) and marker owners.
///
/// One coarse read-write lock guards the structure: queries take a recursive
/// read lock, mutations a write lock. Visitors run under the read lock and
/// must not create or dispose markers, only inspect them.
pub struct MarkerTree {
    inner: RwLock<TreeInner>,
    /// Handles dropped while still attached; drained on every write entry.
    dead_refs: AtomicUsize,
    next_id: AtomicU64,
}

impl MarkerTree {
    pub fn new(doc_len: u64) -> Arc<Self> {
        Self::with_tie_break(doc_len, default_tie_break)
    }

    pub fn with_tie_break(doc_len: u64, tie_break: TieBreakFn) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(TreeInner {
                nodes: Vec::new(),
                free: Vec::new(),
                root: NIL,
                node_count: 0,
                key_count: 0,
                mod_count: 0,
                doc_len,
                pending_edit: None,
                bulk_depth: 0,
                writer: None,
                tie_break,
            }),
            dead_refs: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    /// Creates a marker over `[start, end)`.
    ///
    /// Fails with [`MarkerError::InvalidRange`] when `start > end` or the
    /// range sticks out of the document. Cost: O(log n).
    pub fn create(
        self: &Arc<Self>,
        start: u64,
        end: u64,
        anchoring: Anchoring,
        layer: u16,
    ) -> Result<RangeAnchor, MarkerError> {
        let mut inner = self.inner.write();
        if start > end || end > inner.doc_len {
            return Err(MarkerError::InvalidRange {
                start,
                end,
                doc_len: inner.doc_len,
            });
        }
        self.process_dead_references(&mut inner);
        inner.mod_count += 1;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let core = Arc::new(MarkerCore::new(id, Arc::downgrade(self)));
        self.insert_core(&mut inner, &core, start, end, anchoring, layer);
        self.verify(&mut inner);
        trace!(id, start, end, "marker created");
        Ok(RangeAnchor::from_core(core))
    }

    /// Number of live markers.
    pub fn size(&self) -> usize {
        let inner = self.inner.read_recursive();
        inner
            .key_count
            .saturating_sub(self.dead_refs.load(Ordering::Relaxed))
    }

    /// Number of tree nodes; merged markers share one.
    pub fn node_count(&self) -> usize {
        self.inner.read_recursive().node_count
    }

    pub fn document_length(&self) -> u64 {
        self.inner.read_recursive().doc_len
    }

    /// Resets the tracked document length without reconciling anything.
    /// Used when a tree is first attached to a buffer.
    pub fn set_document_length(&self, len: u64) {
        self.inner.write().doc_len = len;
    }

    /// Applies every pending shift so that all node bounds are absolute.
    /// Idempotent; queries never require it.
    pub fn normalize(&self) {
        let mut inner = self.inner.write();
        let root = inner.root;
        inner.push_all(root);
    }

    /// Detaches every marker and drops all nodes.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.mod_count += 1;
        for node in &mut inner.nodes {
            for weak in node.keys.drain(..) {
                if let Some(core) = weak.upgrade() {
                    core.detach();
                }
            }
        }
        inner.nodes.clear();
        inner.free.clear();
        inner.root = NIL;
        inner.node_count = 0;
        inner.key_count = 0;
        self.dead_refs.store(0, Ordering::Relaxed);
    }

    /// Explicit removal through a tree handle; equivalent to
    /// [`RangeAnchor::dispose`].
    pub fn dispose(&self, anchor: &RangeAnchor) -> bool {
        self.remove(anchor.core())
    }

    // --- queries ---

    /// Visits every marker whose interval touches `[start, end]`, in tree
    /// order. The visitor returns `false` to stop; the call returns `false`
    /// iff the visitor did. Cost: O(log n + k).
    pub fn for_each_overlapping<F>(&self, start: u64, end: u64, mut f: F) -> bool
    where
        F: FnMut(&RangeAnchor) -> bool,
    {
        let inner = self.inner.read_recursive();
        let mod_count = inner.mod_count;
        Self::walk_overlapping(&inner, inner.root, start, end, 0, mod_count, &mut f)
    }

    /// Visits every marker whose interval contains `offset`, half-open: a
    /// marker over `[s, e)` matches when `s <= offset < e`.
    pub fn for_each_containing<F>(&self, offset: u64, mut f: F) -> bool
    where
        F: FnMut(&RangeAnchor) -> bool,
    {
        let inner = self.inner.read_recursive();
        let mod_count = inner.mod_count;
        Self::walk_containing(&inner, inner.root, offset, 0, mod_count, &mut f)
    }

    /// Visits every live marker in tree order.
    pub fn for_each_all<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&RangeAnchor) -> bool,
    {
        let inner = self.inner.read_recursive();
        let mod_count = inner.mod_count;
        Self::walk_all(&inner, inner.root, mod_count, &mut f)
    }

    fn walk_overlapping(
        inner: &TreeInner,
        idx: u32,
        start: u64,
        end: u64,
        delta_up: i64,
        mod_count: u64,
        f: &mut dyn FnMut(&RangeAnchor) -> bool,
    ) -> bool {
        if idx == NIL {
            return true;
        }
        let n = &inner.nodes[idx as usize];
        let delta = delta_up + n.delta;
        if start > offset_by(n.max_end, delta) {
            // everything below ends before the queried range
            return true;
        }
        if !Self::walk_overlapping(inner, n.left, start, end, delta, mod_count, f) {
            return false;
        }
        let s = offset_by(n.start, delta);
        let e = offset_by(n.end, delta);
        if n.valid && s.max(start) <= e.min(end) && !Self::deliver(inner, idx, mod_count, f) {
            return false;
        }
        if end < s {
            // the right subtree starts even later
            return true;
        }
        Self::walk_overlapping(inner, n.right, start, end, delta, mod_count, f)
    }

    fn walk_containing(
        inner: &TreeInner,
        idx: u32,
        offset: u64,
        delta_up: i64,
        mod_count: u64,
        f: &mut dyn FnMut(&RangeAnchor) -> bool,
    ) -> bool {
        if idx == NIL {
            return true;
        }
        let n = &inner.nodes[idx as usize];
        let delta = delta_up + n.delta;
        if offset >= offset_by(n.max_end, delta) {
            return true;
        }
        if !Self::walk_containing(inner, n.left, offset, delta, mod_count, f) {
            return false;
        }
        let s = offset_by(n.start, delta);
        let e = offset_by(n.end, delta);
        if n.valid && s <= offset && offset < e && !Self::deliver(inner, idx, mod_count, f) {
            return false;
        }
        if offset < s {
            return true;
        }
        Self::walk_containing(inner, n.right, offset, delta, mod_count, f)
    }

    fn walk_all(
        inner: &TreeInner,
        idx: u32,
        mod_count: u64,
        f: &mut dyn FnMut(&RangeAnchor) -> bool,
    ) -> bool {
        if idx == NIL {
            return true;
        }
        let n = &inner.nodes[idx as usize];
        let (left, right, valid) = (n.left, n.right, n.valid);
        if !Self::walk_all(inner, left, mod_count, f) {
            return false;
        }
        if valid && !Self::deliver(inner, idx, mod_count, f) {
            return false;
        }
        Self::walk_all(inner, right, mod_count, f)
    }

    fn deliver(
        inner: &TreeInner,
        idx: u32,
        mod_count: u64,
        f: &mut dyn FnMut(&RangeAnchor) -> bool,
    ) -> bool {
        for weak in &inner.nodes[idx as usize].keys {
            if let Some(core) = weak.upgrade() {
                if !f(&RangeAnchor::from_core(core)) {
                    return false;
                }
                if inner.mod_count != mod_count {
                    debug_assert!(false, "tree structure changed during a traversal");
                    error!("tree structure changed during a traversal, aborting the walk");
                    return false;
                }
            }
        }
        true
    }

    // --- edit hooks ---

    /// Must be called before the buffer text changes, strictly paired with
    /// [`MarkerTree::on_after_edit`] for the same edit.
    pub fn on_before_edit(&self, edit: &DocumentEdit) {
        let mut inner = self.inner.write();
        inner.note_writer();
        debug_assert!(
            inner.pending_edit.is_none(),
            "edit hooks must be strictly paired"
        );
        inner.pending_edit = Some(edit.clone());
        self.process_dead_references(&mut inner);
    }

    /// Reconciles every interval with the completed edit.
    pub fn on_after_edit(&self, edit: &DocumentEdit) {
        let guard = self.inner.upgradable_read();
        debug_assert_eq!(
            guard.pending_edit.as_ref(),
            Some(edit),
            "edit hooks must be strictly paired"
        );
        let mut inner = RwLockUpgradableReadGuard::upgrade(guard);
        inner.note_writer();
        inner.pending_edit = None;
        inner.doc_len = if edit.whole_text_replaced {
            edit.new_len
        } else {
            offset_by(inner.doc_len, edit.len_delta())
        };
        if inner.bulk_depth > 0 {
            // reconciliation deferred to the end of the bulk update
            return;
        }
        inner.mod_count += 1;
        if edit.whole_text_replaced {
            let new_len = inner.doc_len;
            self.revalidate_all(&mut inner, new_len);
        } else {
            self.reconcile(&mut inner, edit);
        }
        self.verify(&mut inner);
    }

    /// Suspends per-edit reconciliation until the matching
    /// [`MarkerTree::on_bulk_update_end`]. Nests.
    pub fn on_bulk_update_start(&self) {
        let mut inner = self.inner.write();
        inner.note_writer();
        inner.bulk_depth += 1;
    }

    /// Ends a bulk update. When the outermost one ends, every interval is
    /// revalidated against `new_len` and the tree is normalized.
    pub fn on_bulk_update_end(&self, new_len: u64) {
        let mut inner = self.inner.write();
        inner.note_writer();
        debug_assert!(inner.bulk_depth > 0, "unbalanced bulk update hooks");
        inner.bulk_depth = inner.bulk_depth.saturating_sub(1);
        if inner.bulk_depth > 0 {
            return;
        }
        inner.mod_count += 1;
        inner.doc_len = new_len;
        self.revalidate_all(&mut inner, new_len);
        self.verify(&mut inner);
    }

    // --- handle operations (crate-internal, reached through RangeAnchor) ---

    pub(crate) fn range_of(&self, core: &Arc<MarkerCore>) -> Option<(u64, u64)> {
        let inner = self.inner.read_recursive();
        let idx = inner.resolve(core.node_key())?;
        let mut delta = 0i64;
        let mut i = idx;
        while i != NIL {
            delta += inner.nodes[i as usize].delta;
            i = inner.nodes[i as usize].parent;
        }
        let n = &inner.nodes[idx as usize];
        Some((offset_by(n.start, delta), offset_by(n.end, delta)))
    }

    pub(crate) fn remove(&self, core: &Arc<MarkerCore>) -> bool {
        let mut inner = self.inner.write();
        if inner.resolve(core.node_key()).is_none() {
            return false;
        }
        inner.mod_count += 1;
        self.process_dead_references(&mut inner);
        // The marker has an alive key (the caller holds it), so a purge
        // above cannot have removed its node.
        let Some(idx) = inner.resolve(core.node_key()) else {
            return false;
        };
        let pos = inner.nodes[idx as usize]
            .keys
            .iter()
            .position(|w| w.as_ptr() == Arc::as_ptr(core));
        if let Some(pos) = pos {
            inner.nodes[idx as usize].keys.swap_remove(pos);
            inner.key_count -= 1;
        }
        core.detach();
        if !inner.has_alive_key(idx) {
            self.delete_node(&mut inner, idx);
        }
        self.verify(&mut inner);
        trace!(id = core.id(), "marker disposed");
        true
    }

    pub(crate) fn change_bounds(
        &self,
        core: &Arc<MarkerCore>,
        start: u64,
        end: u64,
        anchoring: Anchoring,
        layer: u16,
    ) -> bool {
        let mut inner = self.inner.write();
        if start > end || end > inner.doc_len {
            return false;
        }
        let Some(idx) = inner.resolve(core.node_key()) else {
            return false;
        };
        inner.mod_count += 1;
        // The marker has an alive key (the caller holds it), so a purge
        // here cannot remove its node or relocate its slot.
        self.process_dead_references(&mut inner);
        let pos = inner.nodes[idx as usize]
            .keys
            .iter()
            .position(|w| w.as_ptr() == Arc::as_ptr(core));
        if let Some(pos) = pos {
            inner.nodes[idx as usize].keys.swap_remove(pos);
            inner.key_count -= 1;
        }
        core.detach();
        if !inner.has_alive_key(idx) {
            self.delete_node(&mut inner, idx);
        }
        self.insert_core(&mut inner, core, start, end, anchoring, layer);
        self.verify(&mut inner);
        trace!(id = core.id(), start, end, "marker moved");
        true
    }

    pub(crate) fn note_dead_reference(&self) {
        self.dead_refs.fetch_add(1, Ordering::Relaxed);
    }

    // --- internals ---

    fn forget_dead(&self, n: usize) {
        if n > 0 {
            // saturating: a handle pruned here may not have run its Drop yet
            let _ = self
                .dead_refs
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(n))
                });
        }
    }

    /// Attaches `core` to the tree at `[start, end)`, merging into an
    /// existing node when the ordering key matches.
    fn insert_core(
        &self,
        inner: &mut TreeInner,
        core: &Arc<MarkerCore>,
        start: u64,
        end: u64,
        anchoring: Anchoring,
        layer: u16,
    ) {
        let idx = inner.alloc(start, end, anchoring, layer);
        let mut gced = Vec::new();
        let target = inner.find_or_insert(idx, &mut gced);
        let merged = target != idx;
        if merged {
            inner.release(idx);
        }
        let generation = inner.nodes[target as usize].generation;
        inner.nodes[target as usize].keys.push(Arc::downgrade(core));
        inner.key_count += 1;
        core.set_node(pack(target, generation));
        if !merged {
            for g in gced {
                self.delete_node(inner, g);
            }
        }
    }

    /// Removes a node from the tree, detaching alive markers (they become
    /// invalid) and accounting for dead ones.
    fn delete_node(&self, inner: &mut TreeInner, idx: u32) {
        let keys = std::mem::take(&mut inner.nodes[idx as usize].keys);
        let mut dead = 0usize;
        for weak in &keys {
            match weak.upgrade() {
                Some(core) => core.detach(),
                None => dead += 1,
            }
        }
        inner.key_count -= keys.len();
        inner.unlink(idx);
        inner.release(idx);
        self.forget_dead(dead);
    }

    /// Detaches and discards every marker of a node without touching the
    /// tree structure.
    fn invalidate_keys(&self, inner: &mut TreeInner, idx: u32) {
        let keys = std::mem::take(&mut inner.nodes[idx as usize].keys);
        let mut dead = 0usize;
        for weak in &keys {
            match weak.upgrade() {
                Some(core) => core.detach(),
                None => dead += 1,
            }
        }
        inner.key_count -= keys.len();
        self.forget_dead(dead);
    }

    /// Moves the surviving markers of the detached slot `from` onto the
    /// in-tree node `to`, repointing their handles.
    fn adopt_keys(&self, inner: &mut TreeInner, from: u32, to: u32) {
        let keys = std::mem::take(&mut inner.nodes[from as usize].keys);
        let generation = inner.nodes[to as usize].generation;
        let mut dead = 0usize;
        for weak in keys {
            match weak.upgrade() {
                Some(core) => {
                    core.set_node(pack(to, generation));
                    inner.nodes[to as usize].keys.push(weak);
                }
                None => dead += 1,
            }
        }
        inner.key_count -= dead;
        self.forget_dead(dead);
    }

    // --- garbage handling ---

    /// Drains the dead-handle counter and sweeps once it exceeds a third of
    /// the live size. Called on every write entry point.
    fn process_dead_references(&self, inner: &mut TreeInner) {
        let dead = self.dead_refs.load(Ordering::Relaxed);
        let size = inner.key_count.saturating_sub(dead);
        if dead > 1.max(size / 3) {
            self.purge_dead_nodes(inner);
        }
    }

    fn purge_dead_nodes(&self, inner: &mut TreeInner) {
        let mut doomed = Vec::new();
        let mut pruned = 0usize;
        let root = inner.root;
        Self::collect_dead(inner, root, &mut doomed, &mut pruned);
        let emptied = doomed.len();
        for idx in doomed {
            // slot indices stay stable across removals
            self.delete_node(inner, idx);
        }
        self.forget_dead(pruned);
        if pruned > 0 || emptied > 0 {
            debug!(pruned, emptied, "purged dead markers");
        }
    }

    /// Prunes dead keys everywhere and collects nodes left without any.
    fn collect_dead(inner: &mut TreeInner, idx: u32, doomed: &mut Vec<u32>, pruned: &mut usize) {
        if idx == NIL {
            return;
        }
        let (left, right) = {
            let n = &inner.nodes[idx as usize];
            (n.left, n.right)
        };
        let node = &mut inner.nodes[idx as usize];
        let before = node.keys.len();
        node.keys.retain(|w| w.strong_count() > 0);
        let removed = before - node.keys.len();
        *pruned += removed;
        inner.key_count -= removed;
        if inner.nodes[idx as usize].keys.is_empty() {
            doomed.push(idx);
        }
        Self::collect_dead(inner, left, doomed, pruned);
        Self::collect_dead(inner, right, doomed, pruned);
    }

    // --- edit reconciliation ---

    fn reconcile(&self, inner: &mut TreeInner, edit: &DocumentEdit) {
        let start = edit.offset;
        let end = edit.old_end();
        let len_delta = edit.len_delta();
        let mut affected = Vec::new();
        let root = inner.root;
        Self::collect_affected(inner, root, start, end, len_delta, &mut affected);
        if affected.is_empty() {
            return;
        }
        // Phase one left every affected node with pre-edit absolute bounds.
        // Pull them out of the tree, then reapply each one.
        for &idx in affected.iter().rev() {
            inner.unlink(idx);
            let n = &mut inner.nodes[idx as usize];
            n.delta = 0;
        }
        let mut placed: Vec<(u32, u64)> = Vec::new();
        for &idx in &affected {
            if !inner.has_alive_key(idx) {
                self.invalidate_keys(inner, idx);
                inner.release(idx);
                continue;
            }
            let (old_start, old_end, anchoring) = {
                let n = &inner.nodes[idx as usize];
                (n.start, n.end, n.anchoring)
            };
            match edit.update_range(old_start, old_end, anchoring) {
                Some((new_start, new_end)) => {
                    let span = old_end - old_start;
                    self.reinsert(inner, idx, new_start, new_end, span, &mut placed);
                }
                None => {
                    trace!(old_start, old_end, "interval swallowed by edit");
                    self.invalidate_keys(inner, idx);
                    inner.release(idx);
                }
            }
        }
    }

    /// Phase one of reconciliation: shift subtrees entirely right of the
    /// edited range in O(1) via their deltas, skip subtrees entirely left of
    /// it, and gather everything touching `[start, end]` with pre-edit
    /// bounds, in interval order.
    fn collect_affected(
        inner: &mut TreeInner,
        idx: u32,
        start: u64,
        end: u64,
        len_delta: i64,
        affected: &mut Vec<u32>,
    ) {
        if idx == NIL {
            return;
        }
        inner.push_delta(idx);
        let (n_start, n_end, n_max, left, right) = {
            let n = &inner.nodes[idx as usize];
            (n.start, n.end, n.max_end, n.left, n.right)
        };
        if end < n_start {
            // This node and its right subtree sit wholly after the edit:
            // shift them in one step, undo the shift for the left subtree.
            inner.nodes[idx as usize].delta += len_delta;
            inner.push_delta(idx);
            if left != NIL {
                inner.nodes[left as usize].delta -= len_delta;
            }
            Self::collect_affected(inner, left, start, end, len_delta, affected);
            inner.correct_max(idx);
        } else if start > n_max {
            // every interval below ends before the edit
        } else {
            Self::collect_affected(inner, left, start, end, len_delta, affected);
            if n_start.max(start) <= n_end.min(end) {
                affected.push(idx);
            }
            Self::collect_affected(inner, right, start, end, len_delta, affected);
            inner.correct_max(idx);
        }
    }

    /// Phase two: put a detached slot back with its post-edit bounds. A
    /// collision with an interval placed earlier in this pass keeps the one
    /// with the larger pre-edit span; equal spans merge.
    fn reinsert(
        &self,
        inner: &mut TreeInner,
        idx: u32,
        new_start: u64,
        new_end: u64,
        pre_span: u64,
        placed: &mut Vec<(u32, u64)>,
    ) {
        {
            let n = &mut inner.nodes[idx as usize];
            n.start = new_start;
            n.end = new_end;
            n.delta = 0;
            n.max_end = new_end;
            n.red = true;
        }
        let mut gced = Vec::new();
        let target = inner.find_or_insert(idx, &mut gced);
        if target == idx {
            placed.push((idx, pre_span));
            for g in gced {
                self.delete_node(inner, g);
            }
            return;
        }
        let prior = placed.iter().position(|&(node, _)| node == target);
        let prior_span = match prior {
            Some(p) => placed[p].1,
            None => {
                let n = &inner.nodes[target as usize];
                n.end - n.start
            }
        };
        if pre_span > prior_span {
            trace!(new_start, new_end, "duplicate interval, larger span wins");
            self.invalidate_keys(inner, target);
            self.adopt_keys(inner, idx, target);
            match prior {
                Some(p) => placed[p].1 = pre_span,
                None => placed.push((target, pre_span)),
            }
        } else {
            if pre_span < prior_span {
                trace!(new_start, new_end, "duplicate interval, smaller span dropped");
                self.invalidate_keys(inner, idx);
            }
            self.adopt_keys(inner, idx, target);
        }
        inner.release(idx);
    }

    /// Whole-document revalidation: normalize, then invalidate every
    /// interval that no longer fits `[0, new_len]`. Survivors keep their
    /// offsets.
    fn revalidate_all(&self, inner: &mut TreeInner, new_len: u64) {
        let root = inner.root;
        inner.push_all(root);
        let mut doomed = Vec::new();
        Self::collect_out_of_bounds(inner, root, new_len, &mut doomed);
        for idx in doomed {
            self.delete_node(inner, idx);
        }
    }

    fn collect_out_of_bounds(inner: &TreeInner, idx: u32, new_len: u64, doomed: &mut Vec<u32>) {
        if idx == NIL {
            return;
        }
        let n = &inner.nodes[idx as usize];
        if n.max_end <= new_len {
            return;
        }
        if n.end > new_len {
            doomed.push(idx);
        }
        Self::collect_out_of_bounds(inner, n.left, new_len, doomed);
        Self::collect_out_of_bounds(inner, n.right, new_len, doomed);
    }

    // --- verification ---

    /// Full structure check: ordering, max_end, red-black shape, counters.
    /// Panics in tests; in a `verify` build it logs and isolates offending
    /// nodes by invalidating their markers.
    fn verify(&self, inner: &mut TreeInner) {
        if !VERIFY {
            return;
        }
        let mut stats = VerifyStats::default();
        let mut bad = Vec::new();
        Self::verify_node(inner, inner.root, NIL, 0, &mut stats, &mut bad);
        debug_assert!(bad.is_empty(), "invariant violations at nodes {bad:?}");
        debug_assert_eq!(stats.nodes, inner.node_count, "node counter drift");
        debug_assert_eq!(stats.keys, inner.key_count, "key counter drift");
        for idx in bad {
            error!(node = idx, "interval tree invariant violated, isolating the node");
            self.invalidate_keys(inner, idx);
            inner.nodes[idx as usize].valid = false;
        }
    }

    /// Returns `(min_start, max_start, max_end, black_height)` of the
    /// subtree, all absolute; `None` bounds for an empty subtree.
    fn verify_node(
        inner: &TreeInner,
        idx: u32,
        parent: u32,
        delta_up: i64,
        stats: &mut VerifyStats,
        bad: &mut Vec<u32>,
    ) -> (Option<(u64, u64)>, u64, u32) {
        if idx == NIL {
            return (None, 0, 1);
        }
        let n = &inner.nodes[idx as usize];
        stats.nodes += 1;
        stats.keys += n.keys.len();
        debug_assert_eq!(n.parent, parent, "broken parent link");
        let delta = delta_up + n.delta;
        let s = offset_by(n.start, delta);
        let e = offset_by(n.end, delta);
        let (l_bounds, l_max, l_bh) = Self::verify_node(inner, n.left, idx, delta, stats, bad);
        let (r_bounds, r_max, r_bh) = Self::verify_node(inner, n.right, idx, delta, stats, bad);
        let mut ok = s <= e;
        if let Some((_, l_max_start)) = l_bounds {
            ok &= l_max_start <= s;
        }
        if let Some((r_min_start, _)) = r_bounds {
            ok &= r_min_start >= s;
        }
        ok &= offset_by(n.max_end, delta) == l_max.max(r_max).max(e);
        if n.red {
            debug_assert!(
                !inner.is_red(n.left) && !inner.is_red(n.right),
                "red node with a red child"
            );
        }
        debug_assert_eq!(l_bh, r_bh, "unbalanced black height");
        if !ok {
            bad.push(idx);
        }
        let min_start = l_bounds.map_or(s, |(min, _)| min.min(s));
        let max_start = r_bounds.map_or(s, |(_, max)| max.max(s));
        (
            Some((min_start, max_start)),
            l_max.max(r_max).max(e),
            l_bh + u32::from(!n.red),
        )
    }
}

#[derive(Default)]
struct VerifyStats {
    nodes: usize,
    keys: usize,
}

impl std::fmt::Debug for MarkerTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read_recursive();
        f.debug_struct("MarkerTree")
            .field("nodes", &inner.node_count)
            .field("keys", &inner.key_count)
            .field("doc_len", &inner.doc_len)
            .finish()
    }
}
