//! Document edit events and the range adjustment rules.
//!
//! A [`DocumentEdit`] is the only perturbation the engine reacts to: one
//! contiguous replacement described by `(offset, old_len, new_len)`. The
//! adjustment rules here are pure functions from an interval plus its
//! anchoring flags to the interval's post-edit bounds (or `None` when the
//! edit swallows it). The tree applies them during reconciliation; keeping
//! them free of tree state makes the tricky boundary cases unit-testable in
//! isolation.

use crate::marker::Anchoring;

/// One buffer replacement: `old_len` bytes at `offset` become `new_len` bytes.
///
/// Insertions have `old_len == 0`, deletions `new_len == 0`. A whole-text
/// replacement sets `whole_text_replaced` and bypasses incremental
/// reconciliation entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEdit {
    pub offset: u64,
    pub old_len: u64,
    pub new_len: u64,
    pub whole_text_replaced: bool,
}

impl DocumentEdit {
    /// An insertion of `len` bytes at `offset`.
    pub fn insert(offset: u64, len: u64) -> Self {
        Self::replace(offset, 0, len)
    }

    /// A deletion of `len` bytes at `offset`.
    pub fn delete(offset: u64, len: u64) -> Self {
        Self::replace(offset, len, 0)
    }

    /// A replacement of `old_len` bytes at `offset` by `new_len` bytes.
    pub fn replace(offset: u64, old_len: u64, new_len: u64) -> Self {
        Self {
            offset,
            old_len,
            new_len,
            whole_text_replaced: false,
        }
    }

    /// The entire buffer content (`old_len` bytes) replaced by `new_len` bytes.
    pub fn replace_all(old_len: u64, new_len: u64) -> Self {
        Self {
            offset: 0,
            old_len,
            new_len,
            whole_text_replaced: true,
        }
    }

    /// End of the replaced range in pre-edit coordinates.
    pub fn old_end(&self) -> u64 {
        self.offset + self.old_len
    }

    /// End of the inserted text in post-edit coordinates.
    pub fn new_end(&self) -> u64 {
        self.offset + self.new_len
    }

    /// Net length change of the buffer.
    pub fn len_delta(&self) -> i64 {
        self.new_len as i64 - self.old_len as i64
    }

    /// Computes the post-edit bounds of `[start, end)`, or `None` when the
    /// interval is swallowed by the edit and must be invalidated.
    ///
    /// The rules, evaluated against the replaced range `[offset, old_end)`:
    /// 1. edit wholly after the interval (or touching its end without
    ///    right-greediness): unchanged;
    /// 2. edit wholly before (or touching the start without left-greediness):
    ///    both bounds shift by the length delta;
    /// 3. edit strictly inside: start kept, end absorbs the delta;
    /// 4. interval swallowed: invalidated (zero-length special cases live in
    ///    `update_point`);
    /// 5. prefix/suffix replaced: the surviving bound is clipped to the new
    ///    text's end, or to `offset`, respectively.
    ///
    /// The order of the checks matters: a boundary shared between the edit
    /// and the interval is claimed by the earliest applicable rule, which is
    /// where the greedy flags get their say.
    pub fn update_range(&self, start: u64, end: u64, anchoring: Anchoring) -> Option<(u64, u64)> {
        debug_assert!(start <= end);
        if start == end {
            return self.update_point(start, anchoring);
        }
        let offset = self.offset;
        let old_end = self.old_end();
        let delta = self.len_delta();

        // 1. changes after the end
        if end < offset || (!anchoring.greedy_right && end == offset) {
            return Some((start, end));
        }
        // 2. changes before the start
        if start > old_end || (!anchoring.greedy_left && start == old_end) {
            return Some((offset_by(start, delta), offset_by(end, delta)));
        }
        // 3. changes inside the interval
        if start <= offset && end >= old_end {
            return Some((start, offset_by(end, delta)));
        }
        // 5a. prefix of the interval replaced
        if start >= offset && start <= old_end && end > old_end {
            return Some((self.new_end(), offset_by(end, delta)));
        }
        // 5b. suffix of the interval replaced
        if end >= offset && end <= old_end && start < offset {
            return Some((start, offset));
        }
        // 4. swallowed
        None
    }

    /// Zero-length variant of [`update_range`](Self::update_range).
    ///
    /// A point strictly inside the replaced range dies. Insertion exactly at
    /// the point is the ambiguous case: a right-greedy point grows over the
    /// inserted text (this is how an empty guarded region becomes a real span
    /// once text is typed into it), a sticky-right point rides to the end of
    /// the insertion, and a plain point stays put.
    fn update_point(&self, point: u64, anchoring: Anchoring) -> Option<(u64, u64)> {
        let offset = self.offset;
        let old_end = self.old_end();

        if offset < point && point < old_end {
            return None;
        }
        if point == offset && self.old_len == 0 {
            if anchoring.greedy_right {
                return Some((point, point + self.new_len));
            }
            if anchoring.sticky_right {
                let moved = point + self.new_len;
                return Some((moved, moved));
            }
        }
        if point > old_end || (point == old_end && self.old_len > 0) {
            let moved = offset_by(point, self.len_delta());
            return Some((moved, moved));
        }
        Some((point, point))
    }
}

/// Applies a signed shift to an offset. Callers only shift offsets that are
/// at or past the edited range, so the result never goes below zero.
pub(crate) fn offset_by(offset: u64, delta: i64) -> u64 {
    debug_assert!(offset as i64 + delta >= 0);
    (offset as i64 + delta) as u64
}
