//! Randomized checks: the tree must agree with a flat per-marker model
//! under arbitrary edit sequences.

mod common;

use std::sync::Arc;

use marker_tree::{Anchoring, DocumentEdit, MarkerTree, RangeAnchor};
use proptest::prelude::*;

const DOC_LEN: u64 = 200;

#[derive(Debug, Clone)]
struct Edit {
    offset: u64,
    old_len: u64,
    new_len: u64,
}

fn arb_edit() -> impl Strategy<Value = Edit> {
    (0..DOC_LEN, 0..40u64, 0..40u64).prop_map(|(offset, old_len, new_len)| Edit {
        offset,
        old_len,
        new_len,
    })
}

fn arb_span() -> impl Strategy<Value = (u64, u64)> {
    (0..DOC_LEN, 0..DOC_LEN).prop_map(|(a, b)| (a.min(b), a.max(b)))
}

fn arb_anchoring() -> impl Strategy<Value = Anchoring> {
    (any::<bool>(), any::<bool>()).prop_map(|(greedy_left, greedy_right)| Anchoring {
        greedy_left,
        greedy_right,
        sticky_right: false,
    })
}

/// Applies `edit` to each entry of the flat model, exactly the way a tree
/// node reconciles.
fn advance_model(model: &mut [Option<(u64, u64)>], anchorings: &[Anchoring], edit: &DocumentEdit) {
    for (slot, anchoring) in model.iter_mut().zip(anchorings) {
        if let Some((s, e)) = *slot {
            *slot = edit.update_range(s, e, *anchoring);
        }
    }
}

/// A marker the tree invalidated may still have model bounds when another
/// marker with the same anchoring landed on the same interval: only one of
/// the pair survives the collision. Identical intervals with identical
/// anchoring evolve identically afterwards, so accepting the collision once
/// keeps the rest of the comparison exact.
fn check_against_model(
    handles: &[RangeAnchor],
    model: &[Option<(u64, u64)>],
    anchorings: &[Anchoring],
) {
    for (i, handle) in handles.iter().enumerate() {
        let actual = handle.range();
        let expected = model[i];
        if actual == expected {
            continue;
        }
        assert!(
            actual.is_none() && expected.is_some(),
            "marker {i}: tree has {actual:?}, model has {expected:?}"
        );
        let collided = model.iter().zip(anchorings).enumerate().any(|(j, (m, a))| {
            j != i && *m == expected && *a == anchorings[i] && handles[j].is_valid()
        });
        assert!(
            collided,
            "marker {i} invalidated without a collision, model has {expected:?}"
        );
    }
}

fn apply(tree: &Arc<MarkerTree>, doc_len: &mut u64, edit: &Edit) -> Option<DocumentEdit> {
    // clamp to the current document and skip no-ops
    if edit.offset > *doc_len {
        return None;
    }
    let old_len = edit.old_len.min(*doc_len - edit.offset);
    if old_len == 0 && edit.new_len == 0 {
        return None;
    }
    let edit = DocumentEdit::replace(edit.offset, old_len, edit.new_len);
    tree.on_before_edit(&edit);
    tree.on_after_edit(&edit);
    *doc_len = *doc_len - old_len + edit.new_len;
    Some(edit)
}

proptest! {
    #[test]
    fn prop_edits_match_flat_model(
        spans in proptest::collection::vec(arb_span(), 1..40),
        edits in proptest::collection::vec(arb_edit(), 0..25),
    ) {
        common::tracing::init_tracing_from_env();
        let tree = MarkerTree::new(DOC_LEN);
        let anchorings = vec![Anchoring::default(); spans.len()];
        let handles: Vec<_> = spans
            .iter()
            .map(|&(s, e)| tree.create(s, e, Anchoring::default(), 0).unwrap())
            .collect();
        let mut model: Vec<_> = spans.iter().map(|&span| Some(span)).collect();

        let mut doc_len = DOC_LEN;
        for edit in &edits {
            if let Some(applied) = apply(&tree, &mut doc_len, edit) {
                advance_model(&mut model, &anchorings, &applied);
            }
            prop_assert_eq!(tree.document_length(), doc_len);
        }
        check_against_model(&handles, &model, &anchorings);
    }

    #[test]
    fn prop_edits_match_flat_model_mixed_anchoring(
        spans in proptest::collection::vec((arb_span(), arb_anchoring()), 1..40),
        edits in proptest::collection::vec(arb_edit(), 0..25),
    ) {
        common::tracing::init_tracing_from_env();
        let tree = MarkerTree::new(DOC_LEN);
        let anchorings: Vec<_> = spans.iter().map(|&(_, a)| a).collect();
        let handles: Vec<_> = spans
            .iter()
            .map(|&((s, e), a)| tree.create(s, e, a, 0).unwrap())
            .collect();
        let mut model: Vec<_> = spans.iter().map(|&(span, _)| Some(span)).collect();

        let mut doc_len = DOC_LEN;
        for edit in &edits {
            if let Some(applied) = apply(&tree, &mut doc_len, edit) {
                advance_model(&mut model, &anchorings, &applied);
            }
        }
        check_against_model(&handles, &model, &anchorings);
    }

    #[test]
    fn prop_queries_match_brute_force_after_edits(
        spans in proptest::collection::vec(arb_span(), 1..40),
        edits in proptest::collection::vec(arb_edit(), 0..25),
        windows in proptest::collection::vec(arb_span(), 1..8),
    ) {
        common::tracing::init_tracing_from_env();
        let tree = MarkerTree::new(DOC_LEN);
        let handles: Vec<_> = spans
            .iter()
            .map(|&(s, e)| tree.create(s, e, Anchoring::default(), 0).unwrap())
            .collect();
        let mut doc_len = DOC_LEN;
        for edit in &edits {
            apply(&tree, &mut doc_len, edit);
        }

        for &(qs, qe) in &windows {
            let mut expected: Vec<(u64, u64)> = handles
                .iter()
                .filter_map(|h| h.range())
                .filter(|&(s, e)| s.max(qs) <= e.min(qe))
                .collect();
            expected.sort_unstable();
            let mut actual = Vec::new();
            tree.for_each_overlapping(qs, qe, |m| {
                actual.push(m.range().unwrap());
                true
            });
            actual.sort_unstable();
            prop_assert_eq!(actual, expected);
        }
    }
}

// --- deterministic large-scale sweep ---

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

#[test]
fn test_large_tree_survives_an_edit_storm() {
    common::tracing::init_tracing_from_env();
    let mut rng = XorShift(0x9e3779b97f4a7c15);
    let mut doc_len: u64 = 100_000;
    let tree = MarkerTree::new(doc_len);

    let mut handles = Vec::new();
    let mut model = Vec::new();
    for _ in 0..3000 {
        let a = rng.below(doc_len);
        let b = rng.below(doc_len);
        let (s, e) = (a.min(b), a.max(b));
        handles.push(tree.create(s, e, Anchoring::default(), 0).unwrap());
        model.push(Some((s, e)));
    }
    let anchorings = vec![Anchoring::default(); handles.len()];

    for _ in 0..100 {
        let offset = rng.below(doc_len + 1);
        let old_len = rng.below(2000).min(doc_len - offset);
        let new_len = rng.below(2000);
        if old_len == 0 && new_len == 0 {
            continue;
        }
        let edit = DocumentEdit::replace(offset, old_len, new_len);
        tree.on_before_edit(&edit);
        tree.on_after_edit(&edit);
        doc_len = doc_len - old_len + new_len;
        assert_eq!(tree.document_length(), doc_len);
    }

    // replay the same edit stream against the flat model
    let mut replay = XorShift(0x9e3779b97f4a7c15);
    let mut replay_len: u64 = 100_000;
    for _ in 0..3000 {
        replay.below(replay_len);
        replay.below(replay_len);
    }
    for _ in 0..100 {
        let offset = replay.below(replay_len + 1);
        let old_len = replay.below(2000).min(replay_len - offset);
        let new_len = replay.below(2000);
        if old_len == 0 && new_len == 0 {
            continue;
        }
        let edit = DocumentEdit::replace(offset, old_len, new_len);
        for slot in model.iter_mut() {
            if let Some((s, e)) = *slot {
                *slot = edit.update_range(s, e, Anchoring::default());
            }
        }
        replay_len = replay_len - old_len + new_len;
    }
    assert_eq!(replay_len, doc_len);

    // per-marker agreement, tolerating duplicate-interval collisions
    let mut invalid_with_bounds = 0usize;
    for (i, handle) in handles.iter().enumerate() {
        let actual = handle.range();
        if actual == model[i] {
            continue;
        }
        assert!(actual.is_none() && model[i].is_some());
        let collided = model
            .iter()
            .enumerate()
            .any(|(j, m)| j != i && *m == model[i] && handles[j].is_valid());
        assert!(collided, "marker {i} invalidated without a collision");
        invalid_with_bounds += 1;
    }
    assert_eq!(
        tree.size(),
        handles.iter().filter(|h| h.is_valid()).count()
    );

    // queries agree with a brute-force scan over the live handles
    for _ in 0..20 {
        let a = rng.below(doc_len + 1);
        let b = rng.below(doc_len + 1);
        let (qs, qe) = (a.min(b), a.max(b));
        let mut expected: Vec<(u64, u64)> = handles
            .iter()
            .filter_map(|h| h.range())
            .filter(|&(s, e)| s.max(qs) <= e.min(qe))
            .collect();
        expected.sort_unstable();
        let mut actual = Vec::new();
        tree.for_each_overlapping(qs, qe, |m| {
            actual.push(m.range().unwrap());
            true
        });
        actual.sort_unstable();
        assert_eq!(actual, expected);
    }

    // normalizing pushes every pending shift without moving anything
    let before: Vec<_> = handles.iter().map(|h| h.range()).collect();
    tree.normalize();
    let after: Vec<_> = handles.iter().map(|h| h.range()).collect();
    assert_eq!(before, after);

    tracing::debug!(
        live = tree.size(),
        collided = invalid_with_bounds,
        "edit storm finished"
    );
}
