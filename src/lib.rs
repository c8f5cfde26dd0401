//! Live interval tracking for text documents.
//!
//! The crate keeps a set of `[start, end)` intervals continuously consistent
//! with a mutating text buffer: folds, selections, inline widgets and
//! highlights all anchor themselves here and survive arbitrary edits without
//! anyone re-scanning the document.
//!
//! The core is an augmented red-black interval tree ([`MarkerTree`]) with two
//! tricks borrowed from production editors: lazy subtree shifts, so an edit
//! moves "everything to the right" in O(log n) rather than O(n), and weakly
//! held marker handles, so simply dropping a [`RangeAnchor`] is enough to
//! retire its interval.
//!
//! ```
//! use marker_tree::{Anchoring, MarkerTree, TextBuffer};
//!
//! let mut buffer = TextBuffer::new("hello world");
//! let tree = MarkerTree::new(0);
//! buffer.attach(&tree);
//!
//! let word = tree.create(6, 11, Anchoring::default(), 0).unwrap();
//! buffer.insert(0, "say: ").unwrap();
//! assert_eq!(word.range(), Some((11, 16)));
//! ```

pub mod buffer;
pub mod edit;
pub mod error;
pub mod marker;
pub mod tree;

pub use buffer::TextBuffer;
pub use edit::DocumentEdit;
pub use error::MarkerError;
pub use marker::{
    Anchoring, FoldRegion, Highlighter, InlayAnchor, MarkerId, RangeAnchor, SelectionAnchor,
};
pub use tree::{default_tie_break, MarkerTree, TieBreak, TieBreakFn};
