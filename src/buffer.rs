//! A minimal text buffer that feeds edits to marker trees.
//!
//! The buffer owns the document string and a list of weak consumer trees.
//! Every mutation is a single contiguous replacement; the buffer validates
//! it, announces it to each live tree with [`MarkerTree::on_before_edit`],
//! applies it, then closes with [`MarkerTree::on_after_edit`], in attach
//! order. Holding `&mut self` through the whole sequence is what guarantees
//! the trees see exactly one edit at a time.

use std::sync::{Arc, Weak};

use tracing::trace;

use crate::edit::DocumentEdit;
use crate::error::MarkerError;
use crate::tree::MarkerTree;

pub struct TextBuffer {
    text: String,
    trees: Vec<Weak<MarkerTree>>,
    bulk: bool,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            trees: Vec::new(),
            bulk: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.text.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Registers a tree to receive every subsequent edit and syncs its
    /// document length. Dropped trees are pruned on the next edit.
    pub fn attach(&mut self, tree: &Arc<MarkerTree>) {
        tree.set_document_length(self.len());
        self.trees.push(Arc::downgrade(tree));
    }

    /// Replaces `old_len` bytes at `offset` with `replacement`.
    pub fn replace(
        &mut self,
        offset: u64,
        old_len: u64,
        replacement: &str,
    ) -> Result<(), MarkerError> {
        let start = offset as usize;
        let end = start
            .checked_add(old_len as usize)
            .filter(|&end| end <= self.text.len())
            .ok_or(MarkerError::EditOutOfBounds {
                offset: start,
                old_len: old_len as usize,
                len: self.text.len(),
            })?;
        for boundary in [start, end] {
            if !self.text.is_char_boundary(boundary) {
                return Err(MarkerError::NotCharBoundary { offset: boundary });
            }
        }
        let edit = DocumentEdit::replace(offset, old_len, replacement.len() as u64);
        self.fire_before(&edit);
        self.text.replace_range(start..end, replacement);
        self.fire_after(&edit);
        Ok(())
    }

    pub fn insert(&mut self, offset: u64, text: &str) -> Result<(), MarkerError> {
        self.replace(offset, 0, text)
    }

    pub fn delete(&mut self, offset: u64, len: u64) -> Result<(), MarkerError> {
        self.replace(offset, len, "")
    }

    /// Swaps the whole document. Markers are revalidated against the new
    /// length instead of reconciled edit by edit.
    pub fn set_text(&mut self, text: &str) {
        let edit = DocumentEdit::replace_all(self.len(), text.len() as u64);
        self.fire_before(&edit);
        self.text.clear();
        self.text.push_str(text);
        self.fire_after(&edit);
    }

    /// Starts a bulk update: per-edit marker reconciliation is suspended
    /// until [`TextBuffer::end_bulk_update`], which revalidates everything
    /// in one pass. Worth it when the number of edits rivals the number of
    /// markers.
    pub fn begin_bulk_update(&mut self) {
        if self.bulk {
            return;
        }
        self.bulk = true;
        trace!("bulk update started");
        self.for_each_tree(|tree| tree.on_bulk_update_start());
    }

    pub fn end_bulk_update(&mut self) {
        if !self.bulk {
            return;
        }
        self.bulk = false;
        let len = self.len();
        trace!(len, "bulk update finished");
        self.for_each_tree(|tree| tree.on_bulk_update_end(len));
    }

    fn fire_before(&mut self, edit: &DocumentEdit) {
        self.trees.retain(|weak| weak.strong_count() > 0);
        if self.bulk {
            return;
        }
        self.for_each_tree(|tree| tree.on_before_edit(edit));
    }

    fn fire_after(&mut self, edit: &DocumentEdit) {
        if self.bulk {
            return;
        }
        self.for_each_tree(|tree| tree.on_after_edit(edit));
    }

    fn for_each_tree(&self, mut f: impl FnMut(&Arc<MarkerTree>)) {
        for weak in &self.trees {
            if let Some(tree) = weak.upgrade() {
                f(&tree);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_validates_bounds() {
        let mut buffer = TextBuffer::new("hello");
        assert!(matches!(
            buffer.replace(3, 10, "x"),
            Err(MarkerError::EditOutOfBounds { .. })
        ));
        assert!(matches!(
            buffer.replace(6, 0, "x"),
            Err(MarkerError::EditOutOfBounds { .. })
        ));
        assert_eq!(buffer.text(), "hello");
    }

    #[test]
    fn test_replace_rejects_split_code_points() {
        let mut buffer = TextBuffer::new("héllo");
        // the é spans bytes 1..3
        assert!(matches!(
            buffer.replace(2, 0, "x"),
            Err(MarkerError::NotCharBoundary { offset: 2 })
        ));
        assert!(buffer.replace(1, 2, "e").is_ok());
        assert_eq!(buffer.text(), "hello");
    }

    #[test]
    fn test_edit_conveniences() {
        let mut buffer = TextBuffer::new("abcdef");
        buffer.insert(3, "XY").unwrap();
        assert_eq!(buffer.text(), "abcXYdef");
        buffer.delete(0, 3).unwrap();
        assert_eq!(buffer.text(), "XYdef");
        buffer.set_text("fresh");
        assert_eq!(buffer.text(), "fresh");
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_attach_syncs_document_length() {
        let mut buffer = TextBuffer::new("0123456789");
        let tree = MarkerTree::new(0);
        buffer.attach(&tree);
        assert_eq!(tree.document_length(), 10);
    }

    #[test]
    fn test_dropped_trees_are_pruned() {
        let mut buffer = TextBuffer::new("abc");
        let tree = MarkerTree::new(0);
        buffer.attach(&tree);
        drop(tree);
        buffer.insert(0, "x").unwrap();
        assert_eq!(buffer.trees.len(), 0);
    }
}
