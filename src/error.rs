/// Errors surfaced by marker creation and buffer edits.
///
/// Everything else in the crate follows the "one bad marker must never abort
/// an editing session" rule: stale or invalidated handles produce `false` /
/// `None` returns instead of errors, and internal consistency violations are
/// logged and isolated rather than propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerError {
    /// Requested interval bounds are not a valid range inside the document.
    InvalidRange { start: u64, end: u64, doc_len: u64 },
    /// An edit addressed bytes past the end of the buffer.
    EditOutOfBounds {
        offset: usize,
        old_len: usize,
        len: usize,
    },
    /// An edit boundary fell in the middle of a UTF-8 code point.
    NotCharBoundary { offset: usize },
}

impl std::fmt::Display for MarkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerError::InvalidRange {
                start,
                end,
                doc_len,
            } => write!(
                f,
                "invalid range [{start}, {end}) for document of length {doc_len}"
            ),
            MarkerError::EditOutOfBounds {
                offset,
                old_len,
                len,
            } => write!(
                f,
                "edit [{offset}, {}) is out of bounds for buffer of length {len}",
                offset + old_len
            ),
            MarkerError::NotCharBoundary { offset } => {
                write!(f, "offset {offset} is not a char boundary")
            }
        }
    }
}

impl std::error::Error for MarkerError {}
