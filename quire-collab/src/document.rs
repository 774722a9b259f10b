//! Materialized document content.
//!
//! One [`DocumentState`] lives inside each session and is only touched while
//! the session's lock is held. Edits arrive already transformed and clamped,
//! in log order.

use crate::operation::OpKind;

/// Canonical content of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentState {
    content: String,
    /// Cached `content.chars().count()`.
    char_len: usize,
}

impl DocumentState {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let char_len = content.chars().count();
        Self { content, char_len }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.char_len
    }

    pub fn is_empty(&self) -> bool {
        self.char_len == 0
    }

    /// Splice `edit` into the content and return the new content.
    ///
    /// Offsets beyond the end saturate at the end, so applying never fails;
    /// the transformer has already clamped anything it logged.
    pub fn apply(&mut self, edit: &OpKind) -> &str {
        let position = edit.position().min(self.char_len);
        let deleted = edit.deleted_len().min(self.char_len - position);

        let start = self.byte_offset(position);
        let end = self.byte_offset(position + deleted);
        let text = edit.text().unwrap_or("");

        self.content.replace_range(start..end, text);
        self.char_len = self.char_len - deleted + text.chars().count();
        &self.content
    }

    /// Byte index of the `char_pos`-th character (or the end).
    fn byte_offset(&self, char_pos: usize) -> usize {
        self.content
            .char_indices()
            .nth(char_pos)
            .map_or(self.content.len(), |(i, _)| i)
    }
}
