//! Draft-token buffer for speculative decoding.
//!
//! Holds the upstream tier's best current hypothesis for a downstream tier.
//! Continuous upstreams replace the whole buffer (their tokens re-describe
//! the trailing window); chunk upstreams append, with the repeated prompt
//! header stripped from every chunk after the first so the buffer reads as
//! one transcript whose first token is the start-of-transcript marker.

use crate::defaults;

/// Header special token: task metadata below the timestamp range.
/// Timestamp tokens are content and survive the strip.
fn is_header_token(token: u32) -> bool {
    (defaults::FIRST_SPECIAL_TOKEN..defaults::FIRST_TIMESTAMP_TOKEN).contains(&token)
}

/// Ordered draft tokens offered to one downstream tier.
#[derive(Debug, Clone, Default)]
pub struct DraftBuffer {
    tokens: Vec<u32>,
}

impl DraftBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Replaces the buffer with a continuous upstream's hypothesis.
    pub fn replace(&mut self, tokens: Vec<u32>) {
        self.tokens = tokens;
    }

    /// Appends a chunk upstream's tokens.
    ///
    /// Header tokens at the head of the new chunk are stripped unless the
    /// buffer is empty: the first chunk keeps its header so the sequence
    /// starts with the start-of-transcript marker.
    pub fn append_chunk(&mut self, tokens: &[u32]) {
        if self.tokens.is_empty() {
            self.tokens.extend_from_slice(tokens);
            return;
        }
        let body_start = tokens.iter().take_while(|&&t| is_header_token(t)).count();
        self.tokens.extend_from_slice(&tokens[body_start..]);
    }

    /// Drops everything; the next append keeps its header again.
    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.tokens.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_classification() {
        assert!(is_header_token(50_257));
        assert!(is_header_token(50_258));
        assert!(is_header_token(50_363));
        // Timestamp tokens are content.
        assert!(!is_header_token(50_364));
        assert!(!is_header_token(50_400));
        // Plain text tokens are content.
        assert!(!is_header_token(0));
        assert!(!is_header_token(50_256));
    }

    #[test]
    fn test_first_chunk_keeps_header() {
        let mut draft = DraftBuffer::new();
        draft.append_chunk(&[50_258, 50_259, 50_359, 50_363, 7, 8]);
        assert_eq!(draft.tokens(), &[50_258, 50_259, 50_359, 50_363, 7, 8]);
    }

    #[test]
    fn test_second_chunk_strips_header() {
        let mut draft = DraftBuffer::new();
        draft.append_chunk(&[50_258, 50_259, 50_359, 50_363, 7, 8]);
        draft.append_chunk(&[50_258, 50_259, 50_359, 50_363, 9]);
        assert_eq!(draft.tokens(), &[50_258, 50_259, 50_359, 50_363, 7, 8, 9]);
    }

    #[test]
    fn test_strip_preserves_timestamp_tokens() {
        let mut draft = DraftBuffer::new();
        draft.append_chunk(&[50_258, 1]);
        // Leading timestamps in a later chunk are content, not header.
        draft.append_chunk(&[50_258, 50_364, 2]);
        assert_eq!(draft.tokens(), &[50_258, 1, 50_364, 2]);
    }

    #[test]
    fn test_strip_only_removes_leading_run() {
        let mut draft = DraftBuffer::new();
        draft.append_chunk(&[50_258, 1]);
        // A header-range token after content is preserved.
        draft.append_chunk(&[50_258, 2, 50_259, 3]);
        assert_eq!(draft.tokens(), &[50_258, 1, 2, 50_259, 3]);
    }

    #[test]
    fn test_replace_overwrites() {
        let mut draft = DraftBuffer::new();
        draft.append_chunk(&[50_258, 1, 2]);
        draft.replace(vec![50_258, 9]);
        assert_eq!(draft.tokens(), &[50_258, 9]);
    }

    #[test]
    fn test_clear_resets_header_behavior() {
        let mut draft = DraftBuffer::new();
        draft.append_chunk(&[50_258, 1]);
        draft.append_chunk(&[50_258, 2]);
        draft.clear();
        assert!(draft.is_empty());

        // After a commit the next chunk is a first chunk again.
        draft.append_chunk(&[50_258, 3]);
        assert_eq!(draft.tokens(), &[50_258, 3]);
    }
}
