//! Segment merge engine.
//!
//! Maintains the canonical transcript under the dominance rule: when two
//! segments overlap by more than epsilon, the higher tier keeps the span,
//! equal tiers favor the newer segment, and separators are untouchable
//! commit markers.

use crate::defaults;
use serde::Serialize;

/// One timestamped span of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub start_s: f32,
    pub end_s: f32,
    pub text: String,
    /// Producing tier; doubles as dominance rank. 0 is reserved for
    /// separators.
    pub level: u8,
    pub tokens: Option<Vec<u32>>,
    pub is_separator: bool,
}

impl Segment {
    pub fn new(level: u8, start_s: f32, end_s: f32, text: impl Into<String>) -> Self {
        Self {
            start_s,
            end_s,
            text: text.into(),
            level,
            tokens: None,
            is_separator: false,
        }
    }

    pub fn with_tokens(mut self, tokens: Vec<u32>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Zero-width commit marker at `at_s`.
    pub fn separator(at_s: f32) -> Self {
        Self {
            start_s: at_s,
            end_s: at_s,
            text: String::new(),
            level: 0,
            tokens: None,
            is_separator: true,
        }
    }

    /// Overlap with another segment in seconds; zero when disjoint.
    pub fn overlap_s(&self, other: &Segment) -> f32 {
        let start = self.start_s.max(other.start_s);
        let end = self.end_s.min(other.end_s);
        (end - start).max(0.0)
    }

    fn conflicts_with(&self, other: &Segment) -> bool {
        !self.is_separator
            && !other.is_separator
            && self.overlap_s(other) > defaults::OVERLAP_EPSILON_S
    }
}

/// Where an insertion attempt ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Inserted; `evicted` lower-or-equal segments were removed.
    Inserted { evicted: usize },
    /// A strictly higher tier already covers the span.
    Rejected,
}

/// Ordered, non-overlapping transcript.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    segments: Vec<Segment>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Segment> {
        self.segments.clone()
    }

    /// Latest end time across all segments, 0.0 when empty. Separators are
    /// zero-width so they participate harmlessly.
    pub fn tail_end_s(&self) -> f32 {
        self.segments.iter().map(|s| s.end_s).fold(0.0, f32::max)
    }

    /// Inserts a segment under the dominance rule.
    ///
    /// Removes every non-separator segment the newcomer dominates (lower or
    /// equal level with conflicting overlap), rejects the newcomer if a
    /// strictly higher tier still conflicts, and keeps the list sorted by
    /// start time throughout.
    pub fn insert(&mut self, segment: Segment) -> InsertOutcome {
        debug_assert!(segment.start_s <= segment.end_s);
        if self
            .segments
            .iter()
            .any(|s| s.conflicts_with(&segment) && s.level > segment.level)
        {
            return InsertOutcome::Rejected;
        }

        let before = self.segments.len();
        self.segments
            .retain(|s| !(s.conflicts_with(&segment) && s.level <= segment.level));
        let evicted = before - self.segments.len();

        let position = self
            .segments
            .partition_point(|s| s.start_s <= segment.start_s);
        self.segments.insert(position, segment);
        InsertOutcome::Inserted { evicted }
    }

    /// Appends a separator pinned at the current tail end time.
    pub fn append_separator(&mut self) {
        let at = self.tail_end_s();
        self.segments.push(Segment::separator(at));
    }

    /// Concatenated text of all non-separator segments in order.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .segments
            .iter()
            .filter(|s| !s.is_separator && !s.text.is_empty())
            .map(|s| s.text.trim())
            .collect();
        parts.join(" ")
    }

    /// Checks the transcript invariants; used by tests and debug builds.
    ///
    /// Segments are sorted by start time and no two non-separator segments
    /// overlap by more than epsilon.
    pub fn check_invariants(&self) -> bool {
        let sorted = self
            .segments
            .windows(2)
            .all(|pair| pair[0].start_s <= pair[1].start_s);
        let disjoint = self.segments.iter().enumerate().all(|(i, a)| {
            self.segments
                .iter()
                .skip(i + 1)
                .all(|b| !a.conflicts_with(b))
        });
        sorted && disjoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(level: u8, start: f32, end: f32, text: &str) -> Segment {
        Segment::new(level, start, end, text)
    }

    #[test]
    fn test_overlap_computation() {
        let a = seg(2, 0.0, 5.0, "a");
        let b = seg(2, 4.0, 9.0, "b");
        let c = seg(2, 5.0, 10.0, "c");
        assert!((a.overlap_s(&b) - 1.0).abs() < 1e-6);
        assert_eq!(a.overlap_s(&c), 0.0);
        assert_eq!(b.overlap_s(&a), a.overlap_s(&b));
    }

    #[test]
    fn test_adjacent_chunks_do_not_conflict() {
        let mut transcript = Transcript::new();
        transcript.insert(seg(2, 0.0, 5.0, "one"));
        transcript.insert(seg(2, 5.0, 10.0, "two"));
        assert_eq!(transcript.segments().len(), 2);
        assert!(transcript.check_invariants());
    }

    #[test]
    fn test_higher_level_evicts_lower() {
        let mut transcript = Transcript::new();
        for k in 0..4 {
            transcript.insert(seg(2, k as f32 * 5.0, (k + 1) as f32 * 5.0, "l2"));
        }
        let outcome = transcript.insert(seg(4, 0.0, 20.0, "l4"));

        assert_eq!(outcome, InsertOutcome::Inserted { evicted: 4 });
        assert_eq!(transcript.segments().len(), 1);
        assert_eq!(transcript.segments()[0].level, 4);
        assert!(transcript.check_invariants());
    }

    #[test]
    fn test_lower_level_rejected_by_higher() {
        let mut transcript = Transcript::new();
        transcript.insert(seg(4, 0.0, 20.0, "l4"));

        let outcome = transcript.insert(seg(2, 5.0, 10.0, "l2"));
        assert_eq!(outcome, InsertOutcome::Rejected);
        assert_eq!(transcript.segments().len(), 1);
        assert_eq!(transcript.segments()[0].level, 4);
    }

    #[test]
    fn test_equal_level_newer_wins() {
        let mut transcript = Transcript::new();
        transcript.insert(seg(3, 0.0, 10.0, "old"));
        let outcome = transcript.insert(seg(3, 0.0, 10.0, "new"));

        assert_eq!(outcome, InsertOutcome::Inserted { evicted: 1 });
        assert_eq!(transcript.segments().len(), 1);
        assert_eq!(transcript.segments()[0].text, "new");
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut transcript = Transcript::new();
        let segment = seg(2, 0.0, 5.0, "same");
        transcript.insert(segment.clone());
        transcript.insert(segment.clone());

        assert_eq!(transcript.segments().len(), 1);
        assert_eq!(transcript.segments()[0], segment);
    }

    #[test]
    fn test_small_overlap_within_epsilon_is_tolerated() {
        let mut transcript = Transcript::new();
        transcript.insert(seg(2, 0.0, 5.05, "a"));
        // 0.05s overlap is within epsilon; both survive.
        let outcome = transcript.insert(seg(3, 5.0, 10.0, "b"));
        assert!(matches!(outcome, InsertOutcome::Inserted { evicted: 0 }));
        assert_eq!(transcript.segments().len(), 2);
        assert!(transcript.check_invariants());
    }

    #[test]
    fn test_empty_text_segment_evicts() {
        // A confident silence chunk from a higher tier replaces guesses.
        let mut transcript = Transcript::new();
        transcript.insert(seg(2, 0.0, 5.0, "guess"));
        let outcome = transcript.insert(seg(3, 0.0, 10.0, ""));
        assert!(matches!(outcome, InsertOutcome::Inserted { evicted: 1 }));
        assert_eq!(transcript.text(), "");
    }

    #[test]
    fn test_separators_are_ignored_by_overlap_and_preserved() {
        let mut transcript = Transcript::new();
        transcript.insert(seg(2, 0.0, 5.0, "before"));
        transcript.append_separator();
        assert_eq!(transcript.segments().len(), 2);
        assert_eq!(transcript.segments()[1].start_s, 5.0);
        assert_eq!(transcript.segments()[1].end_s, 5.0);

        // A dominating segment spanning the separator does not remove it.
        transcript.insert(seg(4, 0.0, 20.0, "after"));
        let separators: Vec<&Segment> = transcript
            .segments()
            .iter()
            .filter(|s| s.is_separator)
            .collect();
        assert_eq!(separators.len(), 1);
        assert!(transcript.check_invariants());
    }

    #[test]
    fn test_separator_on_empty_transcript_sits_at_zero() {
        let mut transcript = Transcript::new();
        transcript.append_separator();
        assert_eq!(transcript.segments()[0].start_s, 0.0);
        assert!(transcript.segments()[0].is_separator);
    }

    #[test]
    fn test_segments_stay_sorted_by_start() {
        let mut transcript = Transcript::new();
        transcript.insert(seg(2, 10.0, 15.0, "late"));
        transcript.insert(seg(2, 0.0, 5.0, "early"));
        transcript.insert(seg(2, 5.0, 10.0, "middle"));

        let starts: Vec<f32> = transcript.segments().iter().map(|s| s.start_s).collect();
        assert_eq!(starts, vec![0.0, 5.0, 10.0]);
        assert_eq!(transcript.text(), "early middle late");
    }

    #[test]
    fn test_tail_end_tracks_latest_segment() {
        let mut transcript = Transcript::new();
        assert_eq!(transcript.tail_end_s(), 0.0);
        transcript.insert(seg(2, 0.0, 5.0, "a"));
        transcript.insert(seg(3, 0.0, 10.0, "b"));
        assert_eq!(transcript.tail_end_s(), 10.0);
    }

    #[test]
    fn test_partial_overlap_eviction_boundary() {
        let mut transcript = Transcript::new();
        transcript.insert(seg(2, 0.0, 5.0, "a"));
        transcript.insert(seg(2, 5.0, 10.0, "b"));
        // A higher-tier span over 3..8 conflicts with both.
        let outcome = transcript.insert(seg(3, 3.0, 8.0, "c"));
        assert_eq!(outcome, InsertOutcome::Inserted { evicted: 2 });
        assert_eq!(transcript.segments().len(), 1);
    }
}
