//! Tagged message types exchanged between the orchestrator, the tier
//! workers and the sink, plus the per-tier timing statistics the sink
//! receives with every transcript update.

use crate::tier::verifier::SpecStats;
use serde::Serialize;

/// Commands delivered to a tier worker's single-consumer queue.
///
/// The queue is the only way state enters a worker, so buffer and draft
/// mutations are serialized against inference without any extra locking.
#[derive(Debug, Clone)]
pub enum TierCommand {
    /// New audio samples to accumulate.
    Audio(Vec<f32>),
    /// Replace the draft buffer (continuous upstream).
    DraftReplace(Vec<u32>),
    /// Append to the draft buffer with header stripping (chunk upstream).
    DraftAppend(Vec<u32>),
    /// Clear audio and draft buffers, keeping the processed prefix.
    Commit,
    /// Finish the current command and terminate.
    Stop,
}

/// A chunk tier's timestamped output.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentOutput {
    pub level: u8,
    pub start_s: f32,
    pub end_s: f32,
    pub text: String,
    pub tokens: Vec<u32>,
    pub inference_ms: f64,
    /// Present when a draft was offered for this chunk.
    pub spec: Option<SpecStats>,
}

/// Events emitted by a tier worker.
#[derive(Debug, Clone)]
pub enum TierEvent {
    LoadProgress {
        level: u8,
        progress: f32,
        file: Option<String>,
    },
    /// Model loaded; the worker accepts commands.
    Ready { level: u8 },
    /// Model load failed even after the CPU fallback; the tier will not
    /// serve this session.
    LoadFailed { level: u8, message: String },
    /// Recoverable condition worth surfacing (inference error, fallback).
    Status { level: u8, text: String },
    /// A continuous tier's rolling hypothesis.
    Partial {
        level: u8,
        text: String,
        tokens: Vec<u32>,
        inference_ms: f64,
    },
    Segment(SegmentOutput),
    /// Commit acknowledgement: audio and draft buffers were cleared.
    Reset { level: u8 },
}

impl TierEvent {
    pub fn level(&self) -> u8 {
        match self {
            TierEvent::LoadProgress { level, .. }
            | TierEvent::Ready { level }
            | TierEvent::LoadFailed { level, .. }
            | TierEvent::Status { level, .. }
            | TierEvent::Partial { level, .. }
            | TierEvent::Reset { level } => *level,
            TierEvent::Segment(segment) => segment.level,
        }
    }
}

/// Accumulated speculative-decoding counters for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SpecTotals {
    pub total_hits: u64,
    pub total_drafts: u64,
}

impl SpecTotals {
    pub fn hit_rate(&self) -> f32 {
        self.total_hits as f32 / self.total_drafts.max(1) as f32
    }
}

/// Inference timing for one tier, updated on every partial or segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub count: u64,
    pub total_ms: f64,
    pub average_ms: f64,
    pub last_ms: f64,
    /// Present once the tier has verified at least one draft.
    pub spec: Option<SpecTotals>,
}

impl TimingStats {
    pub fn record(&mut self, inference_ms: f64, spec: Option<SpecStats>) {
        self.count += 1;
        self.total_ms += inference_ms;
        self.average_ms = self.total_ms / self.count as f64;
        self.last_ms = inference_ms;
        if let Some(stats) = spec {
            let totals = self.spec.get_or_insert_with(SpecTotals::default);
            totals.total_hits += stats.verified as u64;
            totals.total_drafts += stats.total as u64;
        }
    }
}

/// The latest continuous-tier hypothesis, replaced on every partial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hypothesis {
    pub level: u8,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_stats_record() {
        let mut stats = TimingStats::default();
        stats.record(10.0, None);
        stats.record(30.0, None);

        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_ms, 40.0);
        assert_eq!(stats.average_ms, 20.0);
        assert_eq!(stats.last_ms, 30.0);
        assert!(stats.spec.is_none());
    }

    #[test]
    fn test_timing_stats_accumulates_spec_totals() {
        let mut stats = TimingStats::default();
        stats.record(5.0, Some(SpecStats { verified: 3, total: 4 }));
        stats.record(5.0, Some(SpecStats { verified: 1, total: 2 }));

        let spec = stats.spec.unwrap();
        assert_eq!(spec.total_hits, 4);
        assert_eq!(spec.total_drafts, 6);
        assert!((spec.hit_rate() - 4.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_spec_totals_hit_rate_guards_zero() {
        let totals = SpecTotals::default();
        assert_eq!(totals.hit_rate(), 0.0);
    }

    #[test]
    fn test_event_level_extraction() {
        let event = TierEvent::Ready { level: 3 };
        assert_eq!(event.level(), 3);

        let event = TierEvent::Segment(SegmentOutput {
            level: 2,
            start_s: 0.0,
            end_s: 5.0,
            text: String::new(),
            tokens: vec![],
            inference_ms: 1.0,
            spec: None,
        });
        assert_eq!(event.level(), 2);
    }
}
