//! Transcript sink interface.
//!
//! The sink is the engine's outbound edge: after every transcript change it
//! receives a consistent snapshot plus the rolling hypothesis and per-tier
//! timing. Rendering, storage and wire formats live outside the engine.

use crate::engine::merge::Segment;
use crate::engine::messages::{Hypothesis, TimingStats};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A consistent view of the transcript after one change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscriptUpdate {
    pub segments: Vec<Segment>,
    /// Latest continuous-tier hypothesis, if any tier produced one.
    pub partial: Option<Hypothesis>,
    /// Per-tier timing, keyed by level.
    pub timing: BTreeMap<u8, TimingStats>,
}

/// Receiver for engine output.
pub trait TranscriptSink: Send {
    /// Called after every transcript or hypothesis change.
    fn on_transcript(&mut self, update: &TranscriptUpdate);

    /// Engine-level or per-tier status line.
    fn on_status(&mut self, level: Option<u8>, text: &str) {
        let _ = (level, text);
    }

    /// Model load progress for one tier.
    fn on_load_progress(&mut self, level: u8, progress: f32, file: Option<&str>) {
        let _ = (level, progress, file);
    }
}

/// Shared state recorded by [`CollectorSink`].
#[derive(Debug, Default)]
pub struct CollectedOutput {
    pub updates: Vec<TranscriptUpdate>,
    pub statuses: Vec<(Option<u8>, String)>,
    pub load_progress: Vec<(u8, f32)>,
}

impl CollectedOutput {
    /// The last transcript snapshot, if any change arrived.
    pub fn last_segments(&self) -> Option<&[Segment]> {
        self.updates.last().map(|u| u.segments.as_slice())
    }
}

/// Sink that records everything for inspection in tests.
#[derive(Debug, Clone, Default)]
pub struct CollectorSink {
    output: Arc<Mutex<CollectedOutput>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the recorded output, shared with the engine-side copy.
    pub fn output(&self) -> Arc<Mutex<CollectedOutput>> {
        self.output.clone()
    }
}

impl TranscriptSink for CollectorSink {
    fn on_transcript(&mut self, update: &TranscriptUpdate) {
        self.output.lock().unwrap().updates.push(update.clone());
    }

    fn on_status(&mut self, level: Option<u8>, text: &str) {
        self.output
            .lock()
            .unwrap()
            .statuses
            .push((level, text.to_string()));
    }

    fn on_load_progress(&mut self, level: u8, progress: f32, _file: Option<&str>) {
        self.output
            .lock()
            .unwrap()
            .load_progress
            .push((level, progress));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_records_updates() {
        let mut sink = CollectorSink::new();
        let output = sink.output();

        sink.on_transcript(&TranscriptUpdate {
            segments: vec![Segment::new(2, 0.0, 5.0, "hello")],
            partial: None,
            timing: BTreeMap::new(),
        });
        sink.on_status(Some(2), "status line");
        sink.on_load_progress(3, 0.5, Some("model.safetensors"));

        let collected = output.lock().unwrap();
        assert_eq!(collected.updates.len(), 1);
        assert_eq!(collected.last_segments().unwrap()[0].text, "hello");
        assert_eq!(collected.statuses, vec![(Some(2), "status line".to_string())]);
        assert_eq!(collected.load_progress, vec![(3, 0.5)]);
    }

    #[test]
    fn test_sink_trait_default_methods_are_optional() {
        struct TranscriptOnly(usize);
        impl TranscriptSink for TranscriptOnly {
            fn on_transcript(&mut self, _update: &TranscriptUpdate) {
                self.0 += 1;
            }
        }

        let mut sink = TranscriptOnly(0);
        sink.on_transcript(&TranscriptUpdate::default());
        sink.on_status(None, "ignored");
        sink.on_load_progress(1, 1.0, None);
        assert_eq!(sink.0, 1);
    }
}
