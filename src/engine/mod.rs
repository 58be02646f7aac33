//! Engine side: orchestration, merging and output.

pub mod merge;
pub mod messages;
pub mod orchestrator;
pub mod sink;

pub use merge::{InsertOutcome, Segment, Transcript};
pub use messages::{Hypothesis, SegmentOutput, SpecTotals, TierCommand, TierEvent, TimingStats};
pub use orchestrator::{Engine, EngineHandle};
pub use sink::{CollectedOutput, CollectorSink, TranscriptSink, TranscriptUpdate};
