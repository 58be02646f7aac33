//! Shared constants for the transcription engine.
//!
//! These values are used across tier, draft and merge code; keeping them in
//! one place avoids drift between the subsystems that must agree on them.

/// Audio sample rate in Hz.
///
/// 16kHz is the rate Whisper-family models are trained on; every buffer,
/// window and timestamp computation in the engine assumes it.
pub const SAMPLE_RATE: u32 = 16_000;

/// First special token id in the Whisper vocabulary.
///
/// `<|endoftext|>` sits at 50257 and everything above it encodes task
/// metadata (start-of-transcript, language, task, notimestamps). Tokens at
/// or above this id are skipped when decoding text.
pub const FIRST_SPECIAL_TOKEN: u32 = 50_257;

/// First timestamp token id (`<|notimestamps|>` and the `<|t.tt|>` grid).
///
/// Timestamp tokens are special vocabulary entries but carry positional
/// content, so draft propagation treats them as content rather than header.
pub const FIRST_TIMESTAMP_TOKEN: u32 = 50_364;

/// End-of-text token id in the multilingual Whisper vocabulary.
pub const EOT_TOKEN: u32 = 50_257;

/// Maximum overlap, in seconds, that two transcript segments may share
/// before the dominance rule treats them as conflicting.
pub const OVERLAP_EPSILON_S: f32 = 0.1;

/// Default HuggingFace model id loaded when none is configured.
pub const DEFAULT_MODEL: &str = "openai/whisper-base";

/// Default cap on newly generated tokens per inference call.
///
/// Half of Whisper's 448-token decoder context; tier windows are at most
/// 30s so longer outputs are hallucination loops, not speech.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 224;

/// How many times a crashed tier worker is respawned before its tier is
/// marked fatal for the rest of the session.
pub const WORKER_RESTART_BUDGET: u32 = 1;

/// Converts a duration in seconds to a sample count at [`SAMPLE_RATE`].
pub fn samples_for_secs(secs: f32) -> usize {
    (secs * SAMPLE_RATE as f32).round() as usize
}

/// Converts a sample count at [`SAMPLE_RATE`] to seconds.
pub fn secs_for_samples(samples: usize) -> f32 {
    samples as f32 / SAMPLE_RATE as f32
}
