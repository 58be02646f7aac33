//! Per-tier audio buffer with processed-prefix bookkeeping.
//!
//! Chunk tiers consume whole chunks from the front and track how many
//! samples have already been emitted as segments (`P`); continuous tiers
//! keep only a trailing context window and never maintain `P`.

use crate::defaults;

/// Audio buffer owned by one tier worker.
#[derive(Debug, Clone, Default)]
pub struct TierBuffer {
    samples: Vec<f32>,
    /// Samples already emitted as segments, in whole chunks.
    processed: u64,
}

impl TierBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends samples to the tail.
    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Buffered audio in seconds.
    pub fn duration_s(&self) -> f32 {
        defaults::secs_for_samples(self.samples.len())
    }

    /// The processed-prefix pointer `P`, in samples.
    pub fn processed_samples(&self) -> u64 {
        self.processed
    }

    /// Whether a full chunk is buffered.
    pub fn chunk_ready(&self, chunk_samples: usize) -> bool {
        chunk_samples > 0 && self.samples.len() >= chunk_samples
    }

    /// Copies the leading chunk with its absolute time bounds, without
    /// consuming it. The chunk is consumed by [`TierBuffer::advance_chunk`]
    /// only after inference succeeds, so a failed firing retries the same
    /// window.
    pub fn peek_chunk(&self, chunk_samples: usize) -> Option<(Vec<f32>, f32, f32)> {
        if !self.chunk_ready(chunk_samples) {
            return None;
        }
        let start_s = self.processed as f32 / defaults::SAMPLE_RATE as f32;
        let end_s = (self.processed + chunk_samples as u64) as f32 / defaults::SAMPLE_RATE as f32;
        Some((self.samples[..chunk_samples].to_vec(), start_s, end_s))
    }

    /// Shifts the buffer left by one chunk and advances `P`.
    pub fn advance_chunk(&mut self, chunk_samples: usize) {
        let consumed = chunk_samples.min(self.samples.len());
        self.samples.drain(..consumed);
        self.processed += consumed as u64;
    }

    /// The trailing window of at most `max_samples`, for continuous tiers.
    pub fn tail_window(&self, max_samples: usize) -> &[f32] {
        let start = self.samples.len().saturating_sub(max_samples);
        &self.samples[start..]
    }

    /// Truncates to the trailing `context_samples`, so the next firing
    /// requires genuinely new audio.
    pub fn trim_to_context(&mut self, context_samples: usize) {
        let excess = self.samples.len().saturating_sub(context_samples);
        if excess > 0 {
            self.samples.drain(..excess);
        }
    }

    /// Drops all buffered audio, keeping `P` so timestamps stay monotone
    /// across commits.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
