//! Tier worker: one thread owning one model, one audio buffer and one
//! draft buffer.
//!
//! The worker consumes a single command queue, so buffer mutations and
//! inference are naturally serialized: at most one inference runs at a
//! time and audio delivered meanwhile just accumulates. Exactly one partial
//! or segment is emitted per firing.

use crate::asr::{AsrModel, AsrModelFactory, GenerationOptions, LoadObserver};
use crate::config::{TierConfig, TierMode};
use crate::defaults;
use crate::engine::messages::{SegmentOutput, TierCommand, TierEvent};
use crate::tier::buffer::TierBuffer;
use crate::tier::draft::DraftBuffer;
use crate::tier::verifier::{verify_draft, SpecStats};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Engine-level options shared by every tier.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub language: Option<String>,
    pub max_new_tokens: usize,
}

/// A spawned worker: its command queue and thread handle.
pub struct WorkerRuntime {
    pub commands: Sender<TierCommand>,
    pub thread: JoinHandle<()>,
}

/// Forwards model-load progress into the worker's event stream.
struct ChannelObserver<'a> {
    level: u8,
    events: &'a Sender<TierEvent>,
}

impl LoadObserver for ChannelObserver<'_> {
    fn progress(&self, progress: f32, file: Option<&str>) {
        let _ = self.events.send(TierEvent::LoadProgress {
            level: self.level,
            progress,
            file: file.map(str::to_string),
        });
    }

    fn status(&self, text: &str) {
        let _ = self.events.send(TierEvent::Status {
            level: self.level,
            text: text.to_string(),
        });
    }
}

/// Worker lifecycle after the model is up: `Idle <-> Busy -> Terminated`.
/// The loading phase is the stretch before the `Ready` event, while the
/// worker object does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Busy,
    Terminated,
}

/// Spawns a tier worker thread.
///
/// The thread loads its model through the factory, reports `Ready` or
/// `LoadFailed`, then serves its command queue until `Stop` or queue
/// disconnect. A panic during inference unwinds the thread; the
/// orchestrator's monitor thread observes the panicked join and restarts.
pub fn spawn(
    tier: TierConfig,
    options: WorkerOptions,
    factory: Arc<dyn AsrModelFactory>,
    events: Sender<TierEvent>,
) -> WorkerRuntime {
    let (command_tx, command_rx) = crossbeam_channel::unbounded();
    let thread = thread::spawn(move || {
        let level = tier.level;
        let observer = ChannelObserver {
            level,
            events: &events,
        };
        let model = match factory.load(&tier, &observer) {
            Ok(model) => model,
            Err(e) => {
                let _ = events.send(TierEvent::LoadFailed {
                    level,
                    message: e.to_string(),
                });
                return;
            }
        };
        let _ = events.send(TierEvent::Ready { level });

        let mut worker = TierWorker {
            tier,
            options,
            model,
            buffer: TierBuffer::new(),
            draft: DraftBuffer::new(),
            state: WorkerState::Idle,
            events,
        };
        worker.run(command_rx);
    });

    WorkerRuntime {
        commands: command_tx,
        thread,
    }
}

struct TierWorker {
    tier: TierConfig,
    options: WorkerOptions,
    model: Box<dyn AsrModel>,
    buffer: TierBuffer,
    draft: DraftBuffer,
    state: WorkerState,
    events: Sender<TierEvent>,
}

impl TierWorker {
    fn run(&mut self, commands: Receiver<TierCommand>) {
        while let Ok(command) = commands.recv() {
            match command {
                TierCommand::Audio(samples) => {
                    self.buffer.push(&samples);
                    self.pump();
                }
                TierCommand::DraftReplace(tokens) => self.draft.replace(tokens),
                TierCommand::DraftAppend(tokens) => self.draft.append_chunk(&tokens),
                TierCommand::Commit => {
                    self.buffer.clear();
                    self.draft.clear();
                    let _ = self.events.send(TierEvent::Reset {
                        level: self.tier.level,
                    });
                }
                TierCommand::Stop => break,
            }
        }
        self.state = WorkerState::Terminated;
    }

    /// Fires the tier as long as its condition holds. Inference is only
    /// attempted from `Idle`; audio is accepted in any state.
    fn pump(&mut self) {
        if self.state != WorkerState::Idle {
            return;
        }
        match self.tier.mode {
            TierMode::Continuous => {
                let step = defaults::samples_for_secs(self.tier.step_size_s);
                // At most one firing per audio delivery: the trimmed context
                // can itself satisfy the step condition, and re-firing on it
                // would transcribe no new audio.
                if self.buffer.len() >= step {
                    self.fire_continuous();
                }
            }
            TierMode::Chunk => {
                let chunk = defaults::samples_for_secs(self.tier.chunk_size_s);
                while self.buffer.chunk_ready(chunk) {
                    if !self.fire_chunk(chunk) {
                        break;
                    }
                }
            }
        }
    }

    fn status(&self, text: String) {
        let _ = self.events.send(TierEvent::Status {
            level: self.tier.level,
            text,
        });
    }

    fn fire_continuous(&mut self) {
        self.state = WorkerState::Busy;
        let started = Instant::now();
        let max_input = defaults::samples_for_secs(self.tier.max_input_window_s);
        let window = self.buffer.tail_window(max_input).to_vec();

        let result = self
            .model
            .extract_features(&window)
            .and_then(|features| {
                let options = GenerationOptions::for_tier(
                    &self.tier,
                    self.options.language.as_deref(),
                    self.options.max_new_tokens,
                );
                self.model.generate(&features, &options)
            })
            .and_then(|tokens| {
                let text = self.model.decode(&tokens, true)?;
                Ok((tokens, text))
            });

        self.state = WorkerState::Idle;
        match result {
            Ok((tokens, text)) => {
                let _ = self.events.send(TierEvent::Partial {
                    level: self.tier.level,
                    text,
                    tokens,
                    inference_ms: started.elapsed().as_secs_f64() * 1_000.0,
                });
                let context = defaults::samples_for_secs(self.tier.context_window_s);
                self.buffer.trim_to_context(context);
            }
            Err(e) => {
                // Buffer is left intact; the next audio delivery retries.
                self.status(format!("inference error: {e}"));
            }
        }
    }

    /// Returns false when pumping should stop (error path); the chunk stays
    /// buffered and is retried on the next firing condition.
    fn fire_chunk(&mut self, chunk_samples: usize) -> bool {
        let Some((window, start_s, end_s)) = self.buffer.peek_chunk(chunk_samples) else {
            return false;
        };
        self.state = WorkerState::Busy;
        let started = Instant::now();

        let features = match self.model.extract_features(&window) {
            Ok(features) => features,
            Err(e) => {
                self.state = WorkerState::Idle;
                self.status(format!("feature extraction error: {e}"));
                return false;
            }
        };

        let mut options = GenerationOptions::for_tier(
            &self.tier,
            self.options.language.as_deref(),
            self.options.max_new_tokens,
        );
        let mut spec: Option<SpecStats> = None;
        if self.tier.level > 1 && !self.draft.is_empty() {
            let prefix = verify_draft(self.model.as_mut(), &features, self.draft.tokens());
            spec = Some(prefix.stats);
            if prefix.stats.verified > 0 {
                options.decoder_input_ids = Some(prefix.tokens);
            }
        }

        let result = self.model.generate(&features, &options).and_then(|tokens| {
            let text = self.model.decode(&tokens, true)?;
            Ok((tokens, text))
        });

        self.state = WorkerState::Idle;
        match result {
            Ok((tokens, text)) => {
                self.buffer.advance_chunk(chunk_samples);
                // Empty text is emitted: a confident silence chunk is
                // allowed to evict weaker overlapping guesses.
                let _ = self.events.send(TierEvent::Segment(SegmentOutput {
                    level: self.tier.level,
                    start_s,
                    end_s,
                    text,
                    tokens,
                    inference_ms: started.elapsed().as_secs_f64() * 1_000.0,
                    spec,
                }));
                true
            }
            Err(e) => {
                self.status(format!("inference error: {e}"));
                false
            }
        }
    }
}
