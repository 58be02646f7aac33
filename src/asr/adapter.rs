//! Model adapter interface for the inference tiers.
//!
//! Each tier owns one [`AsrModel`] created through an [`AsrModelFactory`].
//! The trait exposes the four capability groups a tier needs: feature
//! extraction, token generation, a raw decoder forward pass (used by the
//! speculative verifier), and text decoding. [`MockAsrModel`] implements the
//! same contract with a scripted argmax chain so the engine can be tested
//! without model weights.

use crate::config::TierConfig;
use crate::defaults;
use crate::error::{EngineError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Encoder-ready audio features.
///
/// The representation is backend-specific; tiers treat it as opaque and only
/// pass it back into the model that produced it.
#[derive(Debug, Clone)]
pub enum Features {
    /// Raw PCM window, used by the mock backend.
    Pcm(Vec<f32>),
    /// Log-mel spectrogram tensor, used by the candle Whisper backend.
    #[cfg(feature = "whisper")]
    Mel(candle_core::Tensor),
}

/// Decoder logits for a token sequence, shape `(seq_len, vocab_size)`.
#[derive(Debug, Clone)]
pub struct Logits {
    data: Vec<f32>,
    seq_len: usize,
    vocab_size: usize,
}

impl Logits {
    /// Wraps a flat row-major buffer of `seq_len * vocab_size` values.
    pub fn new(data: Vec<f32>, seq_len: usize, vocab_size: usize) -> Result<Self> {
        if data.len() != seq_len * vocab_size {
            return Err(EngineError::Inference {
                message: format!(
                    "logits buffer of {} values does not match {}x{}",
                    data.len(),
                    seq_len,
                    vocab_size
                ),
            });
        }
        Ok(Self {
            data,
            seq_len,
            vocab_size,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Argmax over the vocabulary at one sequence position.
    pub fn argmax(&self, position: usize) -> Option<u32> {
        if position >= self.seq_len {
            return None;
        }
        let row = &self.data[position * self.vocab_size..(position + 1) * self.vocab_size];
        let mut best = 0usize;
        let mut best_value = f32::NEG_INFINITY;
        for (index, &value) in row.iter().enumerate() {
            if value > best_value {
                best = index;
                best_value = value;
            }
        }
        Some(best as u32)
    }
}

/// Recognition task requested from the model.
///
/// Translation is out of scope for the engine, but the task slot stays in
/// the options so adapters can document what they were asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Task {
    #[default]
    Transcribe,
}

/// Options for one generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub max_new_tokens: usize,
    /// Language code to force; None lets the model detect it.
    pub language: Option<String>,
    pub task: Task,
    /// Beam width; 1 is greedy.
    pub beams: usize,
    pub do_sample: bool,
    pub early_stopping: bool,
    /// Verified prefix to resume decoding from, including the
    /// start-of-transcript header. None starts from an empty prompt.
    pub decoder_input_ids: Option<Vec<u32>>,
}

impl GenerationOptions {
    /// Builds options for a tier from its configuration.
    pub fn for_tier(tier: &TierConfig, language: Option<&str>, max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            language: language.map(str::to_string),
            task: Task::Transcribe,
            beams: tier.generation.beams,
            do_sample: tier.generation.do_sample,
            early_stopping: tier.generation.early_stopping,
            decoder_input_ids: None,
        }
    }
}

/// Speech recognition model owned by a single tier.
///
/// Implementations are not shared between tiers, so `&mut self` methods are
/// fine; the worker serializes all calls.
pub trait AsrModel: Send {
    /// Converts a PCM window into encoder features.
    fn extract_features(&mut self, samples: &[f32]) -> Result<Features>;

    /// Generates a token sequence for the features.
    ///
    /// The returned sequence includes the prompt header (start-of-transcript,
    /// language, task markers) but not the trailing end-of-text token. When
    /// `decoder_input_ids` is set, decoding resumes from that prefix and the
    /// prefix is included in the result.
    fn generate(&mut self, features: &Features, options: &GenerationOptions) -> Result<Vec<u32>>;

    /// Runs one decoder forward pass over `decoder_input_ids` and returns
    /// the logits for every position. Used by the speculative verifier.
    fn forward(&mut self, features: &Features, decoder_input_ids: &[u32]) -> Result<Logits>;

    /// Decodes tokens to text.
    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String>;
}

/// Receives model-load progress and status notes.
///
/// Workers forward these into the engine's event stream so a sink can render
/// download and initialization progress per tier.
pub trait LoadObserver: Sync {
    fn progress(&self, progress: f32, file: Option<&str>);

    fn status(&self, text: &str) {
        let _ = text;
    }
}

/// Observer that discards everything.
pub struct NullObserver;

impl LoadObserver for NullObserver {
    fn progress(&self, _progress: f32, _file: Option<&str>) {}
}

/// Creates one model instance per tier.
///
/// A factory outlives the workers it serves: the orchestrator keeps it to
/// re-load a model when a crashed worker is restarted.
pub trait AsrModelFactory: Send + Sync {
    fn load(&self, tier: &TierConfig, observer: &dyn LoadObserver) -> Result<Box<dyn AsrModel>>;
}

type TokenScript = dyn Fn(&[f32]) -> Vec<u32> + Send + Sync;

/// Scripted mock model.
///
/// The script maps an audio window to the full token chain the model's
/// argmax decoding would produce (header included). `generate` returns the
/// chain regardless of any draft prefix, and `forward` produces logits whose
/// argmax agrees with the chain exactly as far as the given prefix does, so
/// verifier behavior matches a real model's.
pub struct MockAsrModel {
    script: Arc<TokenScript>,
    vocab: HashMap<u32, String>,
    vocab_size: usize,
    fail_features: bool,
    fail_generate: bool,
    fail_generate_remaining: Option<Arc<AtomicI64>>,
    fail_forward: bool,
    panic_countdown: Option<Arc<AtomicI64>>,
    latency: Option<Duration>,
}

/// Standard header the default mock script prepends:
/// start-of-transcript, language, task, notimestamps.
pub const MOCK_HEADER: [u32; 4] = [50_258, 50_259, 50_359, 50_363];

impl MockAsrModel {
    /// Creates a mock whose script emits the standard header plus one
    /// content token per whole second of audio in the window.
    pub fn new() -> Self {
        Self::with_script(|samples| {
            let seconds = samples.len() / defaults::SAMPLE_RATE as usize;
            let mut tokens = MOCK_HEADER.to_vec();
            tokens.extend((0..seconds as u32).map(|s| 1_000 + s));
            tokens
        })
    }

    /// Creates a mock with a custom window-to-chain script.
    pub fn with_script(script: impl Fn(&[f32]) -> Vec<u32> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            vocab: HashMap::new(),
            vocab_size: 51_865,
            fail_features: false,
            fail_generate: false,
            fail_generate_remaining: None,
            fail_forward: false,
            panic_countdown: None,
            latency: None,
        }
    }

    /// Maps a token id to a word for text decoding.
    pub fn with_word(mut self, token: u32, word: &str) -> Self {
        self.vocab.insert(token, word.to_string());
        self
    }

    /// Configure the mock to fail on feature extraction.
    pub fn with_feature_failure(mut self) -> Self {
        self.fail_features = true;
        self
    }

    /// Configure the mock to fail on generation.
    pub fn with_generate_failure(mut self) -> Self {
        self.fail_generate = true;
        self
    }

    /// Fail the first `count` generation calls, then recover.
    pub fn with_generate_failures(mut self, count: i64) -> Self {
        self.fail_generate_remaining = Some(Arc::new(AtomicI64::new(count)));
        self
    }

    /// Configure the mock to fail on the forward pass.
    pub fn with_forward_failure(mut self) -> Self {
        self.fail_forward = true;
        self
    }

    /// Panic inside `generate` once `calls` generations have completed.
    /// Used to exercise the orchestrator's crash recovery.
    pub fn with_panic_after(mut self, calls: i64) -> Self {
        self.panic_countdown = Some(Arc::new(AtomicI64::new(calls)));
        self
    }

    /// Sleep inside `generate` to simulate inference latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn chain_for(&self, features: &Features) -> Result<Vec<u32>> {
        match features {
            Features::Pcm(samples) => Ok((self.script)(samples)),
            #[cfg(feature = "whisper")]
            Features::Mel(_) => Err(EngineError::Inference {
                message: "mock model cannot consume mel features".to_string(),
            }),
        }
    }
}

impl Default for MockAsrModel {
    fn default() -> Self {
        Self::new()
    }
}

impl AsrModel for MockAsrModel {
    fn extract_features(&mut self, samples: &[f32]) -> Result<Features> {
        if self.fail_features {
            return Err(EngineError::FeatureExtraction {
                message: "mock feature failure".to_string(),
            });
        }
        Ok(Features::Pcm(samples.to_vec()))
    }

    fn generate(&mut self, features: &Features, options: &GenerationOptions) -> Result<Vec<u32>> {
        if let Some(countdown) = &self.panic_countdown {
            if countdown.fetch_sub(1, Ordering::SeqCst) <= 0 {
                panic!("mock model panic");
            }
        }
        if self.fail_generate {
            return Err(EngineError::Inference {
                message: "mock generate failure".to_string(),
            });
        }
        if let Some(remaining) = &self.fail_generate_remaining {
            if remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(EngineError::Inference {
                    message: "mock transient generate failure".to_string(),
                });
            }
        }
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let chain = self.chain_for(features)?;
        // A verified prefix never changes the output: the chain is the
        // model's own argmax trajectory and the prefix is a piece of it.
        let header_len = chain
            .iter()
            .take_while(|&&t| t >= defaults::FIRST_SPECIAL_TOKEN && t < defaults::FIRST_TIMESTAMP_TOKEN)
            .count();
        let limit = (header_len + options.max_new_tokens).min(chain.len());
        Ok(chain[..limit].to_vec())
    }

    fn forward(&mut self, features: &Features, decoder_input_ids: &[u32]) -> Result<Logits> {
        if self.fail_forward {
            return Err(EngineError::Inference {
                message: "mock forward failure".to_string(),
            });
        }
        let chain = self.chain_for(features)?;
        let seq_len = decoder_input_ids.len();
        let mut data = vec![0.0f32; seq_len * self.vocab_size];
        for position in 0..seq_len {
            // Prediction after seeing decoder_input_ids[..=position]: the
            // chain continues only while the prefix actually matches it.
            let prefix_matches = decoder_input_ids[..=position]
                .iter()
                .zip(chain.iter())
                .all(|(a, b)| a == b)
                && position < chain.len();
            let predicted = if prefix_matches && position + 1 < chain.len() {
                chain[position + 1]
            } else {
                defaults::EOT_TOKEN
            };
            data[position * self.vocab_size + predicted as usize] = 1.0;
        }
        Logits::new(data, seq_len, self.vocab_size)
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        let words: Vec<String> = tokens
            .iter()
            .filter(|&&t| !(skip_special_tokens && t >= defaults::FIRST_SPECIAL_TOKEN))
            .map(|t| {
                self.vocab
                    .get(t)
                    .cloned()
                    .unwrap_or_else(|| format!("w{t}"))
            })
            .collect();
        Ok(words.join(" "))
    }
}

type MockBuilder = dyn Fn(u8) -> MockAsrModel + Send + Sync;

/// Factory that builds [`MockAsrModel`] instances per tier.
pub struct MockModelFactory {
    builder: Arc<MockBuilder>,
    fail_levels: Vec<u8>,
    load_counts: std::sync::Mutex<HashMap<u8, u32>>,
}

impl MockModelFactory {
    /// Factory producing the default mock for every tier.
    pub fn new() -> Self {
        Self::with_builder(|_| MockAsrModel::new())
    }

    /// Factory delegating to a per-level builder. The builder is called
    /// again when a tier is restarted, so it can vary behavior by call
    /// count if a test needs a crash-once model.
    pub fn with_builder(builder: impl Fn(u8) -> MockAsrModel + Send + Sync + 'static) -> Self {
        Self {
            builder: Arc::new(builder),
            fail_levels: Vec::new(),
            load_counts: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Make loading fail for a tier level.
    pub fn with_load_failure(mut self, level: u8) -> Self {
        self.fail_levels.push(level);
        self
    }

    /// How many times a model was loaded for `level`.
    pub fn load_count(&self, level: u8) -> u32 {
        *self.load_counts.lock().unwrap().get(&level).unwrap_or(&0)
    }
}

impl Default for MockModelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AsrModelFactory for MockModelFactory {
    fn load(&self, tier: &TierConfig, observer: &dyn LoadObserver) -> Result<Box<dyn AsrModel>> {
        *self
            .load_counts
            .lock()
            .unwrap()
            .entry(tier.level)
            .or_insert(0) += 1;
        if self.fail_levels.contains(&tier.level) {
            return Err(EngineError::ModelLoad {
                model_id: "mock".to_string(),
                message: format!("load failure injected for tier {}", tier.level),
            });
        }
        observer.progress(1.0, None);
        Ok(Box::new((self.builder)(tier.level)))
    }
}
