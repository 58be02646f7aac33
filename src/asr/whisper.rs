//! Candle-based Whisper adapter.
//!
//! Downloads model artifacts from HuggingFace on first use, then runs the
//! encoder-decoder with greedy, sampled or beam-search decoding. The decoder
//! is also exposed as a raw forward pass so the speculative verifier can
//! score draft tokens against this model's own logits.

use crate::asr::adapter::{AsrModel, AsrModelFactory, Features, GenerationOptions, Logits, LoadObserver};
use crate::asr::validate::validate_quantization;
use crate::config::{ComputeDtype, DeviceKind, EngineConfig, TierConfig};
use crate::defaults;
use crate::error::{EngineError, Result};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;
use tokenizers::Tokenizer;

/// Language codes in Whisper vocabulary order; the token id of language `i`
/// is `language_token_start + i`.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su", "yue",
];

/// Quantized GGUF file names to probe, best match first.
fn gguf_candidates(dtype: ComputeDtype) -> &'static [&'static str] {
    match dtype {
        ComputeDtype::Q8 => &["model-q8_0.gguf", "model.q8_0.gguf", "model-q8.gguf"],
        ComputeDtype::Q4 => &["model-q4k.gguf", "model-q4_0.gguf", "model.q4_0.gguf"],
        _ => &[],
    }
}

fn fetch(
    repo: &hf_hub::api::sync::ApiRepo,
    model_id: &str,
    observer: &dyn LoadObserver,
    loaded: &mut Vec<String>,
    name: &str,
    progress: f32,
) -> Result<std::path::PathBuf> {
    observer.progress(progress, Some(name));
    let path = repo
        .get(name)
        .map_err(|e| model_err(model_id, format!("download {name}: {e}")))?;
    loaded.push(name.to_string());
    Ok(path)
}

fn model_err(model_id: &str, message: impl std::fmt::Display) -> EngineError {
    EngineError::ModelLoad {
        model_id: model_id.to_string(),
        message: message.to_string(),
    }
}

fn inference_err(message: impl std::fmt::Display) -> EngineError {
    EngineError::Inference {
        message: message.to_string(),
    }
}

/// Normal or quantized Whisper weights behind one dispatch point.
enum Model {
    Normal(m::model::Whisper),
    Quantized(m::quantized_model::Whisper),
}

impl Model {
    fn config(&self) -> &Config {
        match self {
            Model::Normal(model) => &model.config,
            Model::Quantized(model) => &model.config,
        }
    }

    fn encoder_forward(&mut self, mel: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(model) => model.encoder.forward(mel, flush),
            Model::Quantized(model) => model.encoder.forward(mel, flush),
        }
    }

    fn decoder_forward(
        &mut self,
        tokens: &Tensor,
        audio_features: &Tensor,
        flush: bool,
    ) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(model) => model.decoder.forward(tokens, audio_features, flush),
            Model::Quantized(model) => model.decoder.forward(tokens, audio_features, flush),
        }
    }

    fn decoder_final_linear(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(model) => model.decoder.final_linear(hidden),
            Model::Quantized(model) => model.decoder.final_linear(hidden),
        }
    }
}

/// Special token ids resolved from the tokenizer, with the stock
/// multilingual ids as fallback for vocabularies missing the added tokens.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    language_start: u32,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Self {
        let lookup = |token: &str, fallback: u32| tokenizer.token_to_id(token).unwrap_or(fallback);
        let sot = lookup("<|startoftranscript|>", 50_258);
        Self {
            sot,
            eot: lookup("<|endoftext|>", defaults::EOT_TOKEN),
            transcribe: lookup("<|transcribe|>", 50_359),
            no_timestamps: lookup("<|notimestamps|>", 50_363),
            language_start: lookup("<|en|>", sot + 1),
        }
    }

    fn language_token(&self, tokenizer: &Tokenizer, code: &str) -> Option<u32> {
        tokenizer
            .token_to_id(&format!("<|{code}|>"))
            .or_else(|| {
                LANGUAGES
                    .iter()
                    .position(|&l| l == code)
                    .map(|index| self.language_start + index as u32)
            })
    }
}

/// Triangular mel filterbank on the HTK mel scale, laid out
/// `[mel][frequency]` as `pcm_to_mel` expects.
fn mel_filterbank(num_mels: usize, num_freqs: usize, sample_rate: u32) -> Vec<f32> {
    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10.0f32.powf(mel / 2595.0) - 1.0);

    let mel_max = hz_to_mel(sample_rate as f32 / 2.0);
    let hz_points: Vec<f32> = (0..=num_mels + 1)
        .map(|i| mel_to_hz(mel_max * i as f32 / (num_mels + 1) as f32))
        .collect();

    let fft_size = (num_freqs - 1) * 2;
    let bin_points: Vec<usize> = hz_points
        .iter()
        .map(|&f| ((fft_size as f32 + 1.0) * f / sample_rate as f32).floor() as usize)
        .collect();

    let mut filters = vec![0.0f32; num_mels * num_freqs];
    for mel in 0..num_mels {
        let (left, center, right) = (bin_points[mel], bin_points[mel + 1], bin_points[mel + 2]);
        for freq in left..center.min(num_freqs) {
            let denom = (center - left) as f32;
            if denom > 0.0 {
                filters[mel * num_freqs + freq] = (freq - left) as f32 / denom;
            }
        }
        for freq in center..right.min(num_freqs) {
            let denom = (right - center) as f32;
            if denom > 0.0 {
                filters[mel * num_freqs + freq] = (right - freq) as f32 / denom;
            }
        }
    }
    filters
}

/// Whisper model bound to one tier.
pub struct WhisperAsr {
    model: Model,
    tokenizer: Tokenizer,
    device: Device,
    mel_filters: Vec<f32>,
    special: SpecialTokens,
    rng: rand::rngs::StdRng,
}

impl WhisperAsr {
    fn encode(&mut self, features: &Features) -> Result<Tensor> {
        let mel = match features {
            Features::Mel(tensor) => tensor,
            Features::Pcm(_) => {
                return Err(inference_err("whisper adapter cannot consume raw PCM features"))
            }
        };
        self.model
            .encoder_forward(mel, true)
            .map_err(|e| inference_err(format!("encoder forward: {e}")))
    }

    /// Logits for every position of `tokens`, shape `(len, vocab)`.
    fn decoder_logits(&mut self, tokens: &[u32], audio_features: &Tensor) -> Result<Tensor> {
        let input = Tensor::new(tokens, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| inference_err(format!("decoder input tensor: {e}")))?;
        let hidden = self
            .model
            .decoder_forward(&input, audio_features, true)
            .map_err(|e| inference_err(format!("decoder forward: {e}")))?;
        self.model
            .decoder_final_linear(&hidden)
            .and_then(|logits| logits.squeeze(0))
            .map_err(|e| inference_err(format!("final linear: {e}")))
    }

    /// Log-probabilities of the last position of `tokens`.
    fn last_position_logits(&mut self, tokens: &[u32], audio_features: &Tensor) -> Result<Vec<f32>> {
        let logits = self.decoder_logits(tokens, audio_features)?;
        let last = logits
            .get(tokens.len() - 1)
            .and_then(|row| row.to_dtype(DType::F32))
            .and_then(|row| row.to_vec1::<f32>())
            .map_err(|e| inference_err(format!("extract last logits: {e}")))?;
        Ok(last)
    }

    fn detect_language(&mut self, audio_features: &Tensor) -> Result<u32> {
        let logits = self.last_position_logits(&[self.special.sot], audio_features)?;
        let start = self.special.language_start as usize;
        let end = (start + LANGUAGES.len()).min(logits.len());
        let best = logits[start..end]
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(index, _)| start + index)
            .unwrap_or(start);
        Ok(best as u32)
    }

    /// Builds the decoder prompt: SOT, language, task, notimestamps.
    fn build_prompt(&mut self, options: &GenerationOptions, audio_features: &Tensor) -> Result<Vec<u32>> {
        let language_token = match options.language.as_deref() {
            Some(code) => self
                .special
                .language_token(&self.tokenizer, code)
                .ok_or_else(|| EngineError::ConfigInvalidValue {
                    key: "language".to_string(),
                    message: format!("unknown language code {code}"),
                })?,
            None => self.detect_language(audio_features)?,
        };
        Ok(vec![
            self.special.sot,
            language_token,
            self.special.transcribe,
            self.special.no_timestamps,
        ])
    }

    fn greedy_decode(
        &mut self,
        audio_features: &Tensor,
        initial_tokens: &[u32],
        max_total_tokens: usize,
        do_sample: bool,
    ) -> Result<Vec<u32>> {
        let mut tokens = initial_tokens.to_vec();
        while tokens.len() < max_total_tokens {
            let logits = self.last_position_logits(&tokens, audio_features)?;
            let next = if do_sample {
                self.sample_token(&logits)?
            } else {
                argmax(&logits)
            };
            if next == self.special.eot {
                break;
            }
            tokens.push(next);
        }
        Ok(tokens)
    }

    fn sample_token(&mut self, logits: &[f32]) -> Result<u32> {
        let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
        let distribution =
            WeightedIndex::new(&weights).map_err(|e| inference_err(format!("sampling: {e}")))?;
        Ok(distribution.sample(&mut self.rng) as u32)
    }

    fn beam_decode(
        &mut self,
        audio_features: &Tensor,
        initial_tokens: &[u32],
        max_total_tokens: usize,
        beam_size: usize,
        early_stopping: bool,
    ) -> Result<Vec<u32>> {
        struct Beam {
            tokens: Vec<u32>,
            score: f32,
            finished: bool,
        }

        let mut beams = vec![Beam {
            tokens: initial_tokens.to_vec(),
            score: 0.0,
            finished: false,
        }];

        while beams.iter().any(|b| !b.finished) {
            if beams[0].tokens.len() >= max_total_tokens {
                break;
            }
            let mut candidates: Vec<Beam> = Vec::new();
            for beam in &beams {
                if beam.finished {
                    candidates.push(Beam {
                        tokens: beam.tokens.clone(),
                        score: beam.score,
                        finished: true,
                    });
                    continue;
                }
                let logits = self.last_position_logits(&beam.tokens, audio_features)?;
                for (token, log_prob) in top_log_probs(&logits, beam_size) {
                    let mut tokens = beam.tokens.clone();
                    let finished = token == self.special.eot;
                    if !finished {
                        tokens.push(token);
                    }
                    candidates.push(Beam {
                        tokens,
                        score: beam.score + log_prob,
                        finished,
                    });
                }
            }
            candidates.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            candidates.truncate(beam_size);
            let best_finished = candidates.first().map(|b| b.finished).unwrap_or(true);
            beams = candidates;
            if early_stopping && best_finished {
                break;
            }
        }

        beams.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(beams.remove(0).tokens)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (index, &value) in logits.iter().enumerate() {
        if value > best_value {
            best = index;
            best_value = value;
        }
    }
    best as u32
}

/// Top `k` tokens with their log-probabilities under a softmax of `logits`.
fn top_log_probs(logits: &[f32], k: usize) -> Vec<(u32, f32)> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let log_sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;
    let mut indexed: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(index, &value)| (index as u32, value - log_sum))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);
    indexed
}

impl AsrModel for WhisperAsr {
    fn extract_features(&mut self, samples: &[f32]) -> Result<Features> {
        let config = self.model.config();
        // The encoder positional table expects exactly 30s of mel frames.
        let mut pcm = samples.to_vec();
        pcm.resize(m::N_SAMPLES, 0.0);

        let mel = m::audio::pcm_to_mel(config, &pcm, &self.mel_filters);
        let frames = mel.len() / config.num_mel_bins;
        let tensor = Tensor::from_vec(mel, (1, config.num_mel_bins, frames), &self.device)
            .map_err(|e| EngineError::FeatureExtraction {
                message: format!("mel tensor: {e}"),
            })?;
        Ok(Features::Mel(tensor))
    }

    fn generate(&mut self, features: &Features, options: &GenerationOptions) -> Result<Vec<u32>> {
        let audio_features = self.encode(features)?;
        let initial = match &options.decoder_input_ids {
            Some(prefix) if !prefix.is_empty() => prefix.clone(),
            _ => self.build_prompt(options, &audio_features)?,
        };
        let max_positions = self.model.config().max_target_positions;
        let max_total = (initial.len() + options.max_new_tokens).min(max_positions);

        if options.beams > 1 {
            self.beam_decode(
                &audio_features,
                &initial,
                max_total,
                options.beams,
                options.early_stopping,
            )
        } else {
            self.greedy_decode(&audio_features, &initial, max_total, options.do_sample)
        }
    }

    fn forward(&mut self, features: &Features, decoder_input_ids: &[u32]) -> Result<Logits> {
        if decoder_input_ids.is_empty() {
            return Err(inference_err("forward requires at least one decoder token"));
        }
        let audio_features = self.encode(features)?;
        let logits = self.decoder_logits(decoder_input_ids, &audio_features)?;
        let (seq_len, vocab_size) = logits
            .dims2()
            .map_err(|e| inference_err(format!("logits shape: {e}")))?;
        let data = logits
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| inference_err(format!("logits transfer: {e}")))?;
        Logits::new(data, seq_len, vocab_size)
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(|e| EngineError::Decode {
                message: e.to_string(),
            })?;
        Ok(text.trim().to_string())
    }
}

/// Factory that loads one [`WhisperAsr`] per tier from HuggingFace Hub.
pub struct WhisperFactory {
    model_id: String,
    device: DeviceKind,
    dtype: ComputeDtype,
    session_id: String,
}

impl WhisperFactory {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            model_id: config.model_id.clone(),
            device: config.device,
            dtype: config.dtype,
            session_id: config.session_id.clone(),
        }
    }

    /// Initializes the preferred device, degrading to CPU if it is absent.
    fn resolve_device(&self, observer: &dyn LoadObserver) -> Device {
        let preferred = match self.device {
            DeviceKind::Cpu => return Device::Cpu,
            DeviceKind::Cuda => Device::new_cuda(0),
            DeviceKind::Metal => Device::new_metal(0),
        };
        match preferred {
            Ok(device) => device,
            Err(e) => {
                observer.status(&format!(
                    "preferred device unavailable ({e}), falling back to CPU"
                ));
                Device::Cpu
            }
        }
    }

    /// Hub API with a per-session cache namespace so concurrent engines do
    /// not fight over partially downloaded artifacts.
    fn hub_api(&self) -> Result<Api> {
        let api = if self.session_id == "default" {
            Api::new()
        } else {
            let cache_root = hf_hub::Cache::default().path().to_path_buf();
            ApiBuilder::new()
                .with_cache_dir(cache_root.join("sessions").join(&self.session_id))
                .build()
        };
        api.map_err(|e| model_err(&self.model_id, format!("hub api init: {e}")))
    }
}

impl WhisperFactory {
    fn load_on_device(
        &self,
        device: Device,
        observer: &dyn LoadObserver,
    ) -> Result<Box<dyn AsrModel>> {
        let api = self.hub_api()?;
        let repo = api.repo(Repo::with_revision(
            self.model_id.clone(),
            RepoType::Model,
            "main".to_string(),
        ));
        let mut loaded_files: Vec<String> = Vec::new();

        let config_path = fetch(&repo, &self.model_id, observer, &mut loaded_files, "config.json", 0.1)?;
        let tokenizer_path = fetch(&repo, &self.model_id, observer, &mut loaded_files, "tokenizer.json", 0.2)?;

        let config: Config = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .map_err(|e| model_err(&self.model_id, format!("read config: {e}")))?,
        )
        .map_err(|e| model_err(&self.model_id, format!("parse config: {e}")))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| model_err(&self.model_id, format!("load tokenizer: {e}")))?;

        let (model, reported_dtype) = if self.dtype.is_quantized() {
            let mut weights = None;
            for &candidate in gguf_candidates(self.dtype) {
                observer.progress(0.4, Some(candidate));
                if let Ok(path) = repo.get(candidate) {
                    loaded_files.push(candidate.to_string());
                    weights = Some(path);
                    break;
                }
            }
            let weights = weights.ok_or_else(|| {
                model_err(&self.model_id, "no quantized GGUF weights found in repo")
            })?;
            let vb = candle_transformers::quantized_var_builder::VarBuilder::from_gguf(
                &weights, &device,
            )
            .map_err(|e| model_err(&self.model_id, format!("load gguf: {e}")))?;
            let model = m::quantized_model::Whisper::load(&vb, config.clone())
                .map_err(|e| model_err(&self.model_id, format!("build model: {e}")))?;
            let reported = if self.dtype == ComputeDtype::Q8 { "q8_0" } else { "q4_0" };
            (Model::Quantized(model), reported)
        } else {
            let weights_path = fetch(
                &repo,
                &self.model_id,
                observer,
                &mut loaded_files,
                "model.safetensors",
                0.4,
            )?;
            let dtype = if self.dtype == ComputeDtype::F16 {
                DType::F16
            } else {
                DType::F32
            };
            let vb = unsafe {
                VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, &device)
                    .map_err(|e| model_err(&self.model_id, format!("load weights: {e}")))?
            };
            let model = m::model::Whisper::load(&vb, config.clone())
                .map_err(|e| model_err(&self.model_id, format!("build model: {e}")))?;
            let reported = if dtype == DType::F16 { "f16" } else { "f32" };
            (Model::Normal(model), reported)
        };

        let check = validate_quantization(self.dtype, reported_dtype, &loaded_files);
        observer.status(&check.describe(self.dtype));

        let mel_filters = mel_filterbank(
            config.num_mel_bins,
            m::N_FFT / 2 + 1,
            defaults::SAMPLE_RATE,
        );
        let special = SpecialTokens::resolve(&tokenizer);
        observer.progress(1.0, None);

        Ok(Box::new(WhisperAsr {
            model,
            tokenizer,
            device,
            mel_filters,
            special,
            rng: rand::rngs::StdRng::seed_from_u64(299_792_458),
        }))
    }
}

impl AsrModelFactory for WhisperFactory {
    fn load(&self, _tier: &TierConfig, observer: &dyn LoadObserver) -> Result<Box<dyn AsrModel>> {
        let device = self.resolve_device(observer);
        let on_cpu = matches!(device, Device::Cpu);
        match self.load_on_device(device, observer) {
            Ok(model) => Ok(model),
            Err(e) if !on_cpu => {
                // One retry on the portable backend before the tier gives up.
                observer.status(&format!("load failed on preferred device ({e}), retrying on CPU"));
                self.load_on_device(Device::Cpu, observer)
            }
            Err(e) => Err(e),
        }
    }
}
