//! Engine and tier configuration.
//!
//! Configuration is validated in full before any worker is spawned: a bad
//! tier level or an unsupported quantization rejects the whole start request
//! rather than leaving a partially initialized engine behind.

use crate::defaults;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Windowing discipline of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierMode {
    /// Re-transcribe a trailing window on every step of new audio. Output is
    /// a rolling hypothesis, never pinned to absolute time.
    Continuous,
    /// Consume fixed-size chunks from the front of the buffer. Output is a
    /// timestamped segment per chunk.
    Chunk,
}

/// Decoding settings for one tier's model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Beam width; 1 selects greedy decoding.
    pub beams: usize,
    /// Sample from the output distribution instead of taking the argmax.
    pub do_sample: bool,
    /// Stop beams early once every beam has finished.
    pub early_stopping: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            beams: 1,
            do_sample: false,
            early_stopping: true,
        }
    }
}

/// Configuration for a single inference tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier identifier; doubles as transcript dominance level.
    pub level: u8,
    pub mode: TierMode,
    /// Continuous only: minimum new audio, in seconds, before firing.
    pub step_size_s: f32,
    /// Chunk only: fixed window size in seconds.
    pub chunk_size_s: f32,
    /// Continuous only: trailing audio retained after a firing.
    pub context_window_s: f32,
    /// Continuous only: cap on audio fed to the model per call.
    pub max_input_window_s: f32,
    pub generation: GenerationConfig,
}

impl TierConfig {
    /// Creates a continuous tier configuration.
    pub fn continuous(level: u8, step_size_s: f32, max_input_window_s: f32, context_window_s: f32) -> Self {
        Self {
            level,
            mode: TierMode::Continuous,
            step_size_s,
            chunk_size_s: 0.0,
            context_window_s,
            max_input_window_s,
            generation: GenerationConfig::default(),
        }
    }

    /// Creates a chunk tier configuration.
    pub fn chunk(level: u8, chunk_size_s: f32, beams: usize) -> Self {
        Self {
            level,
            mode: TierMode::Chunk,
            step_size_s: 0.0,
            chunk_size_s,
            context_window_s: 0.0,
            max_input_window_s: 0.0,
            generation: GenerationConfig {
                beams,
                ..GenerationConfig::default()
            },
        }
    }

    /// Returns the stock configuration for a tier level.
    ///
    /// L0/L1 are fast continuous hypothesis tiers; L2-L4 trade latency for
    /// quality with growing chunk sizes and beam widths.
    pub fn default_for_level(level: u8) -> Result<Self> {
        match level {
            0 => Ok(Self::continuous(0, 0.5, 2.0, 0.5)),
            1 => Ok(Self::continuous(1, 1.0, 3.0, 1.0)),
            2 => Ok(Self::chunk(2, 5.0, 2)),
            3 => Ok(Self::chunk(3, 10.0, 3)),
            4 => Ok(Self::chunk(4, 20.0, 5)),
            level => Err(EngineError::UnknownTier { level }),
        }
    }

    /// Checks internal consistency of the tier parameters.
    pub fn validate(&self) -> Result<()> {
        if self.level > 4 {
            return Err(EngineError::UnknownTier { level: self.level });
        }
        match self.mode {
            TierMode::Continuous => {
                if self.level > 1 {
                    return Err(EngineError::ConfigInvalidValue {
                        key: "mode".to_string(),
                        message: format!("tier {} cannot run in continuous mode", self.level),
                    });
                }
                if self.step_size_s <= 0.0 {
                    return Err(EngineError::ConfigInvalidValue {
                        key: "step_size_s".to_string(),
                        message: "must be positive for continuous tiers".to_string(),
                    });
                }
                if self.max_input_window_s < self.step_size_s {
                    return Err(EngineError::ConfigInvalidValue {
                        key: "max_input_window_s".to_string(),
                        message: "must be at least step_size_s".to_string(),
                    });
                }
                if self.context_window_s <= 0.0 {
                    return Err(EngineError::ConfigInvalidValue {
                        key: "context_window_s".to_string(),
                        message: "must be positive for continuous tiers".to_string(),
                    });
                }
            }
            TierMode::Chunk => {
                if self.level < 2 {
                    return Err(EngineError::ConfigInvalidValue {
                        key: "mode".to_string(),
                        message: format!("tier {} cannot run in chunk mode", self.level),
                    });
                }
                if self.chunk_size_s <= 0.0 {
                    return Err(EngineError::ConfigInvalidValue {
                        key: "chunk_size_s".to_string(),
                        message: "must be positive for chunk tiers".to_string(),
                    });
                }
            }
        }
        if self.generation.beams == 0 {
            return Err(EngineError::ConfigInvalidValue {
                key: "generation.beams".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Compute device preference for model inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

/// Weight precision requested at model load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    F32,
    F16,
    /// 8-bit quantized GGUF weights.
    Q8,
    /// 4-bit quantized GGUF weights.
    Q4,
}

impl ComputeDtype {
    /// Whether this precision loads from quantized GGUF files.
    pub fn is_quantized(&self) -> bool {
        matches!(self, ComputeDtype::Q8 | ComputeDtype::Q4)
    }
}

/// Draft-token routing policy between tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Forward tokens between every adjacent pair of enabled tiers.
    AdjacentEnabled,
    /// No draft propagation; every tier decodes from scratch.
    Disabled,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// HuggingFace model id, e.g. `openai/whisper-base`.
    pub model_id: String,
    /// Language code to force, or None for auto-detection.
    pub language: Option<String>,
    pub device: DeviceKind,
    pub dtype: ComputeDtype,
    /// Levels of the tiers to run, any subset of 0-4.
    pub enabled_tiers: Vec<u8>,
    pub cascade: CascadePolicy,
    /// Namespace handed to the model adapter so concurrent engines can
    /// partition their caches.
    pub session_id: String,
    /// Cap on newly generated tokens per inference call.
    pub max_new_tokens: usize,
    /// Per-tier overrides; tiers not listed here use the stock table.
    pub tier_overrides: Vec<TierConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: defaults::DEFAULT_MODEL.to_string(),
            language: None,
            device: DeviceKind::Cpu,
            dtype: ComputeDtype::F32,
            enabled_tiers: vec![1, 2, 3, 4],
            cascade: CascadePolicy::AdjacentEnabled,
            session_id: "default".to_string(),
            max_new_tokens: defaults::DEFAULT_MAX_NEW_TOKENS,
            tier_overrides: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields use default values; invalid TOML is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolves and validates the full tier table for this configuration.
    ///
    /// Returns one validated [`TierConfig`] per enabled tier, sorted by
    /// level. Fails without side effects on any configuration error.
    pub fn resolve_tiers(&self) -> Result<Vec<TierConfig>> {
        if self.enabled_tiers.is_empty() {
            return Err(EngineError::ConfigInvalidValue {
                key: "enabled_tiers".to_string(),
                message: "at least one tier must be enabled".to_string(),
            });
        }
        if self.max_new_tokens == 0 {
            return Err(EngineError::ConfigInvalidValue {
                key: "max_new_tokens".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.dtype.is_quantized() && self.device == DeviceKind::Cuda {
            return Err(EngineError::UnsupportedQuantization {
                message: "quantized GGUF weights are not supported on CUDA".to_string(),
            });
        }

        let mut levels = self.enabled_tiers.clone();
        levels.sort_unstable();
        levels.dedup();
        if levels.len() != self.enabled_tiers.len() {
            return Err(EngineError::ConfigInvalidValue {
                key: "enabled_tiers".to_string(),
                message: "duplicate tier levels".to_string(),
            });
        }

        let mut tiers = Vec::with_capacity(levels.len());
        for level in levels {
            let tier = match self.tier_overrides.iter().find(|t| t.level == level) {
                Some(tier) => tier.clone(),
                None => TierConfig::default_for_level(level)?,
            };
            tier.validate()?;
            tiers.push(tier);
        }
        Ok(tiers)
    }
}
