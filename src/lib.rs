//! cascade-stt - real-time multi-tier speculative speech-to-text.
//!
//! Several inference tiers transcribe the same 16kHz mono stream at
//! different window sizes: fast continuous tiers keep a rolling hypothesis
//! fresh while slower chunk tiers pin higher-quality segments to absolute
//! time. Tokens flow down the cascade as drafts for speculative decoding,
//! and a merge engine folds every tier's output into one transcript where
//! the higher tier wins.

pub mod asr;
pub mod audio;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod tier;

pub use config::{CascadePolicy, ComputeDtype, DeviceKind, EngineConfig, TierConfig, TierMode};
pub use engine::{Engine, EngineHandle, Segment, Transcript, TranscriptSink, TranscriptUpdate};
pub use error::{EngineError, Result};
