//! Speech recognition model adapters.

pub mod adapter;
pub mod validate;
#[cfg(feature = "whisper")]
pub mod whisper;

pub use adapter::{
    AsrModel, AsrModelFactory, Features, GenerationOptions, LoadObserver, Logits, MockAsrModel,
    MockModelFactory, NullObserver, Task,
};
pub use validate::{validate_quantization, QuantizationCheck};
#[cfg(feature = "whisper")]
pub use whisper::{WhisperAsr, WhisperFactory};
