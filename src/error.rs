//! Error types for cascade-stt.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // Configuration errors, rejected at start before anything initializes.
    #[error("Unknown tier level {level}: levels 0-4 are supported")]
    UnknownTier { level: u8 },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Unsupported quantization: {message}")]
    UnsupportedQuantization { message: String },

    #[error("Configuration error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Model errors
    #[error("Model load failed for {model_id}: {message}")]
    ModelLoad { model_id: String, message: String },

    #[error("Feature extraction failed: {message}")]
    FeatureExtraction { message: String },

    #[error("Inference failed: {message}")]
    Inference { message: String },

    #[error("Token decode failed: {message}")]
    Decode { message: String },

    // Audio source errors
    #[error("Audio source failed: {message}")]
    AudioSource { message: String },

    // Engine lifecycle errors
    #[error("Tier {level} worker is not available")]
    TierUnavailable { level: u8 },

    #[error("Engine is not running")]
    NotRunning,

    #[error("No tier could be started")]
    NoServingTier,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_unknown_tier_display() {
        let error = EngineError::UnknownTier { level: 7 };
        assert_eq!(
            error.to_string(),
            "Unknown tier level 7: levels 0-4 are supported"
        );
    }

    #[test]
    fn test_config_invalid_value_display() {
        let error = EngineError::ConfigInvalidValue {
            key: "chunk_size_s".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for chunk_size_s: must be positive"
        );
    }

    #[test]
    fn test_model_load_display() {
        let error = EngineError::ModelLoad {
            model_id: "openai/whisper-base".to_string(),
            message: "download failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Model load failed for openai/whisper-base: download failed"
        );
    }

    #[test]
    fn test_inference_display() {
        let error = EngineError::Inference {
            message: "out of memory".to_string(),
        };
        assert_eq!(error.to_string(), "Inference failed: out of memory");
    }

    #[test]
    fn test_tier_unavailable_display() {
        let error = EngineError::TierUnavailable { level: 2 };
        assert_eq!(error.to_string(), "Tier 2 worker is not available");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: EngineError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("not = valid = toml").unwrap_err();
        let error: EngineError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<EngineError>();
        assert_sync::<EngineError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
