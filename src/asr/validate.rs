//! Post-load quantization validation.
//!
//! Loading succeeds even when the artifacts do not match the requested
//! precision, so after a model comes up we inspect what the backend reports
//! and which files it actually loaded, and surface the outcome as a status
//! message. The outcome never blocks operation.

use crate::config::ComputeDtype;

/// Result of comparing requested precision against the loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationCheck {
    /// Reported dtype and file names agree with the request.
    Ok,
    /// Not enough information to confirm either way.
    Uncertain,
    /// The loaded artifacts contradict the request.
    Mismatch,
}

impl QuantizationCheck {
    /// Human-readable status line for the sink.
    pub fn describe(&self, requested: ComputeDtype) -> String {
        let name = match requested {
            ComputeDtype::F32 => "f32",
            ComputeDtype::F16 => "f16",
            ComputeDtype::Q8 => "q8",
            ComputeDtype::Q4 => "q4",
        };
        match self {
            QuantizationCheck::Ok => format!("quantization check ok ({name})"),
            QuantizationCheck::Uncertain => {
                format!("quantization check inconclusive for {name}")
            }
            QuantizationCheck::Mismatch => {
                format!("loaded model does not match requested {name} precision")
            }
        }
    }
}

fn file_tags(files: &[String]) -> (bool, bool, bool) {
    let lower: Vec<String> = files.iter().map(|f| f.to_lowercase()).collect();
    let has_q8 = lower.iter().any(|f| f.contains("q8"));
    let has_q4 = lower.iter().any(|f| f.contains("q4"));
    let has_gguf = lower.iter().any(|f| f.ends_with(".gguf"));
    (has_q8, has_q4, has_gguf)
}

/// Compares the requested precision with the backend's reported dtype and
/// the file names it loaded.
pub fn validate_quantization(
    requested: ComputeDtype,
    reported_dtype: &str,
    loaded_files: &[String],
) -> QuantizationCheck {
    let reported = reported_dtype.to_lowercase();
    let (has_q8, has_q4, has_gguf) = file_tags(loaded_files);

    match requested {
        ComputeDtype::Q8 => {
            if has_q8 || reported.contains("q8") {
                QuantizationCheck::Ok
            } else if loaded_files.is_empty() && reported.is_empty() {
                QuantizationCheck::Uncertain
            } else {
                QuantizationCheck::Mismatch
            }
        }
        ComputeDtype::Q4 => {
            if has_q4 || reported.contains("q4") {
                QuantizationCheck::Ok
            } else if loaded_files.is_empty() && reported.is_empty() {
                QuantizationCheck::Uncertain
            } else {
                QuantizationCheck::Mismatch
            }
        }
        ComputeDtype::F16 => {
            if has_gguf || has_q8 || has_q4 {
                QuantizationCheck::Mismatch
            } else if reported == "f16" {
                QuantizationCheck::Ok
            } else if reported == "f32" {
                QuantizationCheck::Mismatch
            } else {
                QuantizationCheck::Uncertain
            }
        }
        ComputeDtype::F32 => {
            if has_gguf || has_q8 || has_q4 {
                QuantizationCheck::Mismatch
            } else if reported == "f32" {
                QuantizationCheck::Ok
            } else if reported == "f16" {
                QuantizationCheck::Mismatch
            } else {
                QuantizationCheck::Uncertain
            }
        }
    }
}
