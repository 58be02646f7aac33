//! Speculative draft verification.
//!
//! One forward pass of the downstream model over the upstream draft tells us
//! how many draft tokens the downstream model's own argmax chain agrees
//! with. Generation then resumes from the agreed prefix instead of from an
//! empty prompt. The final output is always the downstream model's argmax
//! chain, so verification is a latency optimization only.

use crate::asr::{AsrModel, Features};
use serde::Serialize;

/// Outcome counters for one verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SpecStats {
    /// Draft tokens the model agreed with.
    pub verified: usize,
    /// Draft tokens offered for verification (draft length minus the
    /// leading token, which is given, not predicted).
    pub total: usize,
}

impl SpecStats {
    pub fn hit_rate(&self) -> f32 {
        self.verified as f32 / self.total.max(1) as f32
    }
}

/// A verified draft prefix ready to seed generation.
#[derive(Debug, Clone)]
pub struct VerifiedPrefix {
    /// `draft[0]` plus every verified token, in order.
    pub tokens: Vec<u32>,
    pub stats: SpecStats,
}

/// Checks how much of `draft` the model would have produced itself.
///
/// Runs a single forward pass with the full draft as decoder input and
/// walks the per-position argmax until the first disagreement. Any model
/// error counts as zero verified tokens; the caller falls back to normal
/// generation and the output is never affected.
pub fn verify_draft(
    model: &mut dyn AsrModel,
    features: &Features,
    draft: &[u32],
) -> VerifiedPrefix {
    let total = draft.len().saturating_sub(1);
    let unverified = VerifiedPrefix {
        tokens: draft.first().map(|&t| vec![t]).unwrap_or_default(),
        stats: SpecStats { verified: 0, total },
    };
    if draft.len() < 2 {
        return unverified;
    }

    let logits = match model.forward(features, draft) {
        Ok(logits) => logits,
        Err(_) => return unverified,
    };

    let mut verified = 0usize;
    for position in 0..total {
        match logits.argmax(position) {
            Some(predicted) if predicted == draft[position + 1] => verified += 1,
            _ => break,
        }
    }

    VerifiedPrefix {
        tokens: draft[..=verified].to_vec(),
        stats: SpecStats { verified, total },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::{GenerationOptions, MockAsrModel};
    use crate::defaults;

    fn window() -> Vec<f32> {
        vec![0.1; defaults::SAMPLE_RATE as usize]
    }

    #[test]
    fn test_full_draft_verifies_when_chains_agree() {
        let mut model = MockAsrModel::with_script(|_| vec![50_258, 10, 11, 12, 13]);
        let features = model.extract_features(&window()).unwrap();

        let result = verify_draft(&mut model, &features, &[50_258, 10, 11, 12]);
        assert_eq!(result.stats, SpecStats { verified: 3, total: 3 });
        assert_eq!(result.tokens, vec![50_258, 10, 11, 12]);
        assert!((result.stats.hit_rate() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_verification_stops_at_first_mismatch() {
        let mut model = MockAsrModel::with_script(|_| vec![50_258, 10, 11, 12]);
        let features = model.extract_features(&window()).unwrap();

        // Draft diverges at the third token.
        let result = verify_draft(&mut model, &features, &[50_258, 10, 99, 12]);
        assert_eq!(result.stats, SpecStats { verified: 1, total: 3 });
        assert_eq!(result.tokens, vec![50_258, 10]);
    }

    #[test]
    fn test_zero_verified_on_immediate_divergence() {
        let mut model = MockAsrModel::with_script(|_| vec![50_258, 10, 11]);
        let features = model.extract_features(&window()).unwrap();

        let result = verify_draft(&mut model, &features, &[50_258, 99, 98]);
        assert_eq!(result.stats, SpecStats { verified: 0, total: 2 });
        assert_eq!(result.tokens, vec![50_258]);
    }

    #[test]
    fn test_short_draft_is_trivially_unverified() {
        let mut model = MockAsrModel::new();
        let features = model.extract_features(&window()).unwrap();

        let result = verify_draft(&mut model, &features, &[50_258]);
        assert_eq!(result.stats, SpecStats { verified: 0, total: 0 });
        assert_eq!(result.tokens, vec![50_258]);

        let result = verify_draft(&mut model, &features, &[]);
        assert_eq!(result.stats, SpecStats { verified: 0, total: 0 });
        assert!(result.tokens.is_empty());
    }

    #[test]
    fn test_forward_error_verifies_nothing() {
        let mut model = MockAsrModel::with_script(|_| vec![50_258, 10, 11]).with_forward_failure();
        let features = Features::Pcm(window());

        let result = verify_draft(&mut model, &features, &[50_258, 10, 11]);
        assert_eq!(result.stats, SpecStats { verified: 0, total: 2 });
        assert_eq!(result.tokens, vec![50_258]);
    }

    #[test]
    fn test_verified_count_never_exceeds_total() {
        // Draft longer than the model's own chain: the tail cannot verify.
        let mut model = MockAsrModel::with_script(|_| vec![50_258, 10]);
        let features = model.extract_features(&window()).unwrap();

        let result = verify_draft(&mut model, &features, &[50_258, 10, 11, 12]);
        assert!(result.stats.verified <= result.stats.total);
        assert_eq!(result.stats.verified, 1);
    }

    #[test]
    fn test_generation_from_verified_prefix_matches_plain_generation() {
        // The argmax-chain law: generating from the verified prefix yields
        // the same sequence as generating from scratch.
        let chain = vec![50_258u32, 20, 21, 22, 23];
        let mut model = MockAsrModel::with_script(move |_| chain.clone());
        let features = model.extract_features(&window()).unwrap();

        let plain = model
            .generate(&features, &GenerationOptions {
                max_new_tokens: 16,
                ..Default::default()
            })
            .unwrap();

        let prefix = verify_draft(&mut model, &features, &[50_258, 20, 21]);
        let seeded = model
            .generate(&features, &GenerationOptions {
                max_new_tokens: 16,
                decoder_input_ids: Some(prefix.tokens),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(plain, seeded);
    }
}
