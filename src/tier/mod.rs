//! Tier-side machinery: audio buffering, draft tokens, speculative
//! verification and the worker loop that ties them to a model.

pub mod buffer;
pub mod draft;
pub mod verifier;
pub mod worker;

pub use buffer::TierBuffer;
pub use draft::DraftBuffer;
pub use verifier::{verify_draft, SpecStats, VerifiedPrefix};
pub use worker::{spawn, WorkerOptions, WorkerRuntime};
