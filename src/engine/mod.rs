//! Inference engine.
//!
//! This module contains:
//! - InferenceEngine for orchestrating the prefill/decode loop
//! - Sampler for token selection

pub mod inference;
pub mod sampler;

pub use inference::{EngineHandle, EngineStats, InferenceEngine};
pub use sampler::Sampler;
