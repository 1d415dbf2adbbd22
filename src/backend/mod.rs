//! Model backend contract.
//!
//! The engine treats the model as an opaque collaborator behind the
//! [`ModelBackend`] trait: it asks for prefill and decode forward passes
//! and gets `[batch, vocab]` logits back. How the backend computes them -
//! and how it writes into the KV arenas - is its own business. A backend
//! may be pure CPU; the engine assumes nothing beyond these calls.

pub mod stub;

pub use stub::StubBackend;

use crate::config::SamplingParams;
use crate::core::batch::Batch;
use crate::core::tensor::Logits;
use crate::error::Result;

/// Capability set the engine requires from a model backend.
///
/// `prefill` and `decode` return logits whose rows align to
/// `batch.requests` in order.
pub trait ModelBackend: Send {
    /// Whether the model is ready to serve forward passes.
    fn is_loaded(&self) -> bool;

    /// Advisory warm-up; called once before first use.
    fn warmup(&mut self) {}

    /// Consume every prompt in the batch and populate KV state.
    /// `token_ids` is all prompt tokens concatenated in batch-row order.
    fn prefill(&mut self, batch: &Batch, token_ids: &[u32]) -> Result<Logits>;

    /// One decode step: consume one token per request, reusing KV state.
    fn decode(&mut self, batch: &Batch, last_tokens: &[u32]) -> Result<Logits>;

    /// Optional backend-side sampling. `None` routes the row to the core
    /// sampler.
    fn sample_token(&mut self, _logits: &[f32], _params: &SamplingParams) -> Option<u32> {
        None
    }

    fn hidden_size(&self) -> usize;

    fn num_layers(&self) -> usize;

    fn vocab_size(&self) -> usize;
}
