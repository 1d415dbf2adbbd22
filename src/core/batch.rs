//! Batch value type.
//!
//! A batch is assembled by the scheduler for a single engine iteration and
//! holds requests in one phase only: all prefilling or all decoding.

use std::sync::Arc;

use crate::core::request::Request;

/// One engine iteration's worth of requests.
#[derive(Clone, Default)]
pub struct Batch {
    /// Requests in batch-row order. Logits rows align to this order.
    pub requests: Vec<Arc<Request>>,
    /// Parallel to `requests`: prompt length during prefill, generated
    /// length + 1 during decode.
    pub sequence_lengths: Vec<usize>,
    /// Whether every member is in the prefill phase.
    pub is_prefill: bool,
}

impl Batch {
    /// Create an empty batch for the given phase.
    pub fn new(is_prefill: bool) -> Self {
        Self {
            requests: Vec::new(),
            sequence_lengths: Vec::new(),
            is_prefill,
        }
    }

    /// Add a request with its sequence length.
    pub fn push(&mut self, request: Arc<Request>, sequence_length: usize) {
        self.requests.push(request);
        self.sequence_lengths.push(sequence_length);
    }

    pub fn batch_size(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
        self.sequence_lengths.clear();
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("batch_size", &self.batch_size())
            .field("is_prefill", &self.is_prefill)
            .field("sequence_lengths", &self.sequence_lengths)
            .finish()
    }
}
