//! CPU stub backend.
//!
//! A deterministic stand-in for a real accelerator backend, used by the
//! demo binary and the integration tests. Row `i` of its logits puts the
//! maximum at vocab index `i % vocab_size`, so a greedy engine run is fully
//! predictable without model weights.

use tracing::debug;

use crate::core::batch::Batch;
use crate::core::tensor::Logits;
use crate::error::{Error, Result};

use super::ModelBackend;

/// How the stub fills each logits row.
#[derive(Debug, Clone)]
enum LogitPattern {
    /// Row `i` has a single spike at index `i % vocab_size`.
    RowArgmax,
    /// Every row is this fixed vector (length = vocab_size).
    Fixed(Vec<f32>),
}

/// Deterministic CPU backend stub.
pub struct StubBackend {
    hidden_size: usize,
    num_layers: usize,
    vocab_size: usize,
    pattern: LogitPattern,
    loaded: bool,
    warmed: bool,
    fail_on_call: Option<usize>,
    forward_calls: usize,
}

impl StubBackend {
    /// Stub with row-indexed argmax logits.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            hidden_size: 64,
            num_layers: 2,
            vocab_size,
            pattern: LogitPattern::RowArgmax,
            loaded: true,
            warmed: false,
            fail_on_call: None,
            forward_calls: 0,
        }
    }

    /// Stub whose every row is the given fixed logits vector.
    pub fn with_fixed_logits(logits: Vec<f32>) -> Self {
        let vocab_size = logits.len();
        Self {
            pattern: LogitPattern::Fixed(logits),
            ..Self::new(vocab_size)
        }
    }

    /// A stub that reports itself unloaded; initialization must refuse it.
    pub fn unloaded(vocab_size: usize) -> Self {
        Self {
            loaded: false,
            ..Self::new(vocab_size)
        }
    }

    /// Make the next forward pass fail with a backend error.
    pub fn fail_next_forward(&mut self) {
        self.fail_on_call = Some(self.forward_calls + 1);
    }

    /// Make the `call`-th forward pass (1-based, prefill and decode
    /// combined) fail with a backend error.
    pub fn fail_on_forward(&mut self, call: usize) {
        self.fail_on_call = Some(call);
    }

    /// Number of prefill + decode calls served.
    pub fn forward_calls(&self) -> usize {
        self.forward_calls
    }

    pub fn warmed(&self) -> bool {
        self.warmed
    }

    fn forward(&mut self, batch: &Batch) -> Result<Logits> {
        if !self.loaded {
            return Err(Error::Backend("model not loaded".into()));
        }
        if self.fail_on_call == Some(self.forward_calls + 1) {
            self.fail_on_call = None;
            return Err(Error::Backend("injected fault".into()));
        }
        self.forward_calls += 1;

        let batch_size = batch.batch_size();
        let mut logits = Logits::zeros(batch_size, self.vocab_size);
        for i in 0..batch_size {
            let Some(row) = logits.row_mut(i) else {
                continue;
            };
            match &self.pattern {
                LogitPattern::RowArgmax => {
                    row[i % self.vocab_size] = 1.0;
                }
                LogitPattern::Fixed(fixed) => {
                    row.copy_from_slice(fixed);
                }
            }
        }
        Ok(logits)
    }
}

impl ModelBackend for StubBackend {
    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn warmup(&mut self) {
        self.warmed = true;
    }

    fn prefill(&mut self, batch: &Batch, token_ids: &[u32]) -> Result<Logits> {
        debug!(
            batch_size = batch.batch_size(),
            num_tokens = token_ids.len(),
            "stub prefill"
        );
        self.forward(batch)
    }

    fn decode(&mut self, batch: &Batch, last_tokens: &[u32]) -> Result<Logits> {
        debug!(
            batch_size = batch.batch_size(),
            num_tokens = last_tokens.len(),
            "stub decode"
        );
        self.forward(batch)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
