//! Configuration types for cortexstream.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default block size (tokens per KV block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// End-of-sequence token id. `None` disables the EOS termination check.
    pub eos_token_id: Option<u32>,
    /// Evict the oldest decoding request on admission OOM instead of
    /// rejecting the newcomer.
    pub enable_eviction: bool,
    /// Idle back-off between iterations when no work remains (milliseconds).
    pub idle_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            eos_token_id: None,
            enable_eviction: false,
            idle_backoff_ms: 10,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of requests in the active set (and per batch).
    pub max_batch_size: usize,
}

impl SchedulerConfig {
    /// Validate construction parameters.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "max_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_batch_size: 32 }
    }
}

/// KV cache configuration.
///
/// The cache derives `total_blocks = ceil(max_total_tokens / block_size)`
/// and allocates both arenas once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheConfig {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Number of KV heads.
    pub num_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Total token capacity across all sequences.
    pub max_total_tokens: usize,
    /// Tokens per block.
    pub block_size: usize,
}

impl KvCacheConfig {
    pub fn new(
        num_layers: usize,
        num_heads: usize,
        head_dim: usize,
        max_total_tokens: usize,
    ) -> Self {
        Self {
            num_layers,
            num_heads,
            head_dim,
            max_total_tokens,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Override the block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Number of blocks the arenas are carved into.
    pub fn total_blocks(&self) -> usize {
        self.max_total_tokens.div_ceil(self.block_size)
    }

    /// Validate construction parameters.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 || self.num_heads == 0 || self.head_dim == 0 {
            return Err(Error::InvalidConfig(
                "num_layers, num_heads and head_dim must be positive".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be positive".into()));
        }
        if self.max_total_tokens == 0 {
            return Err(Error::InvalidConfig(
                "max_total_tokens must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Sampling configuration for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for scaling logits (1.0 = no change).
    pub temperature: f32,
    /// Top-k sampling (0 or 1 = disabled/greedy).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// When true, overrides the pipeline to greedy argmax.
    pub do_sample: bool,
    /// Repetition penalty (1.0 = disabled).
    pub repetition_penalty: f32,
    /// RNG seed; -1 = fresh nondeterministic seed.
    pub seed: i64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
            do_sample: false,
            repetition_penalty: 1.0,
            seed: -1,
        }
    }
}

impl SamplingParams {
    /// Check the parameter ranges. Invalid params reject the request at
    /// submission.
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(Error::InvalidSamplingParams(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(Error::InvalidSamplingParams(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.repetition_penalty < 1.0 {
            return Err(Error::InvalidSamplingParams(format!(
                "repetition_penalty must be >= 1.0, got {}",
                self.repetition_penalty
            )));
        }
        if self.seed < -1 {
            return Err(Error::InvalidSamplingParams(format!(
                "seed must be -1 or non-negative, got {}",
                self.seed
            )));
        }
        Ok(())
    }
}
