//! Error types for cortexstream.

use thiserror::Error;

/// Result type alias for cortexstream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cortexstream.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid construction parameters - aborts initialization.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sampling parameters failed validation at submission.
    #[error("invalid sampling parameters: {0}")]
    InvalidSamplingParams(String),

    /// No contiguous free run of the requested size.
    #[error("out of KV cache blocks: requested {requested} contiguous, {free} free")]
    AllocatorOom { requested: usize, free: usize },

    /// A sequence hit its per-allocation token capacity.
    #[error("KV capacity exhausted for request {0}")]
    CacheCapacity(String),

    /// Fault raised by the model backend during prefill or decode.
    #[error("backend failure: {0}")]
    Backend(String),

    /// Request id not known to the scheduler or cache.
    #[error("request {0} not found")]
    RequestNotFound(String),

    /// Sampler received input it cannot work with.
    #[error("sampler error: {0}")]
    Sampler(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
