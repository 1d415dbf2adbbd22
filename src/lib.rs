//! cortexstream: a continuous-batching LLM inference runtime.
//!
//! This crate implements the three subsystems behind continuous batching:
//! - A request scheduler with an explicit prefill/decode state machine
//! - A block-structured paged KV cache over a pre-allocated arena
//! - A single-threaded engine loop driving a pluggable model backend,
//!   sampling tokens and streaming them to per-request callbacks
//!
//! The model itself lives behind the [`ModelBackend`] trait; a
//! deterministic CPU stub is included for tests and demos.

pub mod backend;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod tokenizer;

pub use backend::{ModelBackend, StubBackend};
pub use config::{EngineConfig, KvCacheConfig, SamplingParams, SchedulerConfig};
pub use core::batch::Batch;
pub use core::kv_cache::{KvCache, KvView};
pub use core::request::{FinishReason, Request, RequestState};
pub use core::tensor::{DType, Logits};
pub use engine::{EngineHandle, EngineStats, InferenceEngine, Sampler};
pub use error::{Error, Result};
pub use scheduler::Scheduler;
pub use tokenizer::{ByteTokenizer, HfTokenizer, Tokenizer};
