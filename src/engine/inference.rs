//! Inference engine.
//!
//! The engine drives the whole pipeline on a single thread: it admits
//! requests from the scheduler, runs prefill and decode passes through the
//! model backend, samples tokens, streams them to request callbacks, and
//! releases KV state on terminal transitions.
//!
//! ## Engine flow
//!
//! ```text
//!  ingress threads                     engine thread
//!  ───────────────                     ─────────────────────────────
//!  scheduler.submit ──► pending ──► accept_new_requests
//!                                        │
//!                                  build_prefill_batch ─► backend.prefill
//!                                        │                 (KV admitted)
//!                                  build_decode_batch ──► backend.decode
//!                                        │                 │
//!                                        │             sample ─► append
//!                                        │                 │
//!                                        ▼             callbacks / stops
//!                                     cleanup ◄──────── free KV
//! ```
//!
//! Errors stay local: a backend fault fails the affected batch, an
//! allocation failure fails the single admitting request, and the loop
//! keeps running either way.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::ModelBackend;
use crate::config::EngineConfig;
use crate::core::batch::Batch;
use crate::core::kv_cache::KvCache;
use crate::core::request::{FinishReason, Request};
use crate::core::tensor::Logits;
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::tokenizer::Tokenizer;

/// Counters accumulated over an engine's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    /// Tokens produced across all requests.
    pub tokens_processed: usize,
    /// Requests that reached `Finished`.
    pub requests_completed: usize,
    /// Requests that reached `Failed`.
    pub requests_failed: usize,
}

/// Cloneable control handle for a running engine.
///
/// The engine loop runs on one thread; the handle lets any other thread
/// pause, resume, or stop it.
#[derive(Clone)]
pub struct EngineHandle {
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Whether the main loop is currently executing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Make the loop exit at the next iteration boundary. `resume` and a
    /// fresh `run` call continue where it left off.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Permanently stop the loop.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Single-threaded cooperative inference engine.
///
/// Composes the scheduler, KV cache, backend, and sampler; it is the sole
/// mutator of per-request execution state after submission.
pub struct InferenceEngine {
    backend: Box<dyn ModelBackend>,
    scheduler: Arc<Scheduler>,
    cache: KvCache,
    tokenizer: Option<Box<dyn Tokenizer>>,
    config: EngineConfig,
    /// One sampler per admitted request, seeded from its params.
    samplers: HashMap<String, Sampler>,
    stats: EngineStats,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    initialized: bool,
}

impl InferenceEngine {
    pub fn new(
        backend: Box<dyn ModelBackend>,
        scheduler: Arc<Scheduler>,
        cache: KvCache,
        config: EngineConfig,
    ) -> Self {
        Self {
            backend,
            scheduler,
            cache,
            tokenizer: None,
            config,
            samplers: HashMap::new(),
            stats: EngineStats::default(),
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            initialized: false,
        }
    }

    /// Attach a tokenizer. Required for stop-string detection; the core
    /// never decodes text itself.
    pub fn with_tokenizer(mut self, tokenizer: Box<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Check collaborators and warm up the backend and cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the backend reports itself
    /// unloaded. Initialization failures are fatal; main-loop errors never
    /// are.
    pub fn initialize(&mut self) -> Result<()> {
        if !self.backend.is_loaded() {
            return Err(Error::InvalidConfig("backend reports not loaded".into()));
        }
        self.backend.warmup();
        self.cache.warmup();
        self.initialized = true;
        info!(
            vocab_size = self.backend.vocab_size(),
            num_layers = self.backend.num_layers(),
            total_blocks = self.cache.total_blocks(),
            "engine initialized"
        );
        Ok(())
    }

    /// Control handle usable from other threads.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            running: Arc::clone(&self.running),
            paused: Arc::clone(&self.paused),
            stopped: Arc::clone(&self.stopped),
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// Run the main loop until no work remains (or the handle pauses or
    /// stops it).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when called before `initialize`.
    pub fn run(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::InvalidConfig(
                "run called before initialize".into(),
            ));
        }
        self.running.store(true, Ordering::SeqCst);
        info!("engine main loop started");

        while self.scheduler.has_work()
            && !self.paused.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
        {
            self.scheduler.accept_new_requests();

            let prefill = self.scheduler.build_prefill_batch();
            if !prefill.is_empty() {
                self.process_prefill(&prefill);
            }

            let decode = self.scheduler.build_decode_batch();
            if !decode.is_empty() {
                self.process_decode(&decode);
            }

            self.cleanup();

            // Idle back-off: give ingress a beat before the loop re-checks
            // for work.
            if !self.scheduler.has_work() {
                std::thread::sleep(Duration::from_millis(self.config.idle_backoff_ms));
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            tokens = self.stats.tokens_processed,
            completed = self.stats.requests_completed,
            failed = self.stats.requests_failed,
            "engine main loop exited"
        );
        Ok(())
    }

    // ========== Prefill ==========

    fn process_prefill(&mut self, batch: &Batch) {
        // Admission first: each request needs its KV region before the
        // forward pass. Failures are per-request; survivors proceed.
        let mut admitted = Batch::new(true);
        for (request, &seq_len) in batch.requests.iter().zip(&batch.sequence_lengths) {
            if self.admit(request) {
                admitted.push(Arc::clone(request), seq_len);
            }
        }
        if admitted.is_empty() {
            return;
        }

        // All prompt tokens concatenated in batch-row order.
        let flat_tokens: Vec<u32> = admitted
            .requests
            .iter()
            .flat_map(|r| r.prompt_tokens().iter().copied())
            .collect();

        match self.call_prefill(&admitted, &flat_tokens) {
            Ok(_logits) => {
                // Decode step 1 produces the first generated token, seeded
                // from the last prompt token; the prefill logits are not
                // consumed here.
                for request in &admitted.requests {
                    self.scheduler.mark_request_ready(request.id());
                }
            }
            Err(err) => {
                warn!(%err, "prefill failed; failing batch");
                self.fail_batch(&admitted, &err);
            }
        }
    }

    /// Reserve KV for a request, evicting older decoders if the policy
    /// allows. On failure the request is marked failed and never reaches
    /// the backend.
    fn admit(&mut self, request: &Arc<Request>) -> bool {
        let prompt_len = request.prompt_len();
        loop {
            if self.cache.allocate_for(request.id(), prompt_len) {
                self.samplers.insert(
                    request.id().to_string(),
                    Sampler::from_seed_param(request.sampling().seed),
                );
                return true;
            }
            if !self.config.enable_eviction {
                break;
            }
            let Some(victim) = self.scheduler.oldest_evictable() else {
                break;
            };
            warn!(
                victim = victim.id(),
                admitting = request.id(),
                "KV pressure: evicting oldest decoding request"
            );
            victim.mark_failed("evicted");
            self.finalize_failed(&victim);
        }

        warn!(id = request.id(), "KV allocation failed; rejecting request");
        request.mark_failed("capacity: no contiguous KV block region available");
        self.finalize_failed(request);
        false
    }

    // ========== Decode ==========

    fn process_decode(&mut self, batch: &Batch) {
        // Each request's seed token: last generated, or the prompt tail
        // before the first decode step.
        let last_tokens: Vec<u32> = batch
            .requests
            .iter()
            .map(|r| r.last_token().unwrap_or(0))
            .collect();

        match self.call_decode(batch, &last_tokens) {
            Ok(logits) => self.emit_tokens(batch, &logits),
            Err(err) => {
                warn!(%err, "decode failed; failing batch");
                self.fail_batch(batch, &err);
            }
        }
    }

    fn emit_tokens(&mut self, batch: &Batch, logits: &Logits) {
        for (i, request) in batch.requests.iter().enumerate() {
            // Cancellation is observed before producing the next token.
            if request.is_cancelled() {
                self.finish_request(request, FinishReason::Cancelled);
                continue;
            }
            // A zero-token budget finishes before the first sample.
            if request.generated_len() >= request.max_tokens() {
                self.finish_request(request, FinishReason::MaxTokens);
                continue;
            }

            let token = self.sample_row(request, logits.row(i));
            request.append_token(token);
            let kv_ok = self.cache.append_token(request.id());
            self.stats.tokens_processed += 1;

            if request.streaming() {
                request.notify_token(token, false);
            }

            // Termination checks, in contract order.
            if request.stop_tokens().contains(&token) {
                self.finish_request(request, FinishReason::StopToken);
            } else if self.stop_string_hit(request) {
                self.finish_request(request, FinishReason::StopString);
            } else if self.config.eos_token_id == Some(token) {
                self.finish_request(request, FinishReason::EndOfSequence);
            } else if request.generated_len() >= request.max_tokens() {
                self.finish_request(request, FinishReason::MaxTokens);
            } else if !kv_ok {
                debug!(id = request.id(), "KV region exhausted");
                self.finish_request(request, FinishReason::Capacity);
            }
        }
    }

    /// Sample one row, preferring the backend's own sampler when it offers
    /// one. Any sampling fault falls back to token 0.
    fn sample_row(&mut self, request: &Arc<Request>, row: Option<&[f32]>) -> u32 {
        let params = request.sampling();
        let Some(row) = row else {
            warn!(id = request.id(), "missing logits row; falling back to token 0");
            return 0;
        };
        if let Some(token) = self.backend.sample_token(row, params) {
            return token;
        }
        let history = request.generated_tokens();
        let sampler = self
            .samplers
            .entry(request.id().to_string())
            .or_insert_with(|| Sampler::from_seed_param(params.seed));
        match sampler.sample(row, params, &history) {
            Ok(token) => token,
            Err(err) => {
                warn!(id = request.id(), %err, "sampler failed; falling back to token 0");
                0
            }
        }
    }

    fn stop_string_hit(&self, request: &Arc<Request>) -> bool {
        let Some(stop) = request.stop_string() else {
            return false;
        };
        let Some(tokenizer) = self.tokenizer.as_ref() else {
            return false;
        };
        match tokenizer.decode(&request.generated_tokens()) {
            Ok(text) => text.contains(stop),
            Err(_) => false,
        }
    }

    // ========== Terminal transitions ==========

    fn finish_request(&mut self, request: &Arc<Request>, reason: FinishReason) {
        request.mark_finished(reason);
        self.scheduler.mark_request_finished(request.id());
        self.cache.free_for(request.id());
        self.samplers.remove(request.id());
        request.notify_token(request.last_token().unwrap_or(0), true);
        self.stats.requests_completed += 1;
        debug!(id = request.id(), ?reason, "request finished");
    }

    /// Release a request that already carries its failure state.
    fn finalize_failed(&mut self, request: &Arc<Request>) {
        self.scheduler.mark_request_failed(request.id());
        self.cache.free_for(request.id());
        self.samplers.remove(request.id());
        request.notify_token(request.last_token().unwrap_or(0), true);
        self.stats.requests_failed += 1;
    }

    fn fail_batch(&mut self, batch: &Batch, err: &Error) {
        for request in &batch.requests {
            request.mark_failed(err.to_string());
            self.finalize_failed(request);
        }
    }

    fn cleanup(&mut self) {
        if self.cache.is_full() {
            warn!("KV cache is full");
        }
        self.scheduler.remove_finished();
    }

    // ========== Backend boundary ==========
    //
    // Backend calls may cross an FFI boundary; a panic here is converted to
    // a typed backend error instead of unwinding through the loop.

    fn call_prefill(&mut self, batch: &Batch, tokens: &[u32]) -> Result<Logits> {
        let backend = &mut self.backend;
        match catch_unwind(AssertUnwindSafe(|| backend.prefill(batch, tokens))) {
            Ok(result) => result,
            Err(_) => Err(Error::Backend("panic during prefill".into())),
        }
    }

    fn call_decode(&mut self, batch: &Batch, tokens: &[u32]) -> Result<Logits> {
        let backend = &mut self.backend;
        match catch_unwind(AssertUnwindSafe(|| backend.decode(batch, tokens))) {
            Ok(result) => result,
            Err(_) => Err(Error::Backend("panic during decode".into())),
        }
    }
}
