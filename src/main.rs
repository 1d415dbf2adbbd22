//! cortexstream CLI - drives the inference runtime against the CPU stub
//! backend.
//!
//! ## Usage
//!
//! ```bash
//! # Stream tokens for two prompts through the stub backend
//! cortexstream -p "Hello, world!" -p "Second prompt" --max-tokens 16
//!
//! # Sampling knobs
//! cortexstream -p "Tell me a story" --temperature 0.8 --top-k 50 --top-p 0.9 --seed 42
//! ```
//!
//! Prompts are byte-level tokenized; the stub backend produces
//! deterministic logits, so this binary exercises the scheduler, KV cache,
//! and engine loop end to end without model weights.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::info;

use cortexstream::{
    ByteTokenizer, EngineConfig, InferenceEngine, KvCache, KvCacheConfig, Request,
    SamplingParams, Scheduler, SchedulerConfig, StubBackend, Tokenizer,
};

/// cortexstream: a continuous-batching LLM inference runtime
#[derive(Parser, Debug)]
#[command(name = "cortexstream")]
#[command(version, about, long_about = None)]
struct Args {
    /// Input prompt(s) - can be specified multiple times
    #[arg(short, long, required = true)]
    prompt: Vec<String>,

    /// Maximum tokens to generate per prompt
    #[arg(long, default_value = "32")]
    max_tokens: usize,

    /// Sampling temperature
    #[arg(short, long, default_value = "1.0")]
    temperature: f32,

    /// Top-k sampling (0 or 1 = greedy)
    #[arg(long, default_value = "1")]
    top_k: usize,

    /// Top-p (nucleus) sampling (1.0 = disabled)
    #[arg(long, default_value = "1.0")]
    top_p: f32,

    /// Repetition penalty (1.0 = disabled)
    #[arg(long, default_value = "1.0")]
    repetition_penalty: f32,

    /// Random seed for reproducible sampling (-1 = nondeterministic)
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    seed: i64,

    /// Maximum concurrent requests in the engine
    #[arg(long, default_value = "8")]
    max_batch_size: usize,

    /// Vocabulary size of the stub backend
    #[arg(long, default_value = "256")]
    vocab_size: usize,

    /// Total KV cache capacity in tokens
    #[arg(long, default_value = "4096")]
    max_total_tokens: usize,

    /// Tokens per KV block
    #[arg(long, default_value = "16")]
    block_size: usize,

    /// Print each token id as it is produced
    #[arg(long)]
    stream: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let sampling = SamplingParams {
        temperature: args.temperature,
        top_k: args.top_k,
        top_p: args.top_p,
        do_sample: false,
        repetition_penalty: args.repetition_penalty,
        seed: args.seed,
    };

    let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
        max_batch_size: args.max_batch_size,
    })?);
    let cache = KvCache::new(
        KvCacheConfig::new(2, 2, 16, args.max_total_tokens).with_block_size(args.block_size),
    )?;
    let backend = Box::new(StubBackend::new(args.vocab_size));

    let mut engine = InferenceEngine::new(
        backend,
        Arc::clone(&scheduler),
        cache,
        EngineConfig::default(),
    )
    .with_tokenizer(Box::new(ByteTokenizer::new()));
    engine.initialize()?;

    // Submit every prompt before the loop starts; an ingress thread could
    // equally feed the scheduler while the engine runs.
    let tokenizer = ByteTokenizer::new();
    let mut handles = Vec::new();
    for (i, prompt) in args.prompt.iter().enumerate() {
        let prompt_tokens = tokenizer.encode(prompt)?;
        let id = format!("req-{i}");

        let mut request = Request::new(&id, prompt_tokens)
            .with_max_tokens(args.max_tokens)
            .with_sampling(sampling.clone())
            .with_prompt_text(prompt.clone());
        if args.stream {
            let stream_id = id.clone();
            request = request.with_token_callback(Box::new(move |token, finished| {
                if finished {
                    println!("[{stream_id}] <done>");
                } else {
                    println!("[{stream_id}] token {token}");
                }
            }));
        }

        let handle = scheduler.submit(request)?;
        info!(id = %id, prompt_len = handle.prompt_len(), "request submitted");
        handles.push(handle);
    }

    let start = Instant::now();
    engine.run()?;
    let elapsed = start.elapsed();

    println!("═══════════════════════════════════════════════════");
    for handle in &handles {
        let generated = handle.generated_tokens();
        println!(
            "{}: {:?} ({} tokens, {:?})",
            handle.id(),
            handle.finish_reason(),
            generated.len(),
            handle.state(),
        );
        println!("  prompt: {}", handle.prompt_text().unwrap_or(""));
        println!("  tokens: {generated:?}");
        println!("  text:   {}", tokenizer.decode(&generated)?);
    }

    let stats = engine.stats();
    let tokens_per_sec = stats.tokens_processed as f64 / elapsed.as_secs_f64();
    println!("═══════════════════════════════════════════════════");
    println!("  requests completed: {}", stats.requests_completed);
    println!("  requests failed:    {}", stats.requests_failed);
    println!("  tokens generated:   {}", stats.tokens_processed);
    println!("  time:               {elapsed:.2?}");
    println!("  throughput:         {tokens_per_sec:.2} tokens/sec");

    Ok(())
}
