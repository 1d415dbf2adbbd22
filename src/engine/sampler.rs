//! Token sampling.
//!
//! Converts one request's logits row plus its [`SamplingParams`] and
//! generation history into a single token id. Pure apart from the sampler's
//! own RNG.
//!
//! ## Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Repetition penalty (history tokens move toward zero)
//!     │
//!     ▼ Greedy override (do_sample, or top_k = 1 with top_p = 1)
//!     │
//!     ▼ Temperature scaling
//!     │
//!     ▼ Strategy: top-k / top-p / top-k+top-p / greedy
//!     │
//!     ▼ Softmax + categorical draw
//! Selected token
//! ```

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingParams;
use crate::core::tensor::Logits;
use crate::error::{Error, Result};

/// Clamp bounds applied to shifted logits before `exp`.
const MIN_LOGIT: f32 = -1e9;
const MAX_LOGIT: f32 = 1e9;

/// Token sampler owning a deterministic RNG.
///
/// Same seed + same logits + same history gives the same token. Samplers
/// are not shared across threads; the engine keeps one per request.
#[derive(Debug)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler seeded from entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a sampler with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create a sampler from a `SamplingParams::seed` value: non-negative
    /// seeds are deterministic, -1 draws a fresh nondeterministic seed.
    pub fn from_seed_param(seed: i64) -> Self {
        if seed >= 0 {
            Self::with_seed(seed as u64)
        } else {
            Self::new()
        }
    }

    /// Reseed. `seed >= 0` is deterministic, `-1` reseeds from entropy.
    pub fn set_seed(&mut self, seed: i64) {
        self.rng = if seed >= 0 {
            StdRng::seed_from_u64(seed as u64)
        } else {
            StdRng::from_entropy()
        };
    }

    /// Sample one token from a logits row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sampler`] for an empty logits row. Degenerate
    /// distributions (non-finite or zero probability mass) are not errors;
    /// they fall back to greedy argmax over the current candidate set.
    pub fn sample(
        &mut self,
        logits: &[f32],
        params: &SamplingParams,
        history: &[u32],
    ) -> Result<u32> {
        if logits.is_empty() {
            return Err(Error::Sampler("empty logits row".into()));
        }

        let mut work = logits.to_vec();

        // Step 1: repetition penalty.
        if params.repetition_penalty > 1.0 && !history.is_empty() {
            apply_repetition_penalty(&mut work, history, params.repetition_penalty);
        }

        // Step 2: greedy override.
        if params.do_sample || (params.top_k == 1 && params.top_p >= 1.0) {
            return Ok(argmax(&work));
        }

        // Step 3: temperature. Zero temperature collapses to greedy rather
        // than dividing by zero.
        if params.temperature == 0.0 {
            return Ok(argmax(&work));
        }
        if params.temperature != 1.0 {
            for logit in &mut work {
                *logit /= params.temperature;
            }
        }

        // Step 4: strategy routing.
        let token = if params.top_k > 1 && params.top_p < 1.0 {
            self.top_kp_sample(&work, params.top_k, params.top_p)
        } else if params.top_k > 1 {
            self.top_k_sample(&work, params.top_k)
        } else if params.top_p < 1.0 {
            self.top_p_sample(&work, params.top_p)
        } else {
            argmax(&work)
        };
        Ok(token)
    }

    /// Sample one token per batch row, sequentially in row order.
    pub fn sample_batch(
        &mut self,
        logits: &Logits,
        params: &SamplingParams,
        histories: &[Vec<u32>],
    ) -> Result<Vec<u32>> {
        let mut tokens = Vec::with_capacity(logits.batch_size());
        for i in 0..logits.batch_size() {
            let row = logits
                .row(i)
                .ok_or_else(|| Error::Sampler(format!("missing logits row {i}")))?;
            let empty = Vec::new();
            let history = histories.get(i).unwrap_or(&empty);
            tokens.push(self.sample(row, params, history)?);
        }
        Ok(tokens)
    }

    /// Sample among the k largest logits.
    fn top_k_sample(&mut self, logits: &[f32], k: usize) -> u32 {
        let candidates = top_k_candidates(logits, k);
        let probs = softmax_over(&candidates);
        let choice = self.categorical(&probs);
        candidates[choice].0
    }

    /// Nucleus sampling over the full distribution.
    fn top_p_sample(&mut self, logits: &[f32], p: f32) -> u32 {
        // Softmax the whole vocabulary, then sort descending.
        let all: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as u32, l))
            .collect();
        let probs = softmax_over(&all);

        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));

        // Shortest prefix whose cumulative probability reaches p; the token
        // at the boundary is included.
        let mut cumulative = 0.0f32;
        let mut nucleus = Vec::new();
        for &idx in &order {
            cumulative += probs[idx];
            nucleus.push(idx);
            if cumulative >= p {
                break;
            }
        }

        let nucleus_probs: Vec<f32> = nucleus.iter().map(|&i| probs[i]).collect();
        let choice = self.categorical(&nucleus_probs);
        nucleus[choice] as u32
    }

    /// Top-k first, then nucleus-filter within the top-k probabilities.
    fn top_kp_sample(&mut self, logits: &[f32], k: usize, p: f32) -> u32 {
        let candidates = top_k_candidates(logits, k);
        let probs = softmax_over(&candidates);

        // Candidates are sorted descending already; keep the prefix whose
        // cumulative probability stays within p.
        let mut cumulative = 0.0f32;
        let mut cutoff = 0;
        for &prob in &probs {
            cumulative += prob;
            if cumulative > p {
                break;
            }
            cutoff += 1;
        }
        // Empty nucleus falls back to the full top-k set.
        if cutoff == 0 {
            cutoff = probs.len();
        }

        let choice = self.categorical(&probs[..cutoff]);
        candidates[choice].0
    }

    /// Draw from an unnormalized categorical distribution, falling back to
    /// the largest weight when the mass is degenerate.
    fn categorical(&mut self, probs: &[f32]) -> usize {
        let sum: f32 = probs.iter().sum();
        if sum <= 0.0 || !sum.is_finite() {
            return argmax_index(probs);
        }
        match WeightedIndex::new(probs) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => argmax_index(probs),
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Scale logits of every token already generated toward zero: positive
/// logits are divided by the penalty, non-positive ones multiplied.
fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    let mut seen = vec![false; logits.len()];
    for &token in history {
        if let Some(flag) = seen.get_mut(token as usize) {
            *flag = true;
        }
    }
    for (logit, &was_generated) in logits.iter_mut().zip(&seen) {
        if was_generated {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

/// Index of the largest logit, ties broken by the lowest index.
fn argmax(logits: &[f32]) -> u32 {
    argmax_index(logits) as u32
}

fn argmax_index(values: &[f32]) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &value) in values.iter().enumerate() {
        if value > best_value {
            best_value = value;
            best = i;
        }
    }
    best
}

/// The k largest (token, logit) pairs, sorted descending by logit with ties
/// broken by the smaller index. Selection runs on an order statistic rather
/// than a full sort; k is clamped to the vocabulary size.
fn top_k_candidates(logits: &[f32], k: usize) -> Vec<(u32, f32)> {
    let k = k.min(logits.len());
    let mut pairs: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i as u32, l))
        .collect();

    let by_logit_desc =
        |a: &(u32, f32), b: &(u32, f32)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
    if k < pairs.len() {
        pairs.select_nth_unstable_by(k - 1, by_logit_desc);
        pairs.truncate(k);
    }
    pairs.sort_by(by_logit_desc);
    pairs
}

/// Softmax over a candidate set with max-subtract and clamping for
/// numerical stability.
fn softmax_over(candidates: &[(u32, f32)]) -> Vec<f32> {
    let max_logit = candidates
        .iter()
        .map(|&(_, l)| l)
        .fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    let mut probs: Vec<f32> = candidates
        .iter()
        .map(|&(_, l)| {
            let p = (l - max_logit).clamp(MIN_LOGIT, MAX_LOGIT).exp();
            sum += p;
            p
        })
        .collect();
    if sum > 0.0 && sum.is_finite() {
        for p in &mut probs {
            *p /= sum;
        }
    }
    probs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_candidates_order_and_ties() {
        let logits = [0.5, 2.0, 2.0, -1.0, 1.0];
        let top = top_k_candidates(&logits, 3);
        // Tie between indices 1 and 2 resolves to the smaller index first.
        assert_eq!(top[0], (1, 2.0));
        assert_eq!(top[1], (2, 2.0));
        assert_eq!(top[2], (4, 1.0));
    }

    #[test]
    fn test_top_k_clamped_to_vocab() {
        let logits = [0.1, 0.2];
        assert_eq!(top_k_candidates(&logits, 10).len(), 2);
    }

    #[test]
    fn test_softmax_is_normalized() {
        let candidates = vec![(0, 1.0f32), (1, 2.0), (2, 3.0)];
        let probs = softmax_over(&candidates);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_argmax_tie_breaks_low_index() {
        assert_eq!(argmax(&[1.0, 1.0, 1.0]), 0);
        assert_eq!(argmax(&[0.0, 3.0, 3.0]), 1);
    }

    #[test]
    fn test_repetition_penalty_asymmetry() {
        let mut logits = vec![2.0, -2.0];
        apply_repetition_penalty(&mut logits, &[0, 1], 2.0);
        assert_eq!(logits, vec![1.0, -4.0]);
    }
}
