//! Integration tests for the sampler pipeline.

use cortexstream::core::tensor::Logits;
use cortexstream::engine::Sampler;
use cortexstream::SamplingParams;

fn greedy_params() -> SamplingParams {
    SamplingParams {
        temperature: 1.0,
        top_k: 1,
        top_p: 1.0,
        do_sample: false,
        repetition_penalty: 1.0,
        seed: -1,
    }
}

#[test]
fn test_greedy_on_equal_logits_returns_lowest_index() {
    let mut sampler = Sampler::new();
    let logits = vec![0.5; 16];
    let token = sampler.sample(&logits, &greedy_params(), &[]).unwrap();
    assert_eq!(token, 0);
}

#[test]
fn test_greedy_picks_argmax() {
    let mut sampler = Sampler::new();
    let logits = vec![0.1, 0.2, 5.0, 0.3];
    let token = sampler.sample(&logits, &greedy_params(), &[]).unwrap();
    assert_eq!(token, 2);
}

#[test]
fn test_do_sample_overrides_to_greedy() {
    let mut params = greedy_params();
    params.do_sample = true;
    params.top_k = 50;
    params.top_p = 0.5;

    let mut sampler = Sampler::with_seed(1);
    let logits = vec![0.1, 3.0, 0.2, 0.3];
    for _ in 0..16 {
        assert_eq!(sampler.sample(&logits, &params, &[]).unwrap(), 1);
    }
}

#[test]
fn test_returned_index_always_in_vocab() {
    let vocab = 32;
    let logits: Vec<f32> = (0..vocab).map(|i| ((i * 7919) % 13) as f32 * 0.3).collect();

    let strategies = [
        SamplingParams { top_k: 5, ..greedy_params() },
        SamplingParams { top_p: 0.7, top_k: 0, ..greedy_params() },
        SamplingParams { top_k: 8, top_p: 0.6, ..greedy_params() },
        SamplingParams { temperature: 0.3, top_k: 4, ..greedy_params() },
    ];
    for params in &strategies {
        let mut sampler = Sampler::with_seed(9);
        for _ in 0..64 {
            let token = sampler.sample(&logits, params, &[]).unwrap();
            assert!((token as usize) < vocab);
        }
    }
}

#[test]
fn test_determinism_with_fixed_seed() {
    let params = SamplingParams {
        top_k: 8,
        top_p: 0.9,
        temperature: 0.8,
        ..greedy_params()
    };
    let logits: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
    let history = vec![3, 5, 3];

    let mut a = Sampler::with_seed(1234);
    let mut b = Sampler::with_seed(1234);
    for _ in 0..32 {
        let ta = a.sample(&logits, &params, &history).unwrap();
        let tb = b.sample(&logits, &params, &history).unwrap();
        assert_eq!(ta, tb);
    }
}

#[test]
fn test_set_seed_resets_the_stream() {
    let params = SamplingParams {
        top_k: 8,
        temperature: 0.7,
        ..greedy_params()
    };
    let logits: Vec<f32> = (0..32).map(|i| (i as f32 * 0.11).cos()).collect();

    let mut sampler = Sampler::with_seed(7);
    let first: Vec<u32> = (0..8)
        .map(|_| sampler.sample(&logits, &params, &[]).unwrap())
        .collect();

    sampler.set_seed(7);
    let second: Vec<u32> = (0..8)
        .map(|_| sampler.sample(&logits, &params, &[]).unwrap())
        .collect();
    assert_eq!(first, second);
}

#[test]
fn test_top_p_nucleus_restricts_candidates() {
    // Softmax of these logits is [0.5, 0.3, 0.15, 0.05] up to rounding.
    let logits = vec![
        0.5f32.ln(),
        0.3f32.ln(),
        0.15f32.ln(),
        0.05f32.ln(),
    ];
    let params = SamplingParams {
        top_k: 0,
        top_p: 0.75,
        ..greedy_params()
    };

    // Nucleus is {0, 1}: 0.5 < 0.75 and the boundary token 1 is included.
    let mut sampler = Sampler::with_seed(99);
    let mut seen = [false; 4];
    for _ in 0..256 {
        let token = sampler.sample(&logits, &params, &[]).unwrap();
        assert!(token <= 1, "token {token} outside the nucleus");
        seen[token as usize] = true;
    }
    // Renormalized to [0.625, 0.375]; both tokens appear over 256 draws.
    assert!(seen[0] && seen[1]);
}

#[test]
fn test_top_p_boundary_probability_one() {
    // Two equal logits softmax to exactly [0.5, 0.5]; p equal to the first
    // token's probability keeps only that token.
    let logits = vec![0.0, 0.0];
    let params = SamplingParams {
        top_k: 0,
        top_p: 0.5,
        ..greedy_params()
    };

    let mut sampler = Sampler::with_seed(3);
    for _ in 0..32 {
        assert_eq!(sampler.sample(&logits, &params, &[]).unwrap(), 0);
    }
}

#[test]
fn test_top_k_restricts_candidates() {
    let logits = vec![5.0, 4.0, 3.0, -1.0, -2.0, -3.0];
    let params = SamplingParams {
        top_k: 3,
        temperature: 2.0,
        ..greedy_params()
    };

    let mut sampler = Sampler::with_seed(21);
    for _ in 0..128 {
        let token = sampler.sample(&logits, &params, &[]).unwrap();
        assert!(token <= 2, "token {token} outside the top-3 set");
    }
}

#[test]
fn test_top_k_larger_than_vocab_is_clamped() {
    let logits = vec![1.0, 0.5];
    let params = SamplingParams {
        top_k: 100,
        ..greedy_params()
    };
    let mut sampler = Sampler::with_seed(4);
    let token = sampler.sample(&logits, &params, &[]).unwrap();
    assert!(token < 2);
}

#[test]
fn test_combined_top_k_top_p() {
    let logits = vec![4.0, 3.0, 2.0, 1.0, 0.0, -1.0];
    let params = SamplingParams {
        top_k: 4,
        top_p: 0.6,
        ..greedy_params()
    };

    // Top-4 probs concentrate on token 0 (~0.64); a 0.6 cut leaves an
    // empty prefix, which falls back to the full top-k set.
    let mut sampler = Sampler::with_seed(11);
    for _ in 0..128 {
        let token = sampler.sample(&logits, &params, &[]).unwrap();
        assert!(token <= 3, "token {token} outside the top-4 set");
    }
}

#[test]
fn test_repetition_penalty_moves_logits_toward_zero() {
    // Post-penalty logits are [1.0, -4.0]; greedy picks token 0.
    let logits = vec![2.0, -2.0];
    let mut params = greedy_params();
    params.repetition_penalty = 2.0;

    let mut sampler = Sampler::new();
    let token = sampler.sample(&logits, &params, &[0, 1]).unwrap();
    assert_eq!(token, 0);
}

#[test]
fn test_repetition_penalty_can_flip_the_argmax() {
    // Token 0 leads until its history penalty halves it below token 1.
    let logits = vec![2.0, 1.5];
    let mut params = greedy_params();
    params.repetition_penalty = 2.0;

    let mut sampler = Sampler::new();
    assert_eq!(sampler.sample(&logits, &params, &[]).unwrap(), 0);
    assert_eq!(sampler.sample(&logits, &params, &[0]).unwrap(), 1);
}

#[test]
fn test_degenerate_distribution_falls_back_to_greedy() {
    // All minus infinity: no probability mass anywhere.
    let logits = vec![f32::NEG_INFINITY; 8];
    let params = SamplingParams {
        top_k: 0,
        top_p: 0.5,
        ..greedy_params()
    };
    let mut sampler = Sampler::with_seed(5);
    let token = sampler.sample(&logits, &params, &[]).unwrap();
    assert_eq!(token, 0);
}

#[test]
fn test_empty_logits_rejected() {
    let mut sampler = Sampler::new();
    assert!(sampler.sample(&[], &greedy_params(), &[]).is_err());
}

#[test]
fn test_zero_temperature_is_greedy() {
    let params = SamplingParams {
        temperature: 0.0,
        top_k: 5,
        ..greedy_params()
    };
    let mut sampler = Sampler::with_seed(2);
    let logits = vec![0.2, 0.9, 0.1];
    for _ in 0..16 {
        assert_eq!(sampler.sample(&logits, &params, &[]).unwrap(), 1);
    }
}

#[test]
fn test_sample_batch_row_order() {
    // Row 0 peaks at 0, row 1 at 1, row 2 at 2.
    let data = vec![
        9.0, 0.0, 0.0, //
        0.0, 9.0, 0.0, //
        0.0, 0.0, 9.0,
    ];
    let logits = Logits::from_vec(data, 3, 3).unwrap();

    let mut sampler = Sampler::with_seed(0);
    let tokens = sampler
        .sample_batch(&logits, &greedy_params(), &[])
        .unwrap();
    assert_eq!(tokens, vec![0, 1, 2]);
}

#[test]
fn test_sample_batch_determinism_per_row() {
    let data: Vec<f32> = (0..4 * 16).map(|i| ((i % 7) as f32) * 0.4).collect();
    let logits = Logits::from_vec(data, 4, 16).unwrap();
    let params = SamplingParams {
        top_k: 6,
        top_p: 0.9,
        ..greedy_params()
    };
    let histories = vec![vec![1], vec![2], vec![3], vec![4]];

    let mut a = Sampler::with_seed(77);
    let mut b = Sampler::with_seed(77);
    assert_eq!(
        a.sample_batch(&logits, &params, &histories).unwrap(),
        b.sample_batch(&logits, &params, &histories).unwrap()
    );
}
