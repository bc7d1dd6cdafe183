//! Property-based tests for budget matching, truncation and consolidation

use proptest::prelude::*;
use seq_queries::estimate::artifact::{concat, stack, Tensor};
use seq_queries::inference::budget::equivalent_beams;
use seq_queries::inference::truncation::{top_k_top_p_filtering, LogitKind};

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let lse = max + logits.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
    logits.iter().map(|&x| x - lse).collect()
}

proptest! {
    /// The matched beam count never drops below the sample budget and grows with it
    #[test]
    fn equivalent_beams_is_monotone(
        vocab_size in 3usize..64,
        init in 1usize..4000,
        seq_len in 1usize..12,
    ) {
        let here = equivalent_beams(vocab_size, init, seq_len).unwrap();
        let next = equivalent_beams(vocab_size, init + 1, seq_len).unwrap();
        prop_assert!(here >= init);
        prop_assert!(next >= here, "f({}) = {} > f({}) = {}", init, here, init + 1, next);
    }

    /// Budgets that fit in one step of branching are returned unchanged
    #[test]
    fn equivalent_beams_identity_below_branching(
        vocab_size in 2usize..512,
        seq_len in 0usize..12,
        frac in 0.0f64..1.0,
    ) {
        let init = ((vocab_size - 1) as f64 * frac) as usize;
        prop_assert_eq!(equivalent_beams(vocab_size, init, seq_len).unwrap(), init);
    }

    /// Top-K keeps at least min(k, n) outcomes and never drops one above a kept one
    #[test]
    fn top_k_keeps_the_largest(
        values in prop::collection::vec(-10.0f32..10.0, 1..64),
        k in 1usize..80,
    ) {
        let out = top_k_top_p_filtering(&values, k, 0.0, LogitKind::Logits);
        let kept: Vec<f32> = out.iter().copied().filter(|v| v.is_finite()).collect();
        prop_assert!(kept.len() >= k.min(values.len()));
        let min_kept = kept.iter().cloned().fold(f32::INFINITY, f32::min);
        for (orig, filtered) in values.iter().zip(out.iter()) {
            if *filtered == f32::NEG_INFINITY {
                prop_assert!(*orig <= min_kept);
            } else {
                prop_assert_eq!(orig, filtered);
            }
        }
    }

    /// Nucleus filtering of log-probabilities is idempotent
    #[test]
    fn nucleus_is_idempotent_on_log_probs(
        logits in prop::collection::vec(-8.0f32..8.0, 1..64),
        top_p in 0.05f32..0.99,
    ) {
        let lp = log_softmax(&logits);
        let once = top_k_top_p_filtering(&lp, 0, top_p, LogitKind::LogProbs);
        let twice = top_k_top_p_filtering(&once, 0, top_p, LogitKind::LogProbs);
        prop_assert_eq!(once, twice);
    }

    /// Concat sums leading lengths; stack succeeds only for equal shapes
    #[test]
    fn consolidation_shapes(lens in prop::collection::vec(0usize..6, 1..8)) {
        let items: Vec<Tensor> = lens.iter().map(|&n| Tensor::vector(vec![1.0; n])).collect();

        let joined = concat("sample_estimates", &items).unwrap();
        prop_assert_eq!(joined.shape(), &[lens.iter().sum::<usize>()][..]);

        let stacked = stack("sample_estimates", &items);
        if lens.iter().all(|&n| n == lens[0]) {
            let stacked = stacked.unwrap();
            prop_assert_eq!(stacked.shape(), &[lens.len(), lens[0]][..]);
        } else {
            prop_assert!(stacked.is_err());
        }
    }
}
