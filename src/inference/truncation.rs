//! Categorical truncation: fixed Top-K / Top-P (nucleus) and adaptive minimum-variance
//!
//! Both filters return a copy of the input in which every removed outcome is set
//! to `f32::NEG_INFINITY`, so it vanishes under a later softmax or `exp`.

use std::cmp::Ordering;

/// How the input vector of a filter is expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogitKind {
    /// Unnormalized logits; nucleus masses come from a softmax
    Logits,
    /// Log-probabilities; nucleus masses come from `exp`
    LogProbs,
}

/// Filter a distribution with Top-K and/or nucleus (Top-P) truncation.
///
/// `top_k > 0` keeps every outcome whose value is at least the k-th largest, so
/// ties at the threshold survive and the kept set may exceed k. `top_p > 0`
/// then keeps the smallest descending prefix whose cumulative mass first
/// exceeds `top_p`; the outcome that crosses the threshold is kept, and the
/// single most likely outcome is always kept.
///
/// Re-applying the filter is a no-op only for `LogitKind::LogProbs`. In
/// `Logits` mode the surviving outcomes are renormalized by the softmax, so a
/// second pass can truncate further.
pub fn top_k_top_p_filtering(values: &[f32], top_k: usize, top_p: f32, kind: LogitKind) -> Vec<f32> {
    let mut out = values.to_vec();
    let top_k = top_k.min(out.len());

    if top_k > 0 {
        let mut sorted = out.clone();
        sorted.sort_by(|a, b| descending(*a, *b));
        let threshold = sorted[top_k - 1];
        for v in out.iter_mut() {
            if *v < threshold {
                *v = f32::NEG_INFINITY;
            }
        }
    }

    if top_p > 0.0 && !out.is_empty() {
        let order = descending_order(&out);
        let sorted: Vec<f32> = order.iter().map(|&i| out[i]).collect();
        let masses: Vec<f64> = match kind {
            LogitKind::LogProbs => sorted.iter().map(|&v| (v as f64).exp()).collect(),
            LogitKind::Logits => softmax_f64(&sorted),
        };

        // Removal mask shifted right by one: rank j is dropped once the mass of
        // ranks [0, j) already exceeds top_p.
        let mut cumulative = 0.0f64;
        let mut crossed = false;
        for (rank, &idx) in order.iter().enumerate() {
            if rank > 0 && crossed {
                out[idx] = f32::NEG_INFINITY;
            }
            cumulative += masses[rank];
            crossed = cumulative > top_p as f64;
        }
    }

    out
}

/// Adaptive minimum-variance truncation over log-probabilities.
///
/// Sorts outcomes by probability, finds the interior split `i*` minimizing
/// `var(head) + var(tail)` and removes every outcome ranked at or after `i*`
/// when that split reduces the population variance by at least
/// `min_var_reduction`. Distributions with fewer than three outcomes have no
/// interior split and come back unchanged.
pub fn min_variance_top_k(log_probs: &[f32], min_var_reduction: f32) -> Vec<f32> {
    let mut out = log_probs.to_vec();
    let n = out.len();
    if n < 3 {
        return out;
    }

    let order = descending_order(&out);
    let probs: Vec<f64> = order.iter().map(|&i| (out[i] as f64).exp()).collect();
    let global_var = population_variance(&probs);

    let mut prefix_sum = vec![0.0f64; n + 1];
    let mut prefix_sq = vec![0.0f64; n + 1];
    for (i, &p) in probs.iter().enumerate() {
        prefix_sum[i + 1] = prefix_sum[i] + p;
        prefix_sq[i + 1] = prefix_sq[i] + p * p;
    }
    let range_var = |lo: usize, hi: usize| -> f64 {
        let len = (hi - lo) as f64;
        let mean = (prefix_sum[hi] - prefix_sum[lo]) / len;
        ((prefix_sq[hi] - prefix_sq[lo]) / len - mean * mean).max(0.0)
    };

    let mut best_split = 1;
    let mut best_var = f64::INFINITY;
    for split in 1..n - 1 {
        let local = range_var(0, split) + range_var(split, n);
        if local < best_var {
            best_var = local;
            best_split = split;
        }
    }

    if split_reduces_variance(best_var, global_var, min_var_reduction as f64) {
        for &idx in &order[best_split..] {
            out[idx] = f32::NEG_INFINITY;
        }
    }
    out
}

/// Truncation criterion of the adaptive filter.
///
/// A split qualifies when it strictly lowers the variance and the ratio
/// `local / global` is at most `1 - min_var_reduction`. A split that is exactly
/// as good as the baseline, or a zero baseline, never qualifies.
pub fn split_reduces_variance(local_var: f64, global_var: f64, min_var_reduction: f64) -> bool {
    global_var > 0.0 && local_var < global_var && local_var / global_var <= 1.0 - min_var_reduction
}

/// Population (biased) variance
pub fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

fn descending(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Indices sorted by value, largest first (stable for ties)
fn descending_order(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| descending(values[a], values[b]));
    order
}

fn softmax_f64(values: &[f32]) -> Vec<f64> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![0.0; values.len()];
    }
    let exps: Vec<f64> = values.iter().map(|&v| ((v - max) as f64).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ln(probs: &[f64]) -> Vec<f32> {
        probs.iter().map(|&p| (p.ln()) as f32).collect()
    }

    fn kept(values: &[f32]) -> Vec<usize> {
        values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_top_k_keeps_two_largest() {
        let out = top_k_top_p_filtering(&[1.0, 2.0, 3.0, 4.0], 2, 0.0, LogitKind::Logits);
        assert_eq!(out[0], f32::NEG_INFINITY);
        assert_eq!(out[1], f32::NEG_INFINITY);
        assert_eq!(out[2], 3.0);
        assert_eq!(out[3], 4.0);
    }

    #[test]
    fn test_top_k_keeps_ties_at_threshold() {
        let out = top_k_top_p_filtering(&[1.0, 3.0, 3.0, 2.0], 1, 0.0, LogitKind::Logits);
        assert_eq!(kept(&out), vec![1, 2]);
    }

    #[test]
    fn test_top_k_larger_than_vocab_is_clamped() {
        let input = [0.5, -1.0, 2.0];
        let out = top_k_top_p_filtering(&input, 10, 0.0, LogitKind::Logits);
        assert_eq!(out, input.to_vec());
    }

    #[test]
    fn test_disabled_filters_are_identity() {
        let input = [0.1, 0.7, -3.0, 2.5];
        assert_eq!(top_k_top_p_filtering(&input, 0, 0.0, LogitKind::Logits), input.to_vec());
    }

    #[test]
    fn test_nucleus_keeps_crossing_outcome() {
        // cumulative mass 0.5, 0.8, 1.0: the 0.3 outcome crosses 0.6 and is kept
        let input = ln(&[0.3, 0.5, 0.2]);
        let out = top_k_top_p_filtering(&input, 0, 0.6, LogitKind::LogProbs);
        assert_eq!(kept(&out), vec![0, 1]);
    }

    #[test]
    fn test_nucleus_always_keeps_top_outcome() {
        let input = ln(&[0.2, 0.5, 0.3]);
        let out = top_k_top_p_filtering(&input, 0, 0.01, LogitKind::LogProbs);
        assert_eq!(kept(&out), vec![1]);
    }

    #[test]
    fn test_nucleus_over_logits_uses_softmax() {
        // softmax([2, 1, 0]) = [0.665, 0.245, 0.090]
        let out = top_k_top_p_filtering(&[2.0, 1.0, 0.0], 0, 0.5, LogitKind::Logits);
        assert_eq!(kept(&out), vec![0]);
        let out = top_k_top_p_filtering(&[2.0, 1.0, 0.0], 0, 0.8, LogitKind::Logits);
        assert_eq!(kept(&out), vec![0, 1]);
    }

    #[test]
    fn test_nucleus_is_idempotent_over_log_probs() {
        let input = ln(&[0.05, 0.4, 0.25, 0.2, 0.1]);
        let once = top_k_top_p_filtering(&input, 0, 0.7, LogitKind::LogProbs);
        let twice = top_k_top_p_filtering(&once, 0, 0.7, LogitKind::LogProbs);
        assert_eq!(once, twice);
        assert_eq!(kept(&once), vec![1, 2, 3]);
    }

    #[test]
    fn test_nucleus_over_logits_shrinks_on_reapplication() {
        let input = ln(&[0.5, 0.3, 0.2]);
        let once = top_k_top_p_filtering(&input, 0, 0.6, LogitKind::Logits);
        assert_eq!(kept(&once), vec![0, 1]);
        // Renormalized, the top outcome alone holds 0.625 > 0.6
        let twice = top_k_top_p_filtering(&once, 0, 0.6, LogitKind::Logits);
        assert_eq!(kept(&twice), vec![0]);
    }

    #[test]
    fn test_top_k_then_top_p() {
        let input = ln(&[0.1, 0.4, 0.3, 0.2]);
        let out = top_k_top_p_filtering(&input, 3, 0.5, LogitKind::LogProbs);
        assert_eq!(kept(&out), vec![1, 2]);
    }

    #[test]
    fn test_min_variance_truncates_at_elbow() {
        let input = ln(&[0.03, 0.45, 0.04, 0.45, 0.03]);
        let out = min_variance_top_k(&input, 0.5);
        assert_eq!(kept(&out), vec![1, 3]);
    }

    #[test]
    fn test_min_variance_respects_threshold() {
        let input = ln(&[0.03, 0.45, 0.04, 0.45, 0.03]);
        let out = min_variance_top_k(&input, 0.9999);
        assert_eq!(out, input);
    }

    #[test]
    fn test_min_variance_uniform_is_untouched() {
        let input = ln(&[0.25; 4]);
        assert_eq!(min_variance_top_k(&input, 0.0), input);
    }

    #[test]
    fn test_min_variance_small_input_is_untouched() {
        let input = ln(&[0.9, 0.1]);
        assert_eq!(min_variance_top_k(&input, 0.0), input);
    }

    #[test]
    fn test_split_boundary_means_no_truncation() {
        assert!(!split_reduces_variance(0.5, 0.5, 0.0));
        assert!(split_reduces_variance(0.4, 0.5, 0.0));
        assert!(split_reduces_variance(0.35, 0.5, 0.3));
        assert!(!split_reduces_variance(0.4, 0.5, 0.3));
        assert!(!split_reduces_variance(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_population_variance() {
        assert_eq!(population_variance(&[]), 0.0);
        assert!((population_variance(&[1.0, 3.0]) - 1.0).abs() < 1e-12);
    }
}
