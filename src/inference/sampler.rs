//! Proposal distributions for importance sampling
//!
//! The proposal at each step is the model's next-token distribution restricted
//! to tokens outside the excluded set, optionally reshaped by Top-K / Top-P or
//! adaptive minimum-variance truncation.

use crate::inference::truncation::{min_variance_top_k, top_k_top_p_filtering, LogitKind};
use rand::rngs::StdRng;
use rand::Rng;

/// Truncation applied to the restricted proposal before sampling
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Truncation {
    pub top_k: usize,
    pub top_p: f32,
    /// Use the adaptive minimum-variance filter instead of Top-K / Top-P
    pub min_variance: bool,
    pub min_var_reduction: f32,
}

impl Truncation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.min_variance || self.top_k > 0 || self.top_p > 0.0
    }
}

/// Draws continuation tokens from a restricted, optionally truncated proposal
pub struct ProposalSampler {
    truncation: Truncation,
}

impl ProposalSampler {
    pub fn new(truncation: Truncation) -> Self {
        Self { truncation }
    }

    /// Build the proposal `q` from model probabilities `p`.
    ///
    /// Excluded tokens get zero mass; returns `None` when nothing is left to
    /// sample (every token excluded, truncated or of zero probability).
    pub fn propose(&self, probs: &[f64], excluded: &[bool]) -> Option<Vec<f64>> {
        let mut q: Vec<f64> = probs
            .iter()
            .zip(excluded.iter())
            .map(|(&p, &ex)| if ex { 0.0 } else { p })
            .collect();
        let total: f64 = q.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return None;
        }
        for v in q.iter_mut() {
            *v /= total;
        }

        if self.truncation.is_active() {
            // Filter only over the support so zero-mass tokens don't skew the split
            let support: Vec<usize> = (0..q.len()).filter(|&i| q[i] > 0.0).collect();
            let log_q: Vec<f32> = support.iter().map(|&i| q[i].ln() as f32).collect();
            let filtered = if self.truncation.min_variance {
                min_variance_top_k(&log_q, self.truncation.min_var_reduction)
            } else {
                top_k_top_p_filtering(
                    &log_q,
                    self.truncation.top_k,
                    self.truncation.top_p,
                    LogitKind::LogProbs,
                )
            };
            for (&i, v) in support.iter().zip(filtered.iter()) {
                if *v == f32::NEG_INFINITY {
                    q[i] = 0.0;
                }
            }
            let kept: f64 = q.iter().sum();
            if kept <= 0.0 {
                return None;
            }
            for v in q.iter_mut() {
                *v /= kept;
            }
        }

        Some(q)
    }

    /// Sample an index from a normalized distribution
    pub fn sample(&self, probs: &[f64], rng: &mut StdRng) -> usize {
        sample_from_probs(probs, rng)
    }
}

/// Inverse-CDF draw from a normalized distribution
pub fn sample_from_probs(probs: &[f64], rng: &mut StdRng) -> usize {
    let r: f64 = rng.random();
    let mut cumulative = 0.0f64;
    let mut last_nonzero = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumulative += p;
        last_nonzero = i;
        if r < cumulative {
            return i;
        }
    }
    last_nonzero
}

/// Softmax of logits into f64 probabilities
pub fn softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }
    let mut probs: Vec<f64> = logits.iter().map(|&v| ((v - max) as f64).exp()).collect();
    let sum: f64 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= sum;
    }
    probs
}

/// Compute log-softmax of logits, returning log-probabilities
pub fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum_exp: f64 = logits.iter().map(|&x| ((x - max) as f64).exp()).sum();
    let log_sum_exp = max as f64 + sum_exp.ln();
    logits.iter().map(|&x| x as f64 - log_sum_exp).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_propose_excludes_and_renormalizes() {
        let sampler = ProposalSampler::new(Truncation::none());
        let q = sampler
            .propose(&[0.5, 0.25, 0.25], &[true, false, false])
            .unwrap();
        assert_eq!(q[0], 0.0);
        assert!((q[1] - 0.5).abs() < 1e-12);
        assert!((q[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_propose_everything_excluded() {
        let sampler = ProposalSampler::new(Truncation::none());
        assert!(sampler.propose(&[0.5, 0.5], &[true, true]).is_none());
    }

    #[test]
    fn test_propose_with_top_k() {
        let sampler = ProposalSampler::new(Truncation {
            top_k: 1,
            ..Truncation::default()
        });
        let q = sampler
            .propose(&[0.1, 0.6, 0.3], &[false, false, false])
            .unwrap();
        assert_eq!(q, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_sample_from_point_mass() {
        let mut rng = StdRng::seed_from_u64(7);
        let probs = vec![0.0, 0.0, 1.0, 0.0];
        for _ in 0..100 {
            assert_eq!(sample_from_probs(&probs, &mut rng), 2);
        }
    }

    #[test]
    fn test_same_seed_same_draws() {
        let probs = vec![0.2, 0.3, 0.5];
        let mut a = StdRng::seed_from_u64(11);
        let mut b = StdRng::seed_from_u64(11);
        let xs: Vec<usize> = (0..50).map(|_| sample_from_probs(&probs, &mut a)).collect();
        let ys: Vec<usize> = (0..50).map(|_| sample_from_probs(&probs, &mut b)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_log_softmax_sums_to_one() {
        let log_probs = log_softmax(&[2.0, 1.0, 0.5, -1.0, 3.0]);
        let sum: f64 = log_probs.iter().map(|lp| lp.exp()).sum();
        assert!((sum - 1.0).abs() < 1e-9, "probabilities sum to {}", sum);
    }

    #[test]
    fn test_softmax_uniform() {
        let probs = softmax(&[1.0, 1.0, 1.0, 1.0]);
        for p in probs {
            assert!((p - 0.25).abs() < 1e-12);
        }
    }
}
