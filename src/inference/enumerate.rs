//! Exhaustive joint-probability enumeration
//!
//! For small `V^L` every continuation of the history can be scored. Each
//! continuation gets its proposal log-probability (the model's own path
//! probability) and the conditional log-probability of the single excluded
//! term right after it. `variance_curve` then measures how importance weights
//! behave as the lowest-probability continuations are pruned away.

use crate::error::{QueryError, Result};
use crate::inference::sampler::log_softmax;
use crate::model::{next_logits_batched, SequenceModel};
use tracing::{debug, info};

/// Largest `V^L` the enumerator will expand
pub const MAX_ENUMERATED_SEQUENCES: usize = 1 << 20;

/// Scores for every continuation, in lexicographic order of token ids
#[derive(Debug, Clone)]
pub struct JointLogProbs {
    /// Log-probability of the continuation under the model
    pub q_log_probs: Vec<f64>,
    /// Log-probability of the excluded term following the continuation
    pub p_log_cond: Vec<f64>,
}

impl JointLogProbs {
    pub fn len(&self) -> usize {
        self.q_log_probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q_log_probs.is_empty()
    }

    /// Probability that the excluded term appears exactly at position `L + 1`
    pub fn joint_probability(&self) -> f64 {
        self.q_log_probs
            .iter()
            .zip(self.p_log_cond.iter())
            .map(|(q, p)| (q + p).exp())
            .sum()
    }
}

/// Score every length-`seq_len` continuation of `history`
pub fn joint_log_probs_of_all_seqs(
    history: &[u32],
    seq_len: usize,
    model: &dyn SequenceModel,
    excluded_terms: &[u32],
    max_batch_size: usize,
) -> Result<JointLogProbs> {
    let &[term] = excluded_terms else {
        return Err(QueryError::AmbiguousExcludedTerms(excluded_terms.len()));
    };
    let vocab_size = model.vocab_size();
    if term as usize >= vocab_size {
        return Err(QueryError::InvalidQuery(format!(
            "excluded term {} outside vocab size {}",
            term, vocab_size
        )));
    }
    let too_large = || QueryError::EnumerationTooLarge {
        vocab_size,
        seq_len,
        limit: MAX_ENUMERATED_SEQUENCES,
    };
    let exponent = u32::try_from(seq_len).map_err(|_| too_large())?;
    let total = vocab_size
        .checked_pow(exponent)
        .filter(|&n| n <= MAX_ENUMERATED_SEQUENCES)
        .ok_or_else(too_large)?;

    info!(
        "Enumerating {} continuations (V={}, L={})",
        total, vocab_size, seq_len
    );

    // Level-wise expansion keeps children of one parent contiguous, so the
    // final level comes out in lexicographic order
    let mut level: Vec<(Vec<u32>, f64)> = vec![(Vec::new(), 0.0)];
    for depth in 0..seq_len {
        let prefixes: Vec<Vec<u32>> = level.iter().map(|(s, _)| with_history(history, s)).collect();
        let logits = next_logits_batched(model, &prefixes, max_batch_size)?;
        let mut next = Vec::with_capacity(level.len() * vocab_size);
        for ((tokens, log_q), row) in level.iter().zip(logits.iter()) {
            for (v, lp) in log_softmax(row).into_iter().enumerate() {
                let mut child = tokens.clone();
                child.push(v as u32);
                next.push((child, log_q + lp));
            }
        }
        debug!("depth {}: {} prefixes", depth + 1, next.len());
        level = next;
    }

    let prefixes: Vec<Vec<u32>> = level.iter().map(|(s, _)| with_history(history, s)).collect();
    let logits = next_logits_batched(model, &prefixes, max_batch_size)?;
    let p_log_cond = logits
        .iter()
        .map(|row| log_softmax(row)[term as usize])
        .collect();

    Ok(JointLogProbs {
        q_log_probs: level.into_iter().map(|(_, lq)| lq).collect(),
        p_log_cond,
    })
}

fn with_history(history: &[u32], continuation: &[u32]) -> Vec<u32> {
    let mut prefix = history.to_vec();
    prefix.extend_from_slice(continuation);
    prefix
}

/// Normalized importance-weight variance at `num_intervals` truncation depths.
///
/// Depth `k` drops the `k * N / num_intervals` continuations with the lowest
/// proposal probability (at least one always survives), renormalizes the
/// surviving proposal and takes the proposal-weighted variance of
/// `w = joint / q`. Values are divided by the untruncated variance; when that
/// is zero every entry is one.
pub fn variance_curve(q_log_probs: &[f64], p_log_cond: &[f64], num_intervals: usize) -> Vec<f64> {
    let n = q_log_probs.len().min(p_log_cond.len());
    if n == 0 || num_intervals == 0 {
        return vec![1.0; num_intervals];
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| q_log_probs[b].total_cmp(&q_log_probs[a]));

    let moments: Vec<(f64, f64)> = (0..num_intervals)
        .map(|k| {
            let depth = k * n / num_intervals;
            let kept = &order[..(n - depth).max(1)];
            let mass: f64 = kept.iter().map(|&i| q_log_probs[i].exp()).sum();
            let weighted: Vec<(f64, f64)> = kept
                .iter()
                .map(|&i| {
                    // joint / (q / mass) without dividing by an underflowed q
                    let q = q_log_probs[i].exp() / mass;
                    let w = p_log_cond[i].exp() * mass;
                    (q, w)
                })
                .collect();
            let mean: f64 = weighted.iter().map(|(q, w)| q * w).sum();
            let var: f64 = weighted.iter().map(|(q, w)| q * (w - mean).powi(2)).sum();
            (mean, var)
        })
        .collect();

    let (base_mean, base_var) = moments[0];
    if base_var <= f64::EPSILON * base_mean * base_mean {
        return vec![1.0; num_intervals];
    }
    moments.iter().map(|(_, var)| var / base_var).collect()
}

/// Enumerate every continuation and report the normalized variance curve
pub fn variance_ablation(
    history: &[u32],
    seq_len: usize,
    model: &dyn SequenceModel,
    excluded_terms: &[u32],
    num_intervals: usize,
    max_batch_size: usize,
) -> Result<Vec<f64>> {
    if num_intervals == 0 {
        return Err(QueryError::InvalidQuery(
            "variance ablation needs at least one interval".to_string(),
        ));
    }
    let joint = joint_log_probs_of_all_seqs(history, seq_len, model, excluded_terms, max_batch_size)?;
    Ok(variance_curve(&joint.q_log_probs, &joint.p_log_cond, num_intervals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bigram::BigramModel;
    use crate::model::UniformModel;

    #[test]
    fn test_uniform_curve_is_flat() {
        let model = UniformModel::new(2);
        let curve = variance_ablation(&[0], 1, &model, &[1], 4, 16).unwrap();
        assert_eq!(curve, vec![1.0; 4]);
    }

    #[test]
    fn test_constructed_curve() {
        let q: Vec<f64> = [0.7f64, 0.2, 0.1].iter().map(|v| v.ln()).collect();
        let p: Vec<f64> = [0.01f64, 0.5, 0.9].iter().map(|v| v.ln()).collect();
        let curve = variance_curve(&q, &p, 3);
        assert_eq!(curve.len(), 3);
        assert!((curve[0] - 1.0).abs() < 1e-12);
        assert!((curve[1] - 0.3643).abs() < 1e-3, "curve {:?}", curve);
        assert!(curve[2].abs() < 1e-12);
    }

    #[test]
    fn test_order_does_not_matter() {
        let q: Vec<f64> = [0.1f64, 0.7, 0.2].iter().map(|v| v.ln()).collect();
        let p: Vec<f64> = [0.9f64, 0.01, 0.5].iter().map(|v| v.ln()).collect();
        let curve = variance_curve(&q, &p, 3);
        assert!((curve[1] - 0.3643).abs() < 1e-3);
    }

    #[test]
    fn test_underflowed_proposal_stays_finite() {
        let q = vec![-1000.0, 0.5f64.ln(), 0.5f64.ln()];
        let p: Vec<f64> = [0.5f64, 0.1, 0.9].iter().map(|v| v.ln()).collect();
        let curve = variance_curve(&q, &p, 3);
        assert!(curve.iter().all(|v| v.is_finite()), "curve {:?}", curve);
        assert!((curve[0] - 1.0).abs() < 1e-12);
        assert!((curve[1] - 1.0).abs() < 1e-9);
        assert!(curve[2].abs() < 1e-12);
    }

    #[test]
    fn test_cold_model_curve_is_finite() {
        let model = BigramModel::random(3, 1, 2.0).with_temperature(1e-3);
        let curve = variance_ablation(&[0], 3, &model, &[1], 4, 64).unwrap();
        assert_eq!(curve.len(), 4);
        assert!(curve.iter().all(|v| v.is_finite()), "curve {:?}", curve);
    }

    #[test]
    fn test_proposal_sums_to_one() {
        let model = BigramModel::random(4, 17, 2.0);
        let joint = joint_log_probs_of_all_seqs(&[1, 2], 3, &model, &[3], 10).unwrap();
        assert_eq!(joint.len(), 64);
        let total: f64 = joint.q_log_probs.iter().map(|q| q.exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
        let joint_p = joint.joint_probability();
        assert!(joint_p > 0.0 && joint_p < 1.0);
    }

    #[test]
    fn test_lexicographic_order() {
        // Row for the last token 1 strongly prefers 0, everything else is flat
        let logits = vec![0.0, 0.0, 5.0, 0.0];
        let model = BigramModel::new(2, logits, 1.0).unwrap();
        let joint = joint_log_probs_of_all_seqs(&[0], 2, &model, &[0], 4).unwrap();
        // Sequences in order: 00, 01, 10, 11
        let q: Vec<f64> = joint.q_log_probs.iter().map(|v| v.exp()).collect();
        assert!((q[0] - 0.25).abs() < 1e-9);
        assert!(q[2] > q[3]);
    }

    #[test]
    fn test_requires_single_excluded_term() {
        let model = UniformModel::new(3);
        assert!(matches!(
            joint_log_probs_of_all_seqs(&[0], 2, &model, &[1, 2], 8),
            Err(QueryError::AmbiguousExcludedTerms(2))
        ));
        assert!(matches!(
            joint_log_probs_of_all_seqs(&[0], 2, &model, &[], 8),
            Err(QueryError::AmbiguousExcludedTerms(0))
        ));
    }

    #[test]
    fn test_rejects_huge_enumeration() {
        let model = UniformModel::new(1000);
        assert!(matches!(
            joint_log_probs_of_all_seqs(&[0], 3, &model, &[1], 8),
            Err(QueryError::EnumerationTooLarge { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let model = UniformModel::new(2);
        assert!(variance_ablation(&[0], 1, &model, &[1], 0, 8).is_err());
    }
}
