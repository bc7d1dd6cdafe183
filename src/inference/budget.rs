//! Compute-budget matching between sampling and search estimators
//!
//! A sampling estimator with `B` samples over `L` steps spends roughly `B * L`
//! model evaluations. A beam search spends one evaluation per live beam per
//! step, but cannot keep more distinct beams than the vocabulary allows after a
//! single step. `equivalent_beams` charges the overflow across the steps that
//! remain once the branching has grown large enough to hold `B` beams.

use crate::error::{QueryError, Result};

/// Number of beams that matches the work of `init_num_beams` samples.
///
/// One vocabulary slot is reserved for the beginning-of-sequence marker, so
/// the first-step branching factor is `vocab_size - 1`.
pub fn equivalent_beams(vocab_size: usize, init_num_beams: usize, seq_len: usize) -> Result<usize> {
    let mut branching = vocab_size.saturating_sub(1);
    if init_num_beams <= branching {
        return Ok(init_num_beams);
    }
    if branching <= 1 {
        return Err(QueryError::DegenerateBranching {
            vocab_size,
            init_num_beams,
            branching,
        });
    }

    let mut extra_compute = 0usize;
    let mut rem_seq_len = seq_len;
    while init_num_beams > branching {
        extra_compute += init_num_beams - branching;
        branching = branching.saturating_mul(branching);
        rem_seq_len = rem_seq_len.saturating_sub(1);
    }

    Ok(init_num_beams + extra_compute.div_ceil(rem_seq_len.max(1)))
}

/// Split each cumulative reference cost evenly across `seq_len` steps.
///
/// `model_iters[j]` is the number of model evaluations a reference estimator
/// spent to reach its j-th checkpoint; the result is the per-step count
/// `ceil(model_iters[j] / seq_len)` for each checkpoint.
pub fn sub_estimates_from_budget(model_iters: &[usize], seq_len: usize) -> Result<Vec<usize>> {
    if seq_len == 0 {
        return Err(QueryError::InvalidQuery(
            "continuation length must be positive".to_string(),
        ));
    }
    if model_iters.is_empty() {
        return Err(QueryError::InvalidBudgetRecord(
            "sample has no recorded model iterations".to_string(),
        ));
    }
    if model_iters.windows(2).any(|w| w[1] < w[0]) {
        return Err(QueryError::InvalidBudgetRecord(format!(
            "model iterations must be non-decreasing, got {:?}",
            model_iters
        )));
    }
    Ok(model_iters.iter().map(|&iters| iters.div_ceil(seq_len)).collect())
}

/// Beam checkpoints matching a reference record entry
pub fn beam_checkpoints_from_budget(
    model_iters: &[usize],
    vocab_size: usize,
    seq_len: usize,
) -> Result<Vec<usize>> {
    sub_estimates_from_budget(model_iters, seq_len)?
        .into_iter()
        .map(|init| equivalent_beams(vocab_size, init, seq_len))
        .collect()
}
