//! Importance-sampling estimators
//!
//! Paths are drawn from the model restricted to non-excluded tokens (optionally
//! truncated). At every step a path contributes `w_t * p_t(A)`, the weighted
//! mass the model puts on the excluded set `A` given the path so far, so one
//! path estimates the probability that some excluded term appears within the
//! horizon.

use crate::error::{EstimatorError, Result};
use crate::estimate::artifact::{ResultRecord, Tensor};
use crate::estimate::query::QueryConfig;
use crate::estimate::{prefix_mean, Estimator, INTERMEDIATE_SEQ_ARTIFACT};
use crate::inference::sampler::{softmax, ProposalSampler, Truncation};
use crate::inference::truncation::population_variance;
use crate::model::{next_logits_batched, SequenceModel};
use rand::rngs::StdRng;
use std::collections::HashSet;
use tracing::debug;

/// Restricted mass below which a path has nowhere left to go
const EXHAUSTED_MASS: f64 = 1e-12;

/// Importance sampler over the restricted proposal
pub struct ImportanceSampler {
    truncate: bool,
}

impl ImportanceSampler {
    /// Honors the query's truncation settings
    pub fn truncated() -> Self {
        Self { truncate: true }
    }

    /// Ignores truncation, giving an unbiased reference estimate
    pub fn untruncated() -> Self {
        Self { truncate: false }
    }
}

/// Per-path results of one sampling pass
pub(crate) struct PathBatch {
    /// Hit-probability estimate of each path
    pub estimates: Vec<f64>,
    /// Row-major `seq_len x vocab_size` sum of weighted excluded-term mass
    pub intermediate: Vec<f64>,
    /// Model evaluations spent on each path
    pub path_iters: Vec<usize>,
    /// Per path, the weighted excluded mass contributed at each step
    pub step_estimates: Vec<Vec<f64>>,
}

struct Path {
    tokens: Vec<u32>,
    weight: f64,
    estimate: f64,
    steps: Vec<f64>,
    iters: usize,
    live: bool,
}

/// Draw `num_paths` weighted paths and accumulate their hit contributions.
///
/// With `beam_sets`, a path only contributes at step `t` when its length-`t`
/// continuation is outside `beam_sets[t]`; the beam accounts for the rest.
pub(crate) fn sample_paths(
    query: &QueryConfig,
    model: &dyn SequenceModel,
    rng: &mut StdRng,
    truncation: Truncation,
    num_paths: usize,
    beam_sets: Option<&[HashSet<Vec<u32>>]>,
) -> Result<PathBatch> {
    let vocab_size = query.vocab_size;
    let excluded = query.excluded_mask();
    let sampler = ProposalSampler::new(truncation);

    let mut paths: Vec<Path> = (0..num_paths)
        .map(|_| Path {
            tokens: Vec::with_capacity(query.seq_len),
            weight: 1.0,
            estimate: 0.0,
            steps: vec![0.0; query.seq_len],
            iters: 0,
            live: true,
        })
        .collect();
    let mut intermediate = vec![0.0f64; query.seq_len * vocab_size];

    for step in 0..query.seq_len {
        let live: Vec<usize> = (0..paths.len()).filter(|&i| paths[i].live).collect();
        if live.is_empty() {
            break;
        }
        let prefixes: Vec<Vec<u32>> = live.iter().map(|&i| query.prefix(&paths[i].tokens)).collect();
        let logits = next_logits_batched(model, &prefixes, query.max_batch_size)?;

        let row = &mut intermediate[step * vocab_size..(step + 1) * vocab_size];
        for (&i, logits) in live.iter().zip(logits.iter()) {
            let path = &mut paths[i];
            path.iters += 1;
            let probs = softmax(logits);

            let in_beam = beam_sets
                .and_then(|sets| sets.get(step))
                .is_some_and(|set| set.contains(&path.tokens));
            if !in_beam {
                for &t in &query.excluded_terms {
                    let mass = path.weight * probs[t as usize];
                    path.estimate += mass;
                    path.steps[step] += mass;
                    row[t as usize] += mass;
                }
            }

            if step + 1 == query.seq_len {
                continue;
            }
            let restricted: f64 = probs
                .iter()
                .zip(excluded.iter())
                .filter(|(_, &ex)| !ex)
                .map(|(&p, _)| p)
                .sum();
            if restricted < EXHAUSTED_MASS {
                path.live = false;
                continue;
            }
            let q = sampler
                .propose(&probs, &excluded)
                .ok_or(EstimatorError::EmptyProposal { step })?;
            let x = sampler.sample(&q, rng);
            path.weight *= probs[x] / q[x];
            if !path.weight.is_finite() {
                return Err(EstimatorError::NonFiniteWeight {
                    step,
                    weight: path.weight,
                }
                .into());
            }
            path.tokens.push(x as u32);
        }
    }

    Ok(PathBatch {
        estimates: paths.iter().map(|p| p.estimate).collect(),
        intermediate,
        path_iters: paths.iter().map(|p| p.iters).collect(),
        step_estimates: paths.into_iter().map(|p| p.steps).collect(),
    })
}

/// Hit estimates within each horizon in `intermediate_seqs`, one row per checkpoint plus
/// a final row over all paths
fn intermediate_seq_estimates(
    query: &QueryConfig,
    batch: &PathBatch,
    checkpoints: &[usize],
) -> Tensor {
    let num_paths = batch.step_estimates.len();
    let within: Vec<Vec<f64>> = query
        .intermediate_seqs
        .iter()
        .map(|&h| {
            batch
                .step_estimates
                .iter()
                .map(|steps| steps[..=h].iter().sum())
                .collect()
        })
        .collect();
    let rows: Vec<usize> = checkpoints.iter().copied().chain([num_paths]).collect();
    let data = rows
        .iter()
        .flat_map(|&n| {
            within
                .iter()
                .map(move |per_path| query.event.apply(prefix_mean(per_path, n)))
        })
        .collect();
    Tensor::matrix(rows.len(), query.intermediate_seqs.len(), data)
}

impl Estimator for ImportanceSampler {
    fn estimate(
        &self,
        query: &QueryConfig,
        model: &dyn SequenceModel,
        rng: &mut StdRng,
    ) -> Result<ResultRecord> {
        let checkpoints = query.sample_checkpoints();
        let num_paths = checkpoints
            .iter()
            .copied()
            .max()
            .unwrap_or(0)
            .max(query.num_mc_samples);
        let truncation = if self.truncate {
            query.truncation.clone()
        } else {
            Truncation::none()
        };

        let batch = sample_paths(query, model, rng, truncation, num_paths, None)?;

        let sample_estimates: Vec<f64> = checkpoints
            .iter()
            .map(|&n| query.event.apply(prefix_mean(&batch.estimates, n)))
            .collect();
        let model_iters: Vec<f64> = checkpoints
            .iter()
            .map(|&n| batch.path_iters[..n.min(num_paths)].iter().sum::<usize>() as f64)
            .collect();
        let mean = query.event.apply(prefix_mean(&batch.estimates, num_paths));
        let var = population_variance(&batch.estimates);
        let scale = if num_paths > 0 { 1.0 / num_paths as f64 } else { 0.0 };
        let intermediate: Vec<f64> = batch.intermediate.iter().map(|v| v * scale).collect();

        debug!(
            "{} paths over L={}: mean={:.6e} var={:.6e}",
            num_paths, query.seq_len, mean, var
        );

        let mut record = ResultRecord::new();
        if !query.intermediate_seqs.is_empty() {
            record = record.with(
                INTERMEDIATE_SEQ_ARTIFACT,
                intermediate_seq_estimates(query, &batch, &checkpoints),
            );
        }
        Ok(record
            .with("sample_estimates", Tensor::vector(sample_estimates))
            .with("sample_estimate_mean", Tensor::scalar(mean))
            .with("sample_estimate_var", Tensor::scalar(var))
            .with("model_iters", Tensor::vector(model_iters))
            .with("num_mc_samples", Tensor::scalar(num_paths as f64))
            .with(
                "intermediate_query_probs",
                Tensor::matrix(query.seq_len, query.vocab_size, intermediate),
            ))
    }
}
