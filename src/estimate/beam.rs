//! Beam search lower bound
//!
//! Beams only ever extend with non-excluded tokens, so every beam is a prefix
//! on which the event has not happened yet. The mass each beam puts on the
//! excluded set at the next step is an exact piece of the hit probability, and
//! the sum over steps and beams bounds it from below.

use crate::error::Result;
use crate::estimate::artifact::{ResultRecord, Tensor};
use crate::estimate::query::QueryConfig;
use crate::estimate::Estimator;
use crate::inference::sampler::softmax;
use crate::model::{next_logits_batched, SequenceModel};
use rand::rngs::StdRng;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    /// Log-probability under the model
    log_p: f64,
    /// Log-probability under the model restricted to non-excluded tokens
    log_q: f64,
}

/// What one beam search run observed
pub(crate) struct BeamTrace {
    pub lower_bound: f64,
    /// Row-major `seq_len x vocab_size` excluded-term mass found by the beams
    pub intermediate: Vec<f64>,
    /// Model mass of the live beams at each step
    pub true_coverage: Vec<f64>,
    /// Restricted-model mass of the live beams at each step
    pub restricted_coverage: Vec<f64>,
    /// Live beams entering each step
    pub live_beams: Vec<usize>,
    /// Continuations held in the beam at each step (only when requested)
    pub prefixes: Vec<HashSet<Vec<u32>>>,
    pub model_iters: usize,
}

/// Run beam search of width `num_beams` over the query horizon
pub(crate) fn beam_search(
    query: &QueryConfig,
    model: &dyn SequenceModel,
    num_beams: usize,
    keep_prefixes: bool,
) -> Result<BeamTrace> {
    let vocab_size = query.vocab_size;
    let excluded = query.excluded_mask();
    let mut beams = vec![Beam {
        tokens: Vec::new(),
        log_p: 0.0,
        log_q: 0.0,
    }];

    let mut trace = BeamTrace {
        lower_bound: 0.0,
        intermediate: vec![0.0; query.seq_len * vocab_size],
        true_coverage: Vec::with_capacity(query.seq_len),
        restricted_coverage: Vec::with_capacity(query.seq_len),
        live_beams: Vec::with_capacity(query.seq_len),
        prefixes: Vec::new(),
        model_iters: 0,
    };

    for step in 0..query.seq_len {
        trace
            .true_coverage
            .push(beams.iter().map(|b| b.log_p.exp()).sum());
        trace
            .restricted_coverage
            .push(beams.iter().map(|b| b.log_q.exp()).sum());
        trace.live_beams.push(beams.len());
        if keep_prefixes {
            trace
                .prefixes
                .push(beams.iter().map(|b| b.tokens.clone()).collect());
        }
        if beams.is_empty() {
            continue;
        }

        let prefixes: Vec<Vec<u32>> = beams.iter().map(|b| query.prefix(&b.tokens)).collect();
        let logits = next_logits_batched(model, &prefixes, query.max_batch_size)?;
        trace.model_iters += beams.len();

        let last_step = step + 1 == query.seq_len;
        let row = &mut trace.intermediate[step * vocab_size..(step + 1) * vocab_size];
        let mut candidates: Vec<Beam> = Vec::new();
        for (beam, logits) in beams.iter().zip(logits.iter()) {
            let probs = softmax(logits);
            let beam_mass = beam.log_p.exp();
            for &t in &query.excluded_terms {
                let mass = beam_mass * probs[t as usize];
                row[t as usize] += mass;
                trace.lower_bound += mass;
            }
            if last_step {
                continue;
            }

            let restricted: f64 = probs
                .iter()
                .zip(excluded.iter())
                .filter(|(_, &ex)| !ex)
                .map(|(&p, _)| p)
                .sum();
            if restricted <= 0.0 {
                continue;
            }
            let log_restricted = restricted.ln();
            for (v, &p) in probs.iter().enumerate() {
                if excluded[v] || p <= 0.0 {
                    continue;
                }
                let mut tokens = beam.tokens.clone();
                tokens.push(v as u32);
                candidates.push(Beam {
                    tokens,
                    log_p: beam.log_p + p.ln(),
                    log_q: beam.log_q + p.ln() - log_restricted,
                });
            }
        }

        // Stable sort keeps lexicographic order among ties
        candidates.sort_by(|a, b| b.log_p.total_cmp(&a.log_p));
        candidates.truncate(num_beams);
        beams = candidates;
    }

    Ok(trace)
}

/// Beam search estimator; one search per beam checkpoint
pub struct BeamSearchBound;

impl Estimator for BeamSearchBound {
    fn estimate(
        &self,
        query: &QueryConfig,
        model: &dyn SequenceModel,
        _rng: &mut StdRng,
    ) -> Result<ResultRecord> {
        let checkpoints = query.beam_checkpoints();
        let mut bounds = Vec::with_capacity(checkpoints.len());
        let mut iters = Vec::with_capacity(checkpoints.len());
        let mut last = None;
        for &num_beams in &checkpoints {
            let trace = beam_search(query, model, num_beams, false)?;
            debug!(
                "beam search with {} beams: bound={:.6e} after {} evaluations",
                num_beams, trace.lower_bound, trace.model_iters
            );
            bounds.push(trace.lower_bound);
            iters.push(trace.model_iters as f64);
            last = Some(trace);
        }
        let trace = match last {
            Some(trace) => trace,
            None => beam_search(query, model, query.num_beams, false)?,
        };
        let num_beams = checkpoints.last().copied().unwrap_or(query.num_beams);

        Ok(ResultRecord::new()
            .with("bs_lower_bound", Tensor::vector(bounds))
            .with("model_iters", Tensor::vector(iters))
            .with("num_beams", Tensor::scalar(num_beams as f64))
            .with("true_coverage", Tensor::vector(trace.true_coverage))
            .with("restricted_coverage", Tensor::vector(trace.restricted_coverage))
            .with(
                "num_beams_over_time",
                Tensor::vector(trace.live_beams.iter().map(|&n| n as f64).collect()),
            )
            .with(
                "intermediate_lbs",
                Tensor::matrix(query.seq_len, query.vocab_size, trace.intermediate),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::query::tests::query;
    use crate::estimate::EstimatorKind;
    use crate::model::bigram::BigramModel;
    use crate::model::UniformModel;
    use rand::SeedableRng;

    #[test]
    fn test_full_width_search_is_exact() {
        // V=3, one excluded term: at most 2^(L-1) beams are ever needed
        let model = UniformModel::new(3);
        let q = query(EstimatorKind::BeamSearchLowerBound, 3, 3, &[1]);
        let trace = beam_search(&q, &model, 4, false).unwrap();
        let exact = 1.0 - (2.0f64 / 3.0).powi(3);
        assert!((trace.lower_bound - exact).abs() < 1e-12);
        assert_eq!(trace.model_iters, 1 + 2 + 4);
        assert_eq!(trace.live_beams, vec![1, 2, 4]);
    }

    #[test]
    fn test_live_beams_capped_by_width() {
        // Nothing excluded: every token extends every beam
        let model = UniformModel::new(3);
        let q = query(EstimatorKind::BeamSearchLowerBound, 3, 4, &[]);
        let trace = beam_search(&q, &model, 5, false).unwrap();
        assert_eq!(trace.live_beams, vec![1, 3, 5, 5]);
        assert_eq!(trace.model_iters, 1 + 3 + 5 + 5);
    }

    #[test]
    fn test_bound_grows_with_width() {
        let model = BigramModel::random(5, 21, 2.0);
        let q = query(EstimatorKind::BeamSearchLowerBound, 5, 4, &[3]);
        let narrow = beam_search(&q, &model, 1, false).unwrap();
        // 4^3 beams hold every restricted prefix, so the wide bound is exact
        let wide = beam_search(&q, &model, 64, false).unwrap();
        assert!(narrow.lower_bound <= wide.lower_bound + 1e-12);
        assert!(wide.lower_bound <= 1.0);
    }

    #[test]
    fn test_coverage_starts_full_and_shrinks() {
        let model = BigramModel::random(4, 2, 1.0);
        let q = query(EstimatorKind::BeamSearchLowerBound, 4, 4, &[0]);
        let trace = beam_search(&q, &model, 2, false).unwrap();
        assert_eq!(trace.true_coverage.len(), 4);
        assert!((trace.true_coverage[0] - 1.0).abs() < 1e-12);
        assert!((trace.restricted_coverage[0] - 1.0).abs() < 1e-12);
        for w in trace.true_coverage.windows(2) {
            assert!(w[1] <= w[0] + 1e-12);
        }
    }

    #[test]
    fn test_keeps_prefixes_per_step() {
        let model = UniformModel::new(3);
        let q = query(EstimatorKind::BeamSearchLowerBound, 3, 3, &[2]);
        let trace = beam_search(&q, &model, 2, true).unwrap();
        assert_eq!(trace.prefixes.len(), 3);
        assert!(trace.prefixes[0].contains(&Vec::new()));
        // Ties resolve lexicographically
        assert!(trace.prefixes[1].contains(&vec![0]));
        assert!(trace.prefixes[1].contains(&vec![1]));
        assert_eq!(trace.prefixes[2].len(), 2);
    }

    #[test]
    fn test_record_per_checkpoint() {
        let model = BigramModel::random(4, 6, 1.5);
        let mut q = query(EstimatorKind::BeamSearchLowerBound, 4, 3, &[2]);
        q.sub_estimates = vec![1, 3, 9];
        let mut rng = StdRng::seed_from_u64(0);
        let record = BeamSearchBound.estimate(&q, &model, &mut rng).unwrap();

        let bounds = record.get("bs_lower_bound").unwrap().data();
        assert_eq!(bounds.len(), 3);
        // Nine beams cover every restricted prefix of length two
        assert!(bounds.iter().all(|&b| b <= bounds[2] + 1e-12));
        assert_eq!(record.get("num_beams").unwrap().as_scalar(), Some(9.0));
        assert_eq!(record.get("intermediate_lbs").unwrap().shape(), &[3, 4]);
        assert_eq!(record.get("true_coverage").unwrap().shape(), &[3]);
        assert_eq!(record.get("num_beams_over_time").unwrap().data(), &[1.0, 3.0, 9.0]);
    }

    #[test]
    fn test_empty_exclusion_gives_zero_bound() {
        let model = UniformModel::new(3);
        let q = query(EstimatorKind::BeamSearchLowerBound, 3, 3, &[]);
        let trace = beam_search(&q, &model, 3, false).unwrap();
        assert_eq!(trace.lower_bound, 0.0);
    }
}
