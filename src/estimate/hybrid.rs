//! Beam search plus importance sampling
//!
//! The beam contributes its exact excluded-term mass. Sampled paths then only
//! count the steps where their prefix fell outside that step's beam, so the sum
//! of the two parts estimates the hit probability without double counting.

use crate::error::Result;
use crate::estimate::artifact::{ResultRecord, Tensor};
use crate::estimate::beam::beam_search;
use crate::estimate::importance::sample_paths;
use crate::estimate::query::QueryConfig;
use crate::estimate::{prefix_mean, Estimator};
use crate::inference::truncation::population_variance;
use crate::model::SequenceModel;
use rand::rngs::StdRng;
use tracing::debug;

pub struct HybridEstimator;

impl Estimator for HybridEstimator {
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

        let trace = beam_search(query, model, query.num_beams, true)?;
        let batch = sample_paths(
            query,
            model,
            rng,
            query.truncation.clone(),
            num_paths,
            Some(&trace.prefixes),
        )?;

        let lb = trace.lower_bound;
        let is_estimates: Vec<f64> = checkpoints
            .iter()
            .map(|&n| prefix_mean(&batch.estimates, n))
            .collect();
        let sample_estimates: Vec<f64> = is_estimates
            .iter()
            .map(|&is| query.event.apply(lb + is))
            .collect();
        let model_iters: Vec<f64> = checkpoints
            .iter()
            .map(|&n| {
                let sampled: usize = batch.path_iters[..n.min(num_paths)].iter().sum();
                (trace.model_iters + sampled) as f64
            })
            .collect();
        let mean = query
            .event
            .apply(lb + prefix_mean(&batch.estimates, num_paths));
        let var = population_variance(&batch.estimates);

        let scale = if num_paths > 0 { 1.0 / num_paths as f64 } else { 0.0 };
        let intermediate: Vec<f64> = trace
            .intermediate
            .iter()
            .zip(batch.intermediate.iter())
            .map(|(&beam, &sampled)| beam + sampled * scale)
            .collect();

        debug!(
            "hybrid over L={}: beam bound {:.6e} + sampled {:.6e}",
            query.seq_len,
            lb,
            prefix_mean(&batch.estimates, num_paths)
        );

        Ok(ResultRecord::new()
            .with("bs_lower_bound", Tensor::vector(vec![lb; checkpoints.len()]))
            .with("is_estimates", Tensor::vector(is_estimates))
            .with("sample_estimates", Tensor::vector(sample_estimates))
            .with("model_iters", Tensor::vector(model_iters))
            .with(
                "intermediate_query_probs",
                Tensor::matrix(query.seq_len, query.vocab_size, intermediate),
            )
            .with("sample_estimate_var", Tensor::scalar(var))
            .with("sample_estimate_mean", Tensor::scalar(mean))
            .with("num_beams", Tensor::scalar(query.num_beams as f64))
            .with("num_mc_samples", Tensor::scalar(num_paths as f64)))
    }
}
