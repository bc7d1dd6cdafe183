//! Estimator registry
//!
//! The four estimator families form a closed enum. Each variant carries a
//! static artifact contract (names plus aggregation mode) and is bound to a
//! strategy implementing `Estimator::estimate`.

pub mod artifact;
pub mod beam;
pub mod hybrid;
pub mod importance;
pub mod query;

use crate::error::{QueryError, Result};
use crate::model::SequenceModel;
use artifact::{ArtifactSpec, ResultRecord};
use beam::BeamSearchBound;
use hybrid::HybridEstimator;
use importance::ImportanceSampler;
use query::QueryConfig;
use rand::rngs::StdRng;
use std::fmt;
use std::str::FromStr;

/// One query estimation strategy
pub trait Estimator {
    fn estimate(
        &self,
        query: &QueryConfig,
        model: &dyn SequenceModel,
        rng: &mut StdRng,
    ) -> Result<ResultRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EstimatorKind {
    /// Importance sampling from the restricted, optionally truncated proposal
    McEstimate,
    /// Untruncated importance sampling used as a reference value
    McPseudoGt,
    /// Beam search over non-excluded continuations (lower bound)
    BeamSearchLowerBound,
    /// Beam search plus importance sampling off the beam
    BeamSearchIsHybrid,
}

/// How a reference compute budget maps onto an estimator's parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetMatching {
    /// Cost split across steps gives sample checkpoints
    Sampling,
    /// Sample checkpoints are converted to equivalent beam counts
    Search,
    /// Parameters are taken from the configuration as is
    Fixed,
}

/// Checkpoint x horizon estimates, present when intermediate steps are requested
pub const INTERMEDIATE_SEQ_ARTIFACT: &str = "intermediate_seq_estimates";

const SAMPLE_ARTIFACTS: &[ArtifactSpec] = &[
    ArtifactSpec::stack("sample_estimates"),
    ArtifactSpec::stack("sample_estimate_var"),
    ArtifactSpec::stack("sample_estimate_mean"),
    ArtifactSpec::stack("model_iters"),
    ArtifactSpec::stack("num_mc_samples"),
    ArtifactSpec::concat("intermediate_query_probs"),
];

const SEARCH_ARTIFACTS: &[ArtifactSpec] = &[
    ArtifactSpec::stack("true_coverage"),
    ArtifactSpec::stack("restricted_coverage"),
    ArtifactSpec::stack("num_beams"),
    ArtifactSpec::stack("num_beams_over_time"),
    ArtifactSpec::stack("model_iters"),
    ArtifactSpec::stack("bs_lower_bound"),
    ArtifactSpec::stack("intermediate_lbs"),
];

const HYBRID_ARTIFACTS: &[ArtifactSpec] = &[
    ArtifactSpec::stack("bs_lower_bound"),
    ArtifactSpec::stack("is_estimates"),
    ArtifactSpec::stack("sample_estimates"),
    ArtifactSpec::stack("model_iters"),
    ArtifactSpec::concat("intermediate_query_probs"),
    ArtifactSpec::stack("sample_estimate_var"),
    ArtifactSpec::stack("sample_estimate_mean"),
    ArtifactSpec::stack("num_beams"),
    ArtifactSpec::stack("num_mc_samples"),
];

impl EstimatorKind {
    pub const ALL: [EstimatorKind; 4] = [
        EstimatorKind::McEstimate,
        EstimatorKind::McPseudoGt,
        EstimatorKind::BeamSearchLowerBound,
        EstimatorKind::BeamSearchIsHybrid,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EstimatorKind::McEstimate => "mc_estimate",
            EstimatorKind::McPseudoGt => "mc_pseudo_gt",
            EstimatorKind::BeamSearchLowerBound => "beam_search_lower_bound",
            EstimatorKind::BeamSearchIsHybrid => "beam_search_is_hybrid",
        }
    }

    /// Artifacts this estimator guarantees to populate
    pub fn artifacts(&self) -> &'static [ArtifactSpec] {
        match self {
            EstimatorKind::McEstimate | EstimatorKind::McPseudoGt => SAMPLE_ARTIFACTS,
            EstimatorKind::BeamSearchLowerBound => SEARCH_ARTIFACTS,
            EstimatorKind::BeamSearchIsHybrid => HYBRID_ARTIFACTS,
        }
    }

    /// Per-step x vocabulary artifact used for tail-set estimates
    pub fn intermediate_artifact(&self) -> &'static str {
        match self {
            EstimatorKind::BeamSearchLowerBound => "intermediate_lbs",
            _ => "intermediate_query_probs",
        }
    }

    pub fn budget_matching(&self) -> BudgetMatching {
        match self {
            EstimatorKind::McEstimate | EstimatorKind::McPseudoGt => BudgetMatching::Sampling,
            EstimatorKind::BeamSearchLowerBound => BudgetMatching::Search,
            EstimatorKind::BeamSearchIsHybrid => BudgetMatching::Fixed,
        }
    }

    /// Whether the estimator can report hit estimates at shorter horizons
    pub fn reports_intermediate_seqs(&self) -> bool {
        matches!(self, EstimatorKind::McEstimate | EstimatorKind::McPseudoGt)
    }

    pub fn uses_samples(&self) -> bool {
        !matches!(self, EstimatorKind::BeamSearchLowerBound)
    }

    pub fn uses_beams(&self) -> bool {
        matches!(
            self,
            EstimatorKind::BeamSearchLowerBound | EstimatorKind::BeamSearchIsHybrid
        )
    }

    /// Strategy bound to this variant
    pub fn strategy(&self) -> Box<dyn Estimator> {
        match self {
            EstimatorKind::McEstimate => Box::new(ImportanceSampler::truncated()),
            EstimatorKind::McPseudoGt => Box::new(ImportanceSampler::untruncated()),
            EstimatorKind::BeamSearchLowerBound => Box::new(BeamSearchBound),
            EstimatorKind::BeamSearchIsHybrid => Box::new(HybridEstimator),
        }
    }

    pub fn estimate(
        &self,
        query: &QueryConfig,
        model: &dyn SequenceModel,
        rng: &mut StdRng,
    ) -> Result<ResultRecord> {
        query.validate()?;
        self.strategy().estimate(query, model, rng)
    }
}

impl FromStr for EstimatorKind {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        EstimatorKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s.trim())
            .ok_or_else(|| QueryError::UnknownEstimator(s.to_string()))
    }
}

impl fmt::Display for EstimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mean of the first `n` values (zero for an empty prefix)
pub(crate) fn prefix_mean(values: &[f64], n: usize) -> f64 {
    let n = n.min(values.len());
    if n == 0 {
        return 0.0;
    }
    values[..n].iter().sum::<f64>() / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_round_trip() {
        for kind in EstimatorKind::ALL {
            assert_eq!(kind.name().parse::<EstimatorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_estimator_fails_fast() {
        let err = "tree_is_estimate".parse::<EstimatorKind>().unwrap_err();
        assert!(matches!(err, QueryError::UnknownEstimator(name) if name == "tree_is_estimate"));
    }

    #[test]
    fn test_contracts_have_unique_names() {
        for kind in EstimatorKind::ALL {
            let names: HashSet<&str> = kind.artifacts().iter().map(|s| s.name).collect();
            assert_eq!(names.len(), kind.artifacts().len(), "{kind}");
            assert!(names.contains("model_iters"), "{kind}");
            assert!(
                names.contains(kind.intermediate_artifact()),
                "{kind} lacks its intermediate artifact"
            );
        }
    }

    #[test]
    fn test_prefix_mean() {
        assert_eq!(prefix_mean(&[1.0, 2.0, 3.0], 2), 1.5);
        assert_eq!(prefix_mean(&[1.0, 2.0], 0), 0.0);
        assert_eq!(prefix_mean(&[1.0, 3.0], 10), 2.0);
    }
}
