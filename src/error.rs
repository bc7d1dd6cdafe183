//! Error taxonomy for query estimation
//!
//! `QueryError` covers configuration and contract faults raised by the harness,
//! the budget calculator and the enumerator. Numerical trouble inside an
//! estimator body is reported as `EstimatorError` and wrapped, so callers can
//! tell the two apart by variant.

/// Faults that abort a query estimation run
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Unknown estimator: {0} (expected one of mc_estimate, mc_pseudo_gt, beam_search_lower_bound, beam_search_is_hybrid)")]
    UnknownEstimator(String),

    #[error("Ambiguous choice of excluded term: expected exactly 1, got {0}")]
    AmbiguousExcludedTerms(usize),

    #[error("Artifact '{artifact}': sample {sample} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        artifact: String,
        sample: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Artifact '{artifact}': sample {sample} has rank {found}, expected {expected}")]
    RankMismatch {
        artifact: String,
        sample: usize,
        expected: usize,
        found: usize,
    },

    #[error("No finite beam count for vocab_size={vocab_size}, num_beams={init_num_beams}: branching factor {branching} cannot absorb the overflow")]
    DegenerateBranching {
        vocab_size: usize,
        init_num_beams: usize,
        branching: usize,
    },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Enumeration of {vocab_size}^{seq_len} continuations exceeds the limit of {limit}")]
    EnumerationTooLarge {
        vocab_size: usize,
        seq_len: usize,
        limit: usize,
    },

    #[error("Estimator {estimator} did not populate artifact '{artifact}'")]
    MissingArtifact {
        estimator: &'static str,
        artifact: &'static str,
    },

    #[error("Invalid budget record: {0}")]
    InvalidBudgetRecord(String),

    #[error(transparent)]
    Model(#[from] anyhow::Error),

    #[error("Estimator failure: {0}")]
    Estimator(#[from] EstimatorError),
}

/// Numerical failures inside an estimator body
#[derive(Debug, thiserror::Error)]
pub enum EstimatorError {
    #[error("Proposal distribution is empty at step {step} (all mass truncated or excluded)")]
    EmptyProposal { step: usize },

    #[error("Non-finite importance weight {weight} at step {step}")]
    NonFiniteWeight { step: usize, weight: f64 },
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimator_error_is_distinguishable() {
        let err: QueryError = EstimatorError::EmptyProposal { step: 3 }.into();
        assert!(matches!(err, QueryError::Estimator(_)));
        assert!(err.to_string().contains("step 3"));
    }

    #[test]
    fn test_model_error_is_transparent() {
        let err: QueryError = anyhow::anyhow!("prefix too long").into();
        assert!(matches!(err, QueryError::Model(_)));
        assert_eq!(err.to_string(), "prefix too long");
    }
}
