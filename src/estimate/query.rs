//! Per-sample query configuration
//!
//! A `QueryConfig` is built once per dataset row by the harness and handed to
//! the estimator by reference. The model is always passed separately.

use crate::error::{QueryError, Result};
use crate::estimate::EstimatorKind;
use crate::inference::sampler::Truncation;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Which probability an estimate reports.
///
/// The excluded set is always read as "any member": the tail event is the
/// first occurrence of any excluded term within the continuation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryEvent {
    /// Probability that some excluded term occurs
    #[default]
    Hit,
    /// Probability that every excluded term is avoided
    Avoid,
}

impl QueryEvent {
    pub fn apply(&self, hit_probability: f64) -> f64 {
        match self {
            QueryEvent::Hit => hit_probability,
            QueryEvent::Avoid => 1.0 - hit_probability,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueryEvent::Hit => "hit",
            QueryEvent::Avoid => "avoid",
        }
    }
}

impl FromStr for QueryEvent {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hit" => Ok(QueryEvent::Hit),
            "avoid" => Ok(QueryEvent::Avoid),
            other => Err(QueryError::InvalidQuery(format!(
                "unknown query event '{}' (expected hit or avoid)",
                other
            ))),
        }
    }
}

/// Where a sample's excluded terms come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionSource {
    /// The token right after the continuation window, at index `total_seq_len`
    NextToken,
    /// The same explicit set for every sample
    Fixed(Vec<u32>),
    /// No constraint
    Empty,
    /// Every id except the row's first token
    AllButFirst,
}

impl ExclusionSource {
    /// Parse a source name; `fixed` takes its terms from `terms`
    pub fn parse(name: &str, terms: &[u32]) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "next_token" => Ok(ExclusionSource::NextToken),
            "fixed" => Ok(ExclusionSource::Fixed(terms.to_vec())),
            "empty" | "none" => Ok(ExclusionSource::Empty),
            "all_but_first" => Ok(ExclusionSource::AllButFirst),
            other => Err(QueryError::InvalidQuery(format!(
                "unknown exclusion source '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExclusionSource::NextToken => "next_token",
            ExclusionSource::Fixed(_) => "fixed",
            ExclusionSource::Empty => "empty",
            ExclusionSource::AllButFirst => "all_but_first",
        }
    }

    /// Excluded terms for one dataset row, sorted and deduplicated
    pub fn resolve(&self, row: &[u32], total_seq_len: usize, vocab_size: usize) -> Result<Vec<u32>> {
        let terms: BTreeSet<u32> = match self {
            ExclusionSource::NextToken => {
                let token = row.get(total_seq_len).copied().ok_or_else(|| {
                    QueryError::InvalidQuery(format!(
                        "row of length {} has no token at index {}",
                        row.len(),
                        total_seq_len
                    ))
                })?;
                BTreeSet::from([token])
            }
            ExclusionSource::Fixed(terms) => terms.iter().copied().collect(),
            ExclusionSource::Empty => BTreeSet::new(),
            ExclusionSource::AllButFirst => {
                let first = row.first().copied().ok_or_else(|| {
                    QueryError::InvalidQuery("empty row has no first token".to_string())
                })?;
                (0..vocab_size as u32).filter(|&t| t != first).collect()
            }
        };
        Ok(terms.into_iter().collect())
    }
}

/// Everything an estimator needs to answer one query
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub history: Vec<u32>,
    /// Continuation length L
    pub seq_len: usize,
    /// Sorted, deduplicated excluded ids
    pub excluded_terms: Vec<u32>,
    pub vocab_size: usize,
    pub estimator: EstimatorKind,
    pub num_mc_samples: usize,
    pub num_beams: usize,
    /// Incremental reporting checkpoints (sample counts, or beam counts for search)
    pub sub_estimates: Vec<usize>,
    pub truncation: Truncation,
    pub event: QueryEvent,
    pub max_batch_size: usize,
    /// Steps (0-based) at which sampling estimators also report the hit
    /// probability within a shorter horizon; empty disables
    pub intermediate_seqs: Vec<usize>,
}

impl QueryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.seq_len == 0 {
            return Err(QueryError::InvalidQuery(
                "continuation length must be positive".to_string(),
            ));
        }
        if self.vocab_size == 0 {
            return Err(QueryError::InvalidQuery("vocabulary is empty".to_string()));
        }
        if let Some(&bad) = self
            .excluded_terms
            .iter()
            .find(|&&t| t as usize >= self.vocab_size)
        {
            return Err(QueryError::InvalidQuery(format!(
                "excluded term {} outside vocab size {}",
                bad, self.vocab_size
            )));
        }
        if let Some(&bad) = self.history.iter().find(|&&t| t as usize >= self.vocab_size) {
            return Err(QueryError::InvalidQuery(format!(
                "history token {} outside vocab size {}",
                bad, self.vocab_size
            )));
        }
        if self.sub_estimates.windows(2).any(|w| w[1] < w[0]) {
            return Err(QueryError::InvalidQuery(format!(
                "sub-estimates must be non-decreasing, got {:?}",
                self.sub_estimates
            )));
        }
        if let Some(&bad) = self.intermediate_seqs.iter().find(|&&s| s >= self.seq_len) {
            return Err(QueryError::InvalidQuery(format!(
                "intermediate step {} outside continuation length {}",
                bad, self.seq_len
            )));
        }
        if !self.intermediate_seqs.is_empty() && !self.estimator.reports_intermediate_seqs() {
            return Err(QueryError::InvalidQuery(format!(
                "{} does not report intermediate horizons",
                self.estimator
            )));
        }
        if self.estimator.uses_beams() && self.beam_checkpoints().iter().any(|&b| b == 0) {
            return Err(QueryError::InvalidQuery(
                "beam search needs at least one beam".to_string(),
            ));
        }
        Ok(())
    }

    /// Membership mask over the vocabulary
    pub fn excluded_mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.vocab_size];
        for &t in &self.excluded_terms {
            if let Some(slot) = mask.get_mut(t as usize) {
                *slot = true;
            }
        }
        mask
    }

    /// Sample counts at which sampling estimators report
    pub fn sample_checkpoints(&self) -> Vec<usize> {
        if self.sub_estimates.is_empty() || !self.estimator.uses_samples() {
            vec![self.num_mc_samples]
        } else {
            self.sub_estimates.clone()
        }
    }

    /// Beam counts at which the search estimator reports
    pub fn beam_checkpoints(&self) -> Vec<usize> {
        if self.sub_estimates.is_empty() || self.estimator.uses_samples() {
            vec![self.num_beams]
        } else {
            self.sub_estimates.clone()
        }
    }

    /// Full prefix for a continuation
    pub fn prefix(&self, continuation: &[u32]) -> Vec<u32> {
        let mut prefix = Vec::with_capacity(self.history.len() + continuation.len());
        prefix.extend_from_slice(&self.history);
        prefix.extend_from_slice(continuation);
        prefix
    }
}

impl fmt::Display for QueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} over L={} with {} excluded terms (hist={}, samples={}, beams={})",
            self.estimator,
            self.seq_len,
            self.excluded_terms.len(),
            self.history.len(),
            self.num_mc_samples,
            self.num_beams,
        )
    }
}
