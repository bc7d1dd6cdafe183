//! Query estimation harness
//!
//! One pass over a dataset: every row becomes a query sample, the selected
//! estimator runs on it, and the declared artifacts are accumulated and
//! consolidated into a single output. When a reference budget record is
//! supplied the estimator's sample or beam counts are re-derived per sample so
//! that its compute matches the reference run.

use crate::error::{QueryError, Result};
use crate::estimate::artifact::{ArtifactAccumulator, ArtifactSpec, ConsolidatedOutput, Tensor};
use crate::estimate::query::{ExclusionSource, QueryConfig, QueryEvent};
use crate::estimate::{BudgetMatching, EstimatorKind, INTERMEDIATE_SEQ_ARTIFACT};
use crate::inference::budget::{beam_checkpoints_from_budget, sub_estimates_from_budget};
use crate::inference::sampler::Truncation;
use crate::model::dataset::TokenDataset;
use crate::model::SequenceModel;
use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const TAU_A: &str = "tau_a_estimates";
const TAU_B: &str = "tau_b_estimates";

/// Two excluded sets tracked side by side.
///
/// The query excludes their union; each set's estimate is the probability
/// that its terms are the first excluded terms to appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TauSets {
    pub a: Vec<u32>,
    pub b: Vec<u32>,
}

impl TauSets {
    pub fn union(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.a.iter().chain(self.b.iter()).copied().collect();
        set.into_iter().collect()
    }
}

/// Settings for one harness run
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub estimator: EstimatorKind,
    /// Tokens of each row used as history
    pub hist_len: usize,
    /// History plus continuation; the continuation length is `total_seq_len - hist_len`
    pub total_seq_len: usize,
    pub exclusion: ExclusionSource,
    pub event: QueryEvent,
    pub tau: Option<TauSets>,
    /// Horizon steps reported by sampling estimators as a checkpoint x step table
    pub intermediate_seqs: Vec<usize>,
    pub num_mc_samples: usize,
    pub num_beams: usize,
    pub sub_estimates: Vec<usize>,
    pub truncation: Truncation,
    pub max_batch_size: usize,
    /// Dataset rows per batch
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorKind::McEstimate,
            hist_len: 1,
            total_seq_len: 5,
            exclusion: ExclusionSource::NextToken,
            event: QueryEvent::Hit,
            tau: None,
            intermediate_seqs: Vec::new(),
            num_mc_samples: 100,
            num_beams: 4,
            sub_estimates: Vec::new(),
            truncation: Truncation::none(),
            max_batch_size: 256,
            batch_size: 8,
            seed: 0,
        }
    }
}

impl HarnessConfig {
    pub fn seq_len(&self) -> usize {
        self.total_seq_len.saturating_sub(self.hist_len)
    }

    /// Minimum row length the dataset must provide
    pub fn min_row_len(&self) -> usize {
        match self.exclusion {
            ExclusionSource::NextToken if self.tau.is_none() => self.total_seq_len + 1,
            _ => self.hist_len.max(1),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "estimator": self.estimator.name(),
            "hist_len": self.hist_len,
            "total_seq_len": self.total_seq_len,
            "seq_len": self.seq_len(),
            "exclusion": self.exclusion.name(),
            "fixed_terms": match &self.exclusion {
                ExclusionSource::Fixed(terms) => json!(terms),
                _ => Value::Null,
            },
            "event": self.event.name(),
            "tau_a": self.tau.as_ref().map(|t| t.a.clone()),
            "tau_b": self.tau.as_ref().map(|t| t.b.clone()),
            "intermediate_seqs": self.intermediate_seqs,
            "num_mc_samples": self.num_mc_samples,
            "num_beams": self.num_beams,
            "sub_estimates": self.sub_estimates,
            "top_k": self.truncation.top_k,
            "top_p": self.truncation.top_p,
            "min_variance": self.truncation.min_variance,
            "min_var_reduction": self.truncation.min_var_reduction,
            "max_batch_size": self.max_batch_size,
            "batch_size": self.batch_size,
            "seed": self.seed,
        })
    }
}

/// Per-sample compute cost of a reference run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetRecord {
    per_sample: Vec<Vec<usize>>,
}

impl BudgetRecord {
    pub fn from_rows(per_sample: Vec<Vec<usize>>) -> Self {
        Self { per_sample }
    }

    /// Read the `model_iters` artifact of a consolidated output
    pub fn from_output(output: &ConsolidatedOutput) -> Result<Self> {
        let tensor = output.get("model_iters").ok_or_else(|| {
            QueryError::InvalidBudgetRecord("output has no model_iters artifact".to_string())
        })?;
        let rows = match tensor.shape() {
            [] => vec![tensor.data().to_vec()],
            [_] => tensor.data().iter().map(|&v| vec![v]).collect(),
            [n, m] => (0..*n)
                .map(|i| tensor.data()[i * m..(i + 1) * m].to_vec())
                .collect(),
            other => {
                return Err(QueryError::InvalidBudgetRecord(format!(
                    "model_iters has unsupported shape {:?}",
                    other
                )))
            }
        };
        let per_sample = rows
            .into_iter()
            .map(|row| row.into_iter().map(to_count).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { per_sample })
    }

    /// Parse a consolidated JSON output, reading its `model_iters` key
    pub fn from_json(value: &Value) -> Result<Self> {
        let iters = value.get("model_iters").ok_or_else(|| {
            QueryError::InvalidBudgetRecord("missing 'model_iters' key".to_string())
        })?;
        let rows: Vec<Vec<usize>> = match iters {
            Value::Number(_) => vec![vec![json_count(iters)?]],
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Array(inner) => inner.iter().map(json_count).collect(),
                    other => Ok(vec![json_count(other)?]),
                })
                .collect::<Result<_>>()?,
            _ => {
                return Err(QueryError::InvalidBudgetRecord(
                    "model_iters must be a number or an array".to_string(),
                ))
            }
        };
        Ok(Self { per_sample: rows })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read budget record: {}", path.display()))?;
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Budget record is not JSON: {}", path.display()))?;
        Ok(Self::from_json(&value)?)
    }

    pub fn len(&self) -> usize {
        self.per_sample.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_sample.is_empty()
    }

    /// Cumulative model evaluations of sample `idx`
    pub fn sample(&self, idx: usize) -> Result<&[usize]> {
        self.per_sample.get(idx).map(Vec::as_slice).ok_or_else(|| {
            QueryError::InvalidBudgetRecord(format!(
                "record covers {} samples, no entry for sample {}",
                self.per_sample.len(),
                idx
            ))
        })
    }
}

fn to_count(v: f64) -> Result<usize> {
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 {
        Ok(v as usize)
    } else {
        Err(QueryError::InvalidBudgetRecord(format!(
            "model_iters entry {} is not a non-negative integer",
            v
        )))
    }
}

fn json_count(value: &Value) -> Result<usize> {
    value
        .as_f64()
        .ok_or_else(|| QueryError::InvalidBudgetRecord(format!("non-numeric entry {}", value)))
        .and_then(to_count)
}

/// Run the configured estimator over every dataset row
pub fn run(
    config: &HarnessConfig,
    model: &dyn SequenceModel,
    dataset: &TokenDataset,
    budget: Option<&BudgetRecord>,
) -> Result<ConsolidatedOutput> {
    let seq_len = config.seq_len();
    if seq_len == 0 {
        return Err(QueryError::InvalidQuery(format!(
            "total_seq_len {} leaves no continuation after hist_len {}",
            config.total_seq_len, config.hist_len
        )));
    }
    let vocab_size = model.vocab_size();
    dataset
        .validate(config.min_row_len(), vocab_size)
        .map_err(|e| QueryError::InvalidQuery(format!("{:#}", e)))?;

    let mut specs: Vec<ArtifactSpec> = config.estimator.artifacts().to_vec();
    if config.tau.is_some() {
        specs.push(ArtifactSpec::stack(TAU_A));
        specs.push(ArtifactSpec::stack(TAU_B));
    }
    if !config.intermediate_seqs.is_empty() {
        specs.push(ArtifactSpec::stack(INTERMEDIATE_SEQ_ARTIFACT));
    }
    let mut accumulator = ArtifactAccumulator::new(specs);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let matching = match budget {
        Some(_) => config.estimator.budget_matching(),
        None => BudgetMatching::Fixed,
    };
    if budget.is_some() && matching == BudgetMatching::Fixed {
        warn!(
            "{} does not re-derive its budget; using configured parameters",
            config.estimator
        );
    }
    info!(
        "Running {} over {} samples (L={}, seed={}, budget={})",
        config.estimator,
        dataset.len(),
        seq_len,
        config.seed,
        if budget.is_some() { "matched" } else { "fixed" }
    );

    let mut excluded_terms = Vec::with_capacity(dataset.len());
    let mut sample_idx = 0;
    for (batch_idx, batch) in dataset.batches(config.batch_size).enumerate() {
        for row in batch {
            let mut query = build_query(config, row, vocab_size)?;
            if let Some(record) = budget {
                rederive_budget(&mut query, matching, record.sample(sample_idx)?)?;
            }
            query.validate()?;
            debug!("sample {}: {}", sample_idx, query);

            let record = config.estimator.estimate(&query, model, &mut rng)?;
            accumulator.append(config.estimator.name(), &record)?;

            if let Some(tau) = &config.tau {
                let intermediate = record
                    .get(config.estimator.intermediate_artifact())
                    .ok_or(QueryError::MissingArtifact {
                        estimator: config.estimator.name(),
                        artifact: config.estimator.intermediate_artifact(),
                    })?;
                accumulator.push(TAU_A, Tensor::scalar(tail_estimate(intermediate, &tau.a)));
                accumulator.push(TAU_B, Tensor::scalar(tail_estimate(intermediate, &tau.b)));
            }

            excluded_terms.push(query.excluded_terms);
            sample_idx += 1;
        }
        info!("Batch {} done ({} samples so far)", batch_idx + 1, sample_idx);
    }

    let artifacts = accumulator.consolidate()?;
    Ok(ConsolidatedOutput {
        artifacts,
        excluded_terms,
        metadata: config.to_json(),
    })
}

fn build_query(config: &HarnessConfig, row: &[u32], vocab_size: usize) -> Result<QueryConfig> {
    let history = row.get(..config.hist_len).ok_or_else(|| {
        QueryError::InvalidQuery(format!(
            "row of length {} is shorter than hist_len {}",
            row.len(),
            config.hist_len
        ))
    })?;
    let excluded_terms = match &config.tau {
        Some(tau) => tau.union(),
        None => config
            .exclusion
            .resolve(row, config.total_seq_len, vocab_size)?,
    };
    Ok(QueryConfig {
        history: history.to_vec(),
        seq_len: config.seq_len(),
        excluded_terms,
        vocab_size,
        estimator: config.estimator,
        num_mc_samples: config.num_mc_samples,
        num_beams: config.num_beams,
        sub_estimates: config.sub_estimates.clone(),
        truncation: config.truncation.clone(),
        event: config.event,
        max_batch_size: config.max_batch_size,
        intermediate_seqs: config.intermediate_seqs.clone(),
    })
}

/// Replace the query's sample or beam counts with ones matching `model_iters`
fn rederive_budget(query: &mut QueryConfig, matching: BudgetMatching, model_iters: &[usize]) -> Result<()> {
    match matching {
        BudgetMatching::Sampling => {
            let subs = sub_estimates_from_budget(model_iters, query.seq_len)?;
            if let Some(&last) = subs.last() {
                query.num_mc_samples = last;
            }
            debug!("matched sample checkpoints {:?}", subs);
            query.sub_estimates = subs;
        }
        BudgetMatching::Search => {
            let beams = beam_checkpoints_from_budget(model_iters, query.vocab_size, query.seq_len)?;
            if let Some(&last) = beams.last() {
                query.num_beams = last;
            }
            debug!("matched beam checkpoints {:?}", beams);
            query.sub_estimates = beams;
        }
        BudgetMatching::Fixed => {}
    }
    Ok(())
}

/// Total mass a `seq_len x vocab_size` intermediate puts on `terms` over the whole horizon
fn tail_estimate(intermediate: &Tensor, terms: &[u32]) -> f64 {
    let Some(&vocab_size) = intermediate.shape().last() else {
        return 0.0;
    };
    let mut cumulative = vec![0.0f64; vocab_size];
    for step in intermediate.data().chunks(vocab_size.max(1)) {
        for (acc, v) in cumulative.iter_mut().zip(step.iter()) {
            *acc += v;
        }
    }
    terms
        .iter()
        .filter_map(|&t| cumulative.get(t as usize))
        .sum()
}
