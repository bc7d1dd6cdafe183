//! Result records, artifact accumulation and consolidation
//!
//! Every estimator returns a `ResultRecord`: artifact name to a dense numeric
//! payload of rank 0 (one estimate), 1 (per checkpoint or per step) or 2
//! (per step x vocabulary). The harness appends records into an
//! `ArtifactAccumulator` and consolidates each artifact according to the
//! aggregation mode declared in the estimator's contract.

use crate::error::{QueryError, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Dense row-major payload
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: values,
        }
    }

    /// `rows x cols` matrix from row-major data
    pub fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(rows * cols, data.len(), "matrix data does not match its shape");
        Self {
            shape: vec![rows, cols],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn as_scalar(&self) -> Option<f64> {
        if self.shape.is_empty() {
            self.data.first().copied()
        } else {
            None
        }
    }

    /// Nested JSON arrays following the shape
    pub fn to_json(&self) -> Value {
        fn nest(shape: &[usize], data: &[f64]) -> Value {
            match shape.split_first() {
                None => json!(data.first().copied().unwrap_or(0.0)),
                Some((&outer, rest)) => {
                    let stride: usize = rest.iter().product();
                    Value::Array(
                        (0..outer)
                            .map(|i| nest(rest, &data[i * stride..(i + 1) * stride]))
                            .collect(),
                    )
                }
            }
        }
        nest(&self.shape, &self.data)
    }
}

/// How per-sample payloads of one artifact are combined across the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// New leading sample dimension; every payload must share one shape
    Stack,
    /// Join along the existing leading dimension; lengths may vary
    Concat,
}

/// One entry of an estimator's artifact contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub name: &'static str,
    pub aggregation: Aggregation,
}

impl ArtifactSpec {
    pub const fn stack(name: &'static str) -> Self {
        Self {
            name,
            aggregation: Aggregation::Stack,
        }
    }

    pub const fn concat(name: &'static str) -> Self {
        Self {
            name,
            aggregation: Aggregation::Concat,
        }
    }
}

/// Artifacts produced by one estimator invocation
#[derive(Debug, Clone, Default)]
pub struct ResultRecord {
    artifacts: BTreeMap<String, Tensor>,
}

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, payload: Tensor) -> Self {
        self.artifacts.insert(name.to_string(), payload);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.artifacts.get(name)
    }
}

/// Append-only per-artifact store for one harness run
pub struct ArtifactAccumulator {
    specs: Vec<ArtifactSpec>,
    payloads: BTreeMap<&'static str, Vec<Tensor>>,
}

impl ArtifactAccumulator {
    pub fn new(specs: Vec<ArtifactSpec>) -> Self {
        let payloads = specs.iter().map(|s| (s.name, Vec::new())).collect();
        Self { specs, payloads }
    }

    /// Append every contracted artifact of `record`.
    ///
    /// A contracted artifact that the record lacks is a contract violation.
    /// Artifacts the record carries beyond the contract are ignored.
    pub fn append(&mut self, estimator: &'static str, record: &ResultRecord) -> Result<()> {
        for spec in &self.specs {
            if let Some(slot) = self.payloads.get_mut(spec.name) {
                match record.get(spec.name) {
                    Some(payload) => slot.push(payload.clone()),
                    None if is_derived(spec.name) => {}
                    None => {
                        return Err(QueryError::MissingArtifact {
                            estimator,
                            artifact: spec.name,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// Append a payload the harness derives itself
    pub fn push(&mut self, name: &'static str, payload: Tensor) {
        if let Some(slot) = self.payloads.get_mut(name) {
            slot.push(payload);
        }
    }

    pub fn num_samples(&self, name: &str) -> usize {
        self.payloads.get(name).map(Vec::len).unwrap_or(0)
    }

    /// Aggregate every artifact by its declared mode
    pub fn consolidate(self) -> Result<BTreeMap<String, Tensor>> {
        let mut payloads = self.payloads;
        let mut out = BTreeMap::new();
        for spec in &self.specs {
            let items = payloads.remove(spec.name).unwrap_or_default();
            let combined = match spec.aggregation {
                Aggregation::Stack => stack(spec.name, &items)?,
                Aggregation::Concat => concat(spec.name, &items)?,
            };
            out.insert(spec.name.to_string(), combined);
        }
        Ok(out)
    }
}

/// Derived artifacts are pushed by the harness rather than read from records
fn is_derived(name: &str) -> bool {
    matches!(name, "tau_a_estimates" | "tau_b_estimates")
}

/// Stack payloads along a new leading dimension
pub fn stack(name: &str, items: &[Tensor]) -> Result<Tensor> {
    let Some(first) = items.first() else {
        return Ok(Tensor {
            shape: vec![0],
            data: Vec::new(),
        });
    };
    let mut data = Vec::with_capacity(first.data.len() * items.len());
    for (sample, item) in items.iter().enumerate() {
        if item.shape != first.shape {
            return Err(QueryError::ShapeMismatch {
                artifact: name.to_string(),
                sample,
                expected: first.shape.clone(),
                found: item.shape.clone(),
            });
        }
        data.extend_from_slice(&item.data);
    }
    let mut shape = Vec::with_capacity(first.shape.len() + 1);
    shape.push(items.len());
    shape.extend_from_slice(&first.shape);
    Ok(Tensor { shape, data })
}

/// Concatenate payloads along their leading dimension.
///
/// Scalars count as length-1 vectors. Ranks and trailing dimensions must agree.
pub fn concat(name: &str, items: &[Tensor]) -> Result<Tensor> {
    let lifted: Vec<(Vec<usize>, &[f64])> = items
        .iter()
        .map(|t| {
            let shape = if t.shape.is_empty() {
                vec![1]
            } else {
                t.shape.clone()
            };
            (shape, t.data.as_slice())
        })
        .collect();
    let Some((first_shape, _)) = lifted.first() else {
        return Ok(Tensor {
            shape: vec![0],
            data: Vec::new(),
        });
    };
    let trailing = first_shape[1..].to_vec();

    let mut leading = 0;
    let mut data = Vec::new();
    for (sample, (shape, values)) in lifted.iter().enumerate() {
        if shape.len() != first_shape.len() {
            return Err(QueryError::RankMismatch {
                artifact: name.to_string(),
                sample,
                expected: first_shape.len(),
                found: shape.len(),
            });
        }
        if shape[1..] != trailing[..] {
            let mut expected = vec![shape[0]];
            expected.extend_from_slice(&trailing);
            return Err(QueryError::ShapeMismatch {
                artifact: name.to_string(),
                sample,
                expected,
                found: shape.clone(),
            });
        }
        leading += shape[0];
        data.extend_from_slice(values);
    }

    let mut shape = vec![leading];
    shape.extend(trailing);
    Ok(Tensor { shape, data })
}

/// Dataset-level result of one harness run
#[derive(Debug, Clone)]
pub struct ConsolidatedOutput {
    pub artifacts: BTreeMap<String, Tensor>,
    /// Excluded terms used for each sample, in dataset order
    pub excluded_terms: Vec<Vec<u32>>,
    /// Snapshot of the configuration the run used
    pub metadata: Value,
}

impl ConsolidatedOutput {
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.artifacts.get(name)
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        for (name, tensor) in &self.artifacts {
            obj.insert(name.clone(), tensor.to_json());
        }
        obj.insert("excluded_terms".to_string(), json!(self.excluded_terms));
        obj.insert("metadata".to_string(), self.metadata.clone());
        Value::Object(obj)
    }
}
