//! Model and dataset collaborators
//!
//! The estimators only see a `SequenceModel`: a batch of token-id prefixes goes
//! in, one row of next-token logits per prefix comes out. Every returned row
//! counts as one model evaluation in the compute budget.

pub mod bigram;
pub mod dataset;

use anyhow::{bail, Result};

/// Autoregressive next-token model
pub trait SequenceModel {
    fn vocab_size(&self) -> usize;

    /// Next-token logits for each prefix, one row of `vocab_size` per prefix
    fn next_logits(&self, prefixes: &[Vec<u32>]) -> Result<Vec<Vec<f32>>>;
}

/// Evaluate `prefixes` in chunks of at most `max_batch_size` rows.
///
/// Checks that the model returned one full-vocabulary row per prefix.
pub fn next_logits_batched(
    model: &dyn SequenceModel,
    prefixes: &[Vec<u32>],
    max_batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let vocab_size = model.vocab_size();
    let mut rows = Vec::with_capacity(prefixes.len());
    for chunk in prefixes.chunks(max_batch_size.max(1)) {
        let logits = model.next_logits(chunk)?;
        if logits.len() != chunk.len() {
            bail!(
                "Model returned {} rows for a batch of {} prefixes",
                logits.len(),
                chunk.len()
            );
        }
        if let Some(bad) = logits.iter().find(|row| row.len() != vocab_size) {
            bail!(
                "Model returned a row of {} logits, expected vocab size {}",
                bad.len(),
                vocab_size
            );
        }
        rows.extend(logits);
    }
    Ok(rows)
}

/// Model that puts equal mass on every token regardless of the prefix
pub struct UniformModel {
    vocab_size: usize,
}

impl UniformModel {
    pub fn new(vocab_size: usize) -> Self {
        Self { vocab_size }
    }
}

impl SequenceModel for UniformModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn next_logits(&self, prefixes: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![vec![0.0; self.vocab_size]; prefixes.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ShortRowModel;

    impl SequenceModel for ShortRowModel {
        fn vocab_size(&self) -> usize {
            4
        }

        fn next_logits(&self, prefixes: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![0.0; 3]; prefixes.len()])
        }
    }

    #[test]
    fn test_batched_evaluation_preserves_order() {
        let model = UniformModel::new(3);
        let prefixes: Vec<Vec<u32>> = (0..7).map(|i| vec![i]).collect();
        let rows = next_logits_batched(&model, &prefixes, 2).unwrap();
        assert_eq!(rows.len(), 7);
        assert!(rows.iter().all(|r| r.len() == 3));
    }

    #[test]
    fn test_batched_evaluation_rejects_short_rows() {
        let err = next_logits_batched(&ShortRowModel, &[vec![0]], 8).unwrap_err();
        assert!(err.to_string().contains("expected vocab size 4"));
    }
}
