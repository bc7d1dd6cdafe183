//! Table-driven bigram model
//!
//! Next-token logits depend only on the last token of the prefix. Row 0 is used
//! for the empty prefix, which doubles as the reserved beginning-of-sequence
//! slot. Tables are read from JSON:
//!
//! ```json
//! { "vocab_size": 3, "temperature": 1.0, "logits": [[0, 1, 2], [1, 0, 0], [2, 2, 0]] }
//! ```

use crate::model::SequenceModel;
use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct BigramModel {
    vocab_size: usize,
    /// Row-major `vocab_size x vocab_size` logits, row = previous token
    logits: Vec<f32>,
    temperature: f32,
}

impl BigramModel {
    pub fn new(vocab_size: usize, logits: Vec<f32>, temperature: f32) -> Result<Self> {
        if vocab_size == 0 {
            bail!("Bigram model needs a non-empty vocabulary");
        }
        if logits.len() != vocab_size * vocab_size {
            bail!(
                "Bigram table has {} logits, expected {}x{}",
                logits.len(),
                vocab_size,
                vocab_size
            );
        }
        Ok(Self {
            vocab_size,
            logits,
            temperature,
        })
    }

    /// Deterministic random table with logits drawn from `[-scale, scale)`
    pub fn random(vocab_size: usize, seed: u64, scale: f32) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let logits = (0..vocab_size * vocab_size)
            .map(|_| {
                if scale > 0.0 {
                    rng.random_range(-scale..scale)
                } else {
                    0.0
                }
            })
            .collect();
        Self {
            vocab_size,
            logits,
            temperature: 1.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Load a table from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file: {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Invalid model file: {}", path.display()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(content)?;
        let rows = value
            .get("logits")
            .and_then(Value::as_array)
            .context("missing 'logits' array")?;
        let vocab_size = value
            .get("vocab_size")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(rows.len());
        let temperature = value
            .get("temperature")
            .and_then(Value::as_f64)
            .unwrap_or(1.0) as f32;

        let mut logits = Vec::with_capacity(vocab_size * vocab_size);
        for (i, row) in rows.iter().enumerate() {
            let row = row
                .as_array()
                .with_context(|| format!("logits row {} is not an array", i))?;
            for cell in row {
                let v = cell
                    .as_f64()
                    .with_context(|| format!("logits row {} has a non-numeric entry", i))?;
                logits.push(v as f32);
            }
        }
        Self::new(vocab_size, logits, temperature)
    }

    pub fn to_json(&self) -> Value {
        let rows: Vec<Vec<f32>> = self
            .logits
            .chunks(self.vocab_size)
            .map(|row| row.to_vec())
            .collect();
        json!({
            "vocab_size": self.vocab_size,
            "temperature": self.temperature,
            "logits": rows,
        })
    }

    fn row(&self, prev: usize) -> Vec<f32> {
        let start = prev * self.vocab_size;
        let row = &self.logits[start..start + self.vocab_size];
        // Temperatures below 1e-6 leave the logits unscaled
        if self.temperature < 1e-6 || (self.temperature - 1.0).abs() < f32::EPSILON {
            row.to_vec()
        } else {
            row.iter().map(|&l| l / self.temperature).collect()
        }
    }
}

impl SequenceModel for BigramModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn next_logits(&self, prefixes: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        prefixes
            .iter()
            .map(|prefix| {
                let prev = prefix.last().copied().unwrap_or(0) as usize;
                if prev >= self.vocab_size {
                    bail!(
                        "Token id {} out of range for vocab size {}",
                        prev,
                        self.vocab_size
                    );
                }
                Ok(self.row(prev))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_follow_last_token() {
        let model = BigramModel::new(2, vec![1.0, 0.0, 0.0, 3.0], 1.0).unwrap();
        let rows = model.next_logits(&[vec![], vec![0, 1], vec![1, 0]]).unwrap();
        assert_eq!(rows[0], vec![1.0, 0.0]);
        assert_eq!(rows[1], vec![0.0, 3.0]);
        assert_eq!(rows[2], vec![1.0, 0.0]);
    }

    #[test]
    fn test_temperature_scales_logits() {
        let model = BigramModel::new(2, vec![2.0, 4.0, 0.0, 0.0], 2.0).unwrap();
        let rows = model.next_logits(&[vec![0]]).unwrap();
        assert_eq!(rows[0], vec![1.0, 2.0]);
    }

    #[test]
    fn test_out_of_range_token() {
        let model = BigramModel::random(3, 1, 1.0);
        assert!(model.next_logits(&[vec![5]]).is_err());
    }

    #[test]
    fn test_random_is_deterministic() {
        let a = BigramModel::random(4, 42, 2.0);
        let b = BigramModel::random(4, 42, 2.0);
        assert_eq!(a.logits, b.logits);
        assert!(a.logits.iter().all(|&l| (-2.0..2.0).contains(&l)));
    }

    #[test]
    fn test_json_round_trip() {
        let model = BigramModel::random(3, 9, 1.5).with_temperature(0.5);
        let parsed = BigramModel::from_json_str(&model.to_json().to_string()).unwrap();
        assert_eq!(parsed.vocab_size, 3);
        assert_eq!(parsed.logits, model.logits);
        assert_eq!(parsed.temperature(), 0.5);
    }

    #[test]
    fn test_rejects_ragged_table() {
        let err = BigramModel::from_json_str(r#"{"logits": [[0, 1], [2]]}"#).unwrap_err();
        assert!(err.to_string().contains("expected 2x2"));
    }
}
