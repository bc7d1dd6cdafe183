//! Token-id datasets
//!
//! One sequence per line, ids separated by whitespace or commas. Blank lines
//! and `#` comments are skipped. The harness treats every row as one query
//! sample.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct TokenDataset {
    rows: Vec<Vec<u32>>,
}

impl TokenDataset {
    pub fn from_rows(rows: Vec<Vec<u32>>) -> Self {
        Self { rows }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid dataset: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut rows = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row = line
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|tok| !tok.is_empty())
                .map(|tok| {
                    tok.parse::<u32>()
                        .with_context(|| format!("line {}: bad token id '{}'", line_no + 1, tok))
                })
                .collect::<Result<Vec<u32>>>()?;
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Consecutive batches of at most `batch_size` rows, in dataset order
    pub fn batches(&self, batch_size: usize) -> std::slice::Chunks<'_, Vec<u32>> {
        self.rows.chunks(batch_size.max(1))
    }

    /// Fail if any row is shorter than `min_len` or holds an id outside the vocabulary
    pub fn validate(&self, min_len: usize, vocab_size: usize) -> Result<()> {
        for (i, row) in self.rows.iter().enumerate() {
            if row.len() < min_len {
                bail!("Row {} has {} tokens, need at least {}", i, row.len(), min_len);
            }
            if let Some(&bad) = row.iter().find(|&&t| t as usize >= vocab_size) {
                bail!("Row {} has token id {} outside vocab size {}", i, bad, vocab_size);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_separators() {
        let ds = TokenDataset::parse("# header\n1 2 3\n\n4,5, 6\n").unwrap();
        assert_eq!(ds.rows(), &[vec![1, 2, 3], vec![4, 5, 6]]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = TokenDataset::parse("1 x 3").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_batches() {
        let ds = TokenDataset::from_rows((0..5).map(|i| vec![i]).collect());
        let sizes: Vec<usize> = ds.batches(2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_validate() {
        let ds = TokenDataset::from_rows(vec![vec![0, 1, 2], vec![1, 1]]);
        assert!(ds.validate(2, 3).is_ok());
        assert!(ds.validate(3, 3).is_err());
        assert!(ds.validate(2, 2).is_err());
    }
}
