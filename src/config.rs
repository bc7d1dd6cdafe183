//! Configuration file support for seq-queries
//!
//! Loads settings from `seq-queries.toml` (or `$SEQ_QUERIES_CONFIG`).
//! CLI arguments override config file values.

use crate::estimate::query::{ExclusionSource, QueryEvent};
use crate::estimate::EstimatorKind;
use crate::harness::{HarnessConfig, TauSets};
use crate::inference::sampler::Truncation;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub model: ModelConfig,
    pub query: QueryOptions,
    pub estimator: EstimatorOptions,
    pub run: RunOptions,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// JSON bigram table; a seeded random table is used when unset
    pub path: Option<PathBuf>,
    pub vocab_size: usize,
    /// Overrides the temperature stored in the table when set
    pub temperature: Option<f32>,
    /// Seed and logit scale of the random table
    pub seed: u64,
    pub scale: f32,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub hist_len: usize,
    pub total_seq_len: usize,
    /// next_token, fixed, empty or all_but_first
    pub exclusion: String,
    pub excluded_terms: Vec<u32>,
    /// Steps at which sampling estimators also report shorter-horizon estimates
    pub intermediate_seqs: Vec<usize>,
    /// hit or avoid
    pub event: String,
    pub tau_a: Vec<u32>,
    pub tau_b: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct EstimatorOptions {
    pub kind: String,
    pub num_mc_samples: usize,
    pub num_beams: usize,
    pub sub_estimates: Vec<usize>,
    pub top_k: usize,
    pub top_p: f32,
    pub min_variance: bool,
    pub min_var_reduction: f32,
    pub max_batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub seed: u64,
    pub batch_size: usize,
    pub dataset: Option<PathBuf>,
    pub budget_record: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                path: None,
                vocab_size: 8,
                temperature: None,
                seed: 0,
                scale: 2.0,
            },
            query: QueryOptions {
                hist_len: 1,
                total_seq_len: 5,
                exclusion: "next_token".to_string(),
                excluded_terms: Vec::new(),
                intermediate_seqs: Vec::new(),
                event: "hit".to_string(),
                tau_a: Vec::new(),
                tau_b: Vec::new(),
            },
            estimator: EstimatorOptions {
                kind: "mc_estimate".to_string(),
                num_mc_samples: 100,
                num_beams: 4,
                sub_estimates: Vec::new(),
                top_k: 0,
                top_p: 0.0,
                min_variance: false,
                min_var_reduction: 0.0,
                max_batch_size: 256,
            },
            run: RunOptions {
                seed: 0,
                batch_size: 8,
                dataset: None,
                budget_record: None,
                output: None,
            },
        }
    }
}

impl Config {
    /// Load config from default locations, falling back to defaults
    pub fn load() -> Result<Self> {
        let config_path = if let Ok(path) = std::env::var("SEQ_QUERIES_CONFIG") {
            Some(PathBuf::from(path))
        } else {
            Self::find_config_file()
        };

        match config_path {
            Some(path) if path.exists() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Find config file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = vec![PathBuf::from("seq-queries.toml")];
        if let Some(dir) = dirs_config() {
            candidates.push(dir.join("seq-queries.toml"));
        }
        candidates.into_iter().find(|c| c.exists())
    }

    /// Load and parse a TOML config file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse TOML content into Config (simple parser, no external TOML crate)
    fn parse_toml(content: &str) -> Result<Self> {
        let mut config = Self::default();
        let kv_map = parse_toml_simple(content);

        for (key, value) in &kv_map {
            match key.as_str() {
                "model.path" => config.model.path = Some(PathBuf::from(value)),
                "model.vocab_size" => {
                    config.model.vocab_size = value.parse().unwrap_or(config.model.vocab_size);
                }
                "model.temperature" => {
                    config.model.temperature = value.parse().ok().or(config.model.temperature);
                }
                "model.seed" => config.model.seed = value.parse().unwrap_or(config.model.seed),
                "model.scale" => config.model.scale = value.parse().unwrap_or(config.model.scale),
                "query.hist_len" => {
                    config.query.hist_len = value.parse().unwrap_or(config.query.hist_len);
                }
                "query.total_seq_len" => {
                    config.query.total_seq_len =
                        value.parse().unwrap_or(config.query.total_seq_len);
                }
                "query.exclusion" => config.query.exclusion = value.clone(),
                "query.excluded_terms" => {
                    config.query.excluded_terms = parse_list(value).context(key.clone())?;
                }
                "query.intermediate_seqs" => {
                    config.query.intermediate_seqs = parse_list(value).context(key.clone())?;
                }
                "query.event" => config.query.event = value.clone(),
                "query.tau_a" => config.query.tau_a = parse_list(value).context(key.clone())?,
                "query.tau_b" => config.query.tau_b = parse_list(value).context(key.clone())?,
                "estimator.kind" => config.estimator.kind = value.clone(),
                "estimator.num_mc_samples" => {
                    config.estimator.num_mc_samples =
                        value.parse().unwrap_or(config.estimator.num_mc_samples);
                }
                "estimator.num_beams" => {
                    config.estimator.num_beams =
                        value.parse().unwrap_or(config.estimator.num_beams);
                }
                "estimator.sub_estimates" => {
                    config.estimator.sub_estimates = parse_list(value).context(key.clone())?;
                }
                "estimator.top_k" => {
                    config.estimator.top_k = value.parse().unwrap_or(config.estimator.top_k);
                }
                "estimator.top_p" => {
                    config.estimator.top_p = value.parse().unwrap_or(config.estimator.top_p);
                }
                "estimator.min_variance" => config.estimator.min_variance = value == "true",
                "estimator.min_var_reduction" => {
                    config.estimator.min_var_reduction =
                        value.parse().unwrap_or(config.estimator.min_var_reduction);
                }
                "estimator.max_batch_size" => {
                    config.estimator.max_batch_size =
                        value.parse().unwrap_or(config.estimator.max_batch_size);
                }
                "run.seed" => config.run.seed = value.parse().unwrap_or(config.run.seed),
                "run.batch_size" => {
                    config.run.batch_size = value.parse().unwrap_or(config.run.batch_size);
                }
                "run.dataset" => config.run.dataset = Some(PathBuf::from(value)),
                "run.budget_record" => config.run.budget_record = Some(PathBuf::from(value)),
                "run.output" => config.run.output = Some(PathBuf::from(value)),
                _ => {} // ignore unknown keys
            }
        }

        Ok(config)
    }

    /// Resolve the harness settings, validating names
    pub fn harness_config(&self) -> Result<HarnessConfig> {
        let estimator = EstimatorKind::from_str(&self.estimator.kind)?;
        let exclusion = ExclusionSource::parse(&self.query.exclusion, &self.query.excluded_terms)?;
        let event = QueryEvent::from_str(&self.query.event)?;
        let tau = if self.query.tau_a.is_empty() && self.query.tau_b.is_empty() {
            None
        } else {
            Some(TauSets {
                a: self.query.tau_a.clone(),
                b: self.query.tau_b.clone(),
            })
        };

        Ok(HarnessConfig {
            estimator,
            hist_len: self.query.hist_len,
            total_seq_len: self.query.total_seq_len,
            exclusion,
            event,
            tau,
            intermediate_seqs: self.query.intermediate_seqs.clone(),
            num_mc_samples: self.estimator.num_mc_samples,
            num_beams: self.estimator.num_beams,
            sub_estimates: self.estimator.sub_estimates.clone(),
            truncation: Truncation {
                top_k: self.estimator.top_k,
                top_p: self.estimator.top_p,
                min_variance: self.estimator.min_variance,
                min_var_reduction: self.estimator.min_var_reduction,
            },
            max_batch_size: self.estimator.max_batch_size,
            batch_size: self.run.batch_size,
            seed: self.run.seed,
        })
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        r#"# seq-queries configuration file

[model]
# path = "models/bigram.json"
vocab_size = 8
# Overrides the temperature stored in the model file
# temperature = 1.0
seed = 0
scale = 2.0

[query]
hist_len = 1
total_seq_len = 5
# next_token, fixed, empty or all_but_first
exclusion = "next_token"
# excluded_terms = "3,7"
# intermediate_seqs = "0,4"
# hit or avoid
event = "hit"
# tau_a = "1,2"
# tau_b = "5"

[estimator]
# mc_estimate, mc_pseudo_gt, beam_search_lower_bound or beam_search_is_hybrid
kind = "mc_estimate"
num_mc_samples = 100
num_beams = 4
# sub_estimates = "10,50,100"
top_k = 0
top_p = 0.0
min_variance = false
min_var_reduction = 0.0
max_batch_size = 256

[run]
seed = 0
batch_size = 8
# dataset = "data/tokens.txt"
# budget_record = "out/mc_estimate.json"
# output = "out/beam_search_lower_bound.json"
"#
        .to_string()
    }
}

/// Comma-separated list such as `"3,7"` or `[3, 7]`
fn parse_list<T: FromStr>(value: &str) -> Result<Vec<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<T>()
                .with_context(|| format!("bad list entry '{}'", item))
        })
        .collect()
}

/// Simple TOML parser: handles `[section]` headers and `key = value` pairs
fn parse_toml_simple(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut section = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') && !line.contains('=') {
            section = line[1..line.len() - 1].trim().to_string();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            // Strip quotes
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            let full_key = if section.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", section, key)
            };
            map.insert(full_key, value.to_string());
        }
    }
    map
}

/// Get platform config directory
fn dirs_config() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config").join("seq-queries"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(|d| PathBuf::from(d).join("seq-queries"))
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config").join("seq-queries"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.estimator.kind, "mc_estimate");
        assert_eq!(config.query.total_seq_len, 5);
        assert_eq!(config.run.batch_size, 8);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[model]
path = "bigram.json"
vocab_size = 16

[query]
exclusion = "fixed"
excluded_terms = "3, 7"
event = "avoid"

[estimator]
kind = "beam_search_lower_bound"
sub_estimates = [2, 4, 8]
min_variance = true
"#;
        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(config.model.path, Some(PathBuf::from("bigram.json")));
        assert_eq!(config.model.vocab_size, 16);
        assert_eq!(config.query.excluded_terms, vec![3, 7]);
        assert_eq!(config.estimator.sub_estimates, vec![2, 4, 8]);
        assert!(config.estimator.min_variance);

        let harness = config.harness_config().unwrap();
        assert_eq!(harness.estimator, EstimatorKind::BeamSearchLowerBound);
        assert_eq!(harness.exclusion, ExclusionSource::Fixed(vec![3, 7]));
        assert_eq!(harness.event, QueryEvent::Avoid);
        assert!(harness.truncation.min_variance);
    }

    #[test]
    fn test_parse_toml_empty() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config.estimator.num_mc_samples, 100);
    }

    #[test]
    fn test_parse_toml_comments() {
        let toml = r#"
# This is a comment
[estimator]
# num_beams = 99
num_beams = 8
"#;
        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(config.estimator.num_beams, 8);
    }

    #[test]
    fn test_bad_list_is_an_error() {
        let toml = "[query]\ntau_a = \"1, x\"";
        assert!(Config::parse_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_estimator_rejected() {
        let mut config = Config::default();
        config.estimator.kind = "tree_estimate".to_string();
        assert!(config.harness_config().is_err());
    }

    #[test]
    fn test_model_temperature_override() {
        assert_eq!(Config::default().model.temperature, None);
        let config = Config::parse_toml("[model]\ntemperature = 0.5").unwrap();
        assert_eq!(config.model.temperature, Some(0.5));
    }

    #[test]
    fn test_intermediate_seqs() {
        let toml = "[query]\nintermediate_seqs = \"0, 2\"";
        let harness = Config::parse_toml(toml).unwrap().harness_config().unwrap();
        assert_eq!(harness.intermediate_seqs, vec![0, 2]);
    }

    #[test]
    fn test_tau_sets() {
        let toml = "[query]\ntau_a = \"1\"\ntau_b = \"2,3\"";
        let harness = Config::parse_toml(toml).unwrap().harness_config().unwrap();
        let tau = harness.tau.unwrap();
        assert_eq!(tau.union(), vec![1, 2, 3]);
    }

    #[test]
    fn test_default_toml_parseable() {
        let toml = Config::default_toml();
        let config = Config::parse_toml(&toml).unwrap();
        assert_eq!(config.estimator.num_beams, 4);
        assert!(config.harness_config().is_ok());
    }

    #[test]
    fn test_parse_toml_simple() {
        let content = "[section]\nkey = \"value\"\nnum = 42";
        let map = parse_toml_simple(content);
        assert_eq!(map.get("section.key").unwrap(), "value");
        assert_eq!(map.get("section.num").unwrap(), "42");
    }
}
