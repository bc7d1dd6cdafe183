use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use seq_queries::config::Config;
use seq_queries::harness::{self, BudgetRecord};
use seq_queries::inference::budget::equivalent_beams;
use seq_queries::inference::enumerate::variance_ablation;
use seq_queries::model::bigram::BigramModel;
use seq_queries::model::dataset::TokenDataset;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(name = "seq-queries", version, about = "Budget-matched probabilistic queries over autoregressive sequence models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an estimator over a token dataset and write the consolidated output
    Estimate {
        /// Config file (defaults to seq-queries.toml or $SEQ_QUERIES_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Token dataset, one sequence per line
        #[arg(long)]
        dataset: Option<PathBuf>,

        /// Bigram model table (JSON)
        #[arg(long)]
        model: Option<PathBuf>,

        /// mc_estimate, mc_pseudo_gt, beam_search_lower_bound or beam_search_is_hybrid
        #[arg(long)]
        estimator: Option<String>,

        /// Consolidated output of a reference run to match compute against
        #[arg(long)]
        budget_record: Option<PathBuf>,

        /// Output JSON path (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        num_mc_samples: Option<usize>,

        #[arg(long)]
        num_beams: Option<usize>,
    },
    /// Beam count matching the compute of a sampling budget
    Beams {
        #[arg(long)]
        vocab_size: usize,

        /// Sample budget to convert
        #[arg(long)]
        num_beams: usize,

        #[arg(long)]
        seq_len: usize,
    },
    /// Importance-weight variance under progressive truncation, by exhaustive enumeration
    Variance {
        /// Bigram model table (JSON); a seeded random table when omitted
        #[arg(long)]
        model: Option<PathBuf>,

        #[arg(long, default_value_t = 4)]
        vocab_size: usize,

        /// Comma-separated history token ids
        #[arg(long, default_value = "0")]
        history: String,

        #[arg(long, default_value_t = 4)]
        seq_len: usize,

        #[arg(long)]
        excluded_term: u32,

        #[arg(long, default_value_t = 10)]
        num_intervals: usize,

        #[arg(long, default_value_t = 256)]
        max_batch_size: usize,

        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Print a default config file
    InitConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Estimate {
            config,
            dataset,
            model,
            estimator,
            budget_record,
            output,
            seed,
            num_mc_samples,
            num_beams,
        } => {
            let mut cfg = match config {
                Some(path) => Config::load_from_file(&path)?,
                None => Config::load()?,
            };
            if let Some(path) = dataset {
                cfg.run.dataset = Some(path);
            }
            if let Some(path) = model {
                cfg.model.path = Some(path);
            }
            if let Some(kind) = estimator {
                cfg.estimator.kind = kind;
            }
            if let Some(path) = budget_record {
                cfg.run.budget_record = Some(path);
            }
            if let Some(path) = output {
                cfg.run.output = Some(path);
            }
            if let Some(seed) = seed {
                cfg.run.seed = seed;
            }
            if let Some(n) = num_mc_samples {
                cfg.estimator.num_mc_samples = n;
            }
            if let Some(n) = num_beams {
                cfg.estimator.num_beams = n;
            }

            let harness_cfg = cfg.harness_config()?;
            let model = load_model(&cfg)?;
            let Some(dataset_path) = cfg.run.dataset.as_ref() else {
                bail!("No dataset given (use --dataset or [run] dataset)");
            };
            let dataset = TokenDataset::load(dataset_path)?;
            info!("Loaded {} rows from {}", dataset.len(), dataset_path.display());
            let budget = cfg
                .run
                .budget_record
                .as_ref()
                .map(|path| BudgetRecord::load(path))
                .transpose()?;

            let start = Instant::now();
            let out = harness::run(&harness_cfg, &model, &dataset, budget.as_ref())?;
            info!(
                "{} finished {} samples in {:.2}s",
                harness_cfg.estimator,
                dataset.len(),
                start.elapsed().as_secs_f64()
            );

            let rendered = serde_json::to_string_pretty(&out.to_json())?;
            match &cfg.run.output {
                Some(path) => {
                    fs::write(path, rendered)
                        .with_context(|| format!("Failed to write output: {}", path.display()))?;
                    println!("Wrote {} artifacts to {}", out.artifacts.len(), path.display());
                }
                None => println!("{}", rendered),
            }
        }

        Commands::Beams {
            vocab_size,
            num_beams,
            seq_len,
        } => {
            let beams = equivalent_beams(vocab_size, num_beams, seq_len)?;
            println!("{}", beams);
        }

        Commands::Variance {
            model,
            vocab_size,
            history,
            seq_len,
            excluded_term,
            num_intervals,
            max_batch_size,
            seed,
        } => {
            let model = match model {
                Some(path) => BigramModel::load(&path)?,
                None => BigramModel::random(vocab_size, seed, 2.0),
            };
            let history = history
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| t.parse::<u32>().with_context(|| format!("bad history token '{}'", t)))
                .collect::<Result<Vec<u32>>>()?;

            let curve = variance_ablation(
                &history,
                seq_len,
                &model,
                &[excluded_term],
                num_intervals,
                max_batch_size,
            )?;
            let report = json!({
                "history": history,
                "seq_len": seq_len,
                "excluded_term": excluded_term,
                "num_intervals": num_intervals,
                "normalized_variance": curve,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::InitConfig => {
            print!("{}", Config::default_toml());
        }
    }

    Ok(())
}

fn load_model(cfg: &Config) -> Result<BigramModel> {
    match &cfg.model.path {
        Some(path) => {
            info!("Loading model: {}", path.display());
            let model = BigramModel::load(path)?;
            Ok(match cfg.model.temperature {
                Some(t) => model.with_temperature(t),
                None => model,
            })
        }
        None => {
            info!(
                "No model path, using random bigram table (V={}, seed={})",
                cfg.model.vocab_size, cfg.model.seed
            );
            if cfg.model.vocab_size == 0 {
                bail!("model.vocab_size must be positive");
            }
            Ok(BigramModel::random(cfg.model.vocab_size, cfg.model.seed, cfg.model.scale)
                .with_temperature(cfg.model.temperature.unwrap_or(1.0)))
        }
    }
}

