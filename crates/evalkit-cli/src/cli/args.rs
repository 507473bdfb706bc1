use clap::{Parser, Subcommand, ValueEnum};
use evalkit_core::store::codec::OutputFormat;
use evalkit_core::ScoringMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "evalkit",
    version,
    about = "Resumable, concurrent LLM benchmark runner with judge-based scoring"
)]
pub struct Cli {
    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Evaluate every (question, model, persona) task and write one artifact per combination
    Run(RunArgs),
    /// Recompute statistics for existing artifacts
    Stats(StatsArgs),
    /// Check config and questions without calling any model
    Validate(ValidateArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "evalkit.yaml")]
    pub config: PathBuf,

    /// Question file (JSONL or JSON)
    #[arg(long)]
    pub input: PathBuf,

    /// Answer models to evaluate (default: every configured model except the judge)
    #[arg(long, env = "EVAL_MODELS", value_delimiter = ',')]
    pub models: Vec<String>,

    /// Personas to evaluate (default: every persona)
    #[arg(long, value_delimiter = ',')]
    pub personas: Vec<String>,

    /// Artifact file name shared by all combinations; required by --resume
    #[arg(long)]
    pub output_file: Option<String>,

    /// Skip questions that already have an answered record in the artifact
    #[arg(long)]
    pub resume: bool,

    /// Total worker budget, split evenly across combinations
    #[arg(long, env = "EVAL_WORKERS")]
    pub workers: Option<usize>,

    #[arg(long, env = "EVAL_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// json | jsonl
    #[arg(long, env = "EVAL_OUTPUT_FORMAT")]
    pub output_format: Option<OutputFormat>,

    /// per_round | whole_item
    #[arg(long)]
    pub scoring: Option<ScoringMode>,

    #[arg(long, env = "EVAL_LIMIT")]
    pub limit: Option<usize>,

    /// Shuffle questions before applying --limit
    #[arg(long, env = "EVAL_USE_RANDOM")]
    pub random: bool,

    #[arg(long, env = "EVAL_SEED")]
    pub seed: Option<u64>,

    /// Drop missing local media instead of failing the item
    #[arg(long)]
    pub skip_missing_media: bool,

    /// Overrides settings.output_dir
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct StatsArgs {
    /// Artifacts to aggregate (.json or .jsonl)
    #[arg(required = true)]
    pub artifacts: Vec<PathBuf>,

    #[arg(long, default_value_t = ScoringMode::PerRound)]
    pub scoring: ScoringMode,

    /// Rewrite each artifact's statistics header in place
    #[arg(long)]
    pub write: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ValidateArgs {
    #[arg(long, default_value = "evalkit.yaml")]
    pub config: PathBuf,

    #[arg(long)]
    pub input: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "evalkit",
            "run",
            "--input",
            "q.jsonl",
            "--models",
            "a,b",
            "--scoring",
            "whole-item",
            "--output-format",
            "jsonl",
            "--workers",
            "8",
        ])
        .unwrap();
        let Command::Run(args) = cli.cmd else {
            panic!("expected run");
        };
        assert_eq!(args.models, vec!["a", "b"]);
        assert_eq!(args.scoring, Some(ScoringMode::WholeItem));
        assert_eq!(args.output_format, Some(OutputFormat::Jsonl));
        assert_eq!(args.workers, Some(8));
        assert!(!args.resume);
    }

    #[test]
    fn stats_requires_an_artifact() {
        assert!(Cli::try_parse_from(["evalkit", "stats"]).is_err());
    }
}
