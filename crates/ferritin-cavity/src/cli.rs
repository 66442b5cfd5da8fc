use super::commands;
use super::logging::setup_logging;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run on the CPU even if an accelerator is available.
    #[arg(long, global = true)]
    cpu: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all logging.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a cavity model on parsed structure archives.
    Train(TrainArgs),
    /// Score mutation tables with a trained cavity model.
    Ddg(DdgArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Directory of parsed structure archives (`*.npz`), read in file-name order.
    #[arg(long, required = true)]
    pub structures: PathBuf,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub patience_cutoff: Option<usize>,

    /// Fraction of structures used for training; the rest is validation.
    #[arg(long)]
    pub train_val_split: Option<f32>,

    /// Score the trailing incomplete validation batch too.
    #[arg(long)]
    pub eval_keep_last: bool,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// JSON model configuration; defaults are used when omitted.
    #[arg(long)]
    pub model_config: Option<PathBuf>,

    /// Radius in Angstrom of the environment kept around each residue.
    #[arg(long)]
    pub environment_radius: Option<f32>,
}

#[derive(Args, Debug)]
pub struct DdgArgs {
    /// Checkpoint written by `train`.
    #[arg(long, required = true)]
    pub model: PathBuf,

    /// Model configuration; defaults to `config.json` next to the checkpoint.
    #[arg(long)]
    pub model_config: Option<PathBuf>,

    /// Mutation table as `<dataset>=<csv path>`. Repeatable.
    #[arg(long = "table", required = true, value_parser = parse_named_path)]
    pub tables: Vec<(String, PathBuf)>,

    /// Parsed structures for a dataset as `<dataset>=<directory>`. Repeatable.
    #[arg(long = "environments", required = true, value_parser = parse_named_path)]
    pub environments: Vec<(String, PathBuf)>,

    /// Archive holding the 20 background amino-acid frequencies.
    #[arg(long, default_value = "data/pdb_frequencies.npz")]
    pub frequencies: PathBuf,

    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    #[arg(long, default_value_t = ferritin_cavity::ddg::DEFAULT_EPS)]
    pub eps: f64,

    #[arg(long)]
    pub environment_radius: Option<f32>,

    /// Experimental column to correlate with the prediction, if present.
    #[arg(long, default_value = "score")]
    pub score_column: String,

    /// Rows of each scored table shown at debug level.
    #[arg(long, default_value_t = 2)]
    pub display_n_rows: usize,

    #[arg(long, default_value = "ddg_output")]
    pub out_dir: PathBuf,
}

fn parse_named_path(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected <name>=<path>, got `{}`", s)),
    }
}

impl Cli {
    pub fn execute(self) -> anyhow::Result<()> {
        setup_logging(self.verbose, self.quiet, self.log_file)?;
        let device = ferritin_cavity::device(self.cpu)?;
        match self.command {
            Commands::Train(args) => commands::train::execute(args, device),
            Commands::Ddg(args) => commands::ddg::execute(args, device),
        }
    }
}
