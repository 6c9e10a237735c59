use std::path::PathBuf;

use clap::Parser;
use training::{run_eval, TrainArgs, TrainConfig};

#[derive(Parser, Debug)]
#[command(name = "eval", about = "Evaluate saved detector weights on the val split (per-class AP)")]
struct Cli {
    #[command(flatten)]
    args: TrainArgs,
    /// Weights to evaluate (defaults to the configured save path).
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    training::init_logging(cli.args.verbose);
    let cfg = TrainConfig::resolve(&cli.args)?;
    run_eval(&cfg, cli.checkpoint.as_deref())?;
    Ok(())
}
