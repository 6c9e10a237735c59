use clap::Parser;
use training::{run_train, TrainArgs, TrainConfig};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train the BEV 3D detector, then report per-class AP")]
struct Cli {
    #[command(flatten)]
    args: TrainArgs,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    training::init_logging(cli.args.verbose);
    let cfg = TrainConfig::resolve(&cli.args)?;
    run_train(cfg)?;
    Ok(())
}
