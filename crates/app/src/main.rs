mod cli;
mod supervisor;

use anyhow::Context;
use clap::Parser;
use vision::{VisionConfig, telemetry};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let config = VisionConfig::try_from(cli.vision).context("invalid vision configuration")?;
    let _telemetry = telemetry::init(&config.telemetry);
    supervisor::run(config)
}
