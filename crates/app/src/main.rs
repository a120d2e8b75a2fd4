mod cli;
mod coprocessor;
mod demo;
mod publish;

use clap::Parser;
use vision::{PipelineRegistry, VisionConfig};

use crate::cli::{Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => coprocessor::run(VisionConfig::try_from(args)?),
        Command::Pipelines => {
            for name in PipelineRegistry::with_builtins().names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}
