use clap::{Parser, Subcommand};
use vision::VisionCliArgs;

#[derive(Debug, Parser)]
#[command(
    name = "perception",
    version,
    about = "Supervised detection and depth localization coprocessor"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run camera, pipeline and supervisor until Ctrl+C or --duration-secs.
    Run(VisionCliArgs),
    /// List the pipelines that can be passed to `run --pipeline`.
    Pipelines,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "perception",
            "run",
            "--pipeline",
            "passthrough",
            "--width",
            "320",
            "--metrics-addr",
            "127.0.0.1:9000",
        ])
        .expect("valid flags");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.pipeline.as_deref(), Some("passthrough"));
        assert_eq!(args.width, Some(320));
        assert!(args.metrics_addr.is_some());
    }
}
