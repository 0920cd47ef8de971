//! SATe command-line entry point.
//!
//! `sate run` performs a co-estimation run as configured by one or more TOML
//! settings files; `sate export-config` writes the resolved configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sate::core::score::IdentityTransform;
use sate::exit_codes;
use sate::io::config::{SateConfig, load_config, write_config};
use sate::io::products::RunProducts;
use sate::io::signals;
use sate::io::tools::Team;
use sate::logging::{self, RunLogs};
use sate::pipeline::run_sate;
use sate::sched::cancel::{Cancellation, CancelledError};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "sate",
    version,
    about = "Iterative co-estimation of multiple sequence alignments and phylogenies"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run SATe. Later settings files override earlier ones.
    Run {
        #[arg(required = true)]
        settings: Vec<PathBuf>,
        /// Override one option, e.g. `--set sate.iter_limit=3`.
        #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
        overrides: Vec<String>,
        /// Choose algorithm settings from the input data.
        #[arg(long)]
        auto: bool,
        /// Print the run summary as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Write the fully resolved configuration and exit.
    ExportConfig {
        #[arg(required = true)]
        settings: Vec<PathBuf>,
        #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
        overrides: Vec<String>,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() {
    let logs = logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli, &logs) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            if let Some(cancelled) = err.downcast_ref::<CancelledError>() {
                error!(reason = %cancelled, "run cancelled");
                exit_codes::CANCELLED
            } else {
                error!("{err:#}");
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli, logs: &RunLogs) -> Result<()> {
    match cli.command {
        Command::Run {
            settings,
            overrides,
            auto,
            json,
        } => {
            let mut cfg = load_config(&settings, &overrides)?;
            cfg.commandline.auto |= auto;
            cmd_run(cfg, json, logs)
        }
        Command::ExportConfig {
            settings,
            overrides,
            output,
        } => {
            let cfg = load_config(&settings, &overrides)?;
            write_config(&output, &cfg)?;
            info!(path = %output.display(), "configuration written");
            Ok(())
        }
    }
}

fn cmd_run(cfg: SateConfig, json: bool, logs: &RunLogs) -> Result<()> {
    let products = RunProducts::new(&cfg.output_directory()?, &cfg.commandline.job)?;
    logs.attach(&products.run_log_path(), &products.err_log_path())?;
    let cancellation = Cancellation::new();
    // Installed before the worker pool so every worker inherits the mask.
    let _signals = signals::install(
        cancellation.clone(),
        Duration::from_secs(cfg.tools.kill_grace_secs),
    )?;
    let summary = run_sate(cfg, &Team::from_config, &IdentityTransform, cancellation)?;
    if json {
        let payload = serde_json::to_string_pretty(&summary).context("serialize run summary")?;
        println!("{payload}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "sate",
            "run",
            "a.toml",
            "b.toml",
            "--set",
            "sate.iter_limit=3",
            "--auto",
        ]);
        match cli.command {
            Command::Run {
                settings,
                overrides,
                auto,
                json,
            } => {
                assert_eq!(settings, vec![PathBuf::from("a.toml"), PathBuf::from("b.toml")]);
                assert_eq!(overrides, vec!["sate.iter_limit=3".to_string()]);
                assert!(auto);
                assert!(!json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_requires_settings() {
        assert!(Cli::try_parse_from(["sate", "run"]).is_err());
    }

    #[test]
    fn parse_export_config() {
        let cli = Cli::parse_from(["sate", "export-config", "a.toml", "--output", "out.toml"]);
        assert!(matches!(
            cli.command,
            Command::ExportConfig { ref output, .. } if output == &PathBuf::from("out.toml")
        ));
    }
}
