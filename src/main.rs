//! ontvc CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Write a default pipeline.yml
//! ontvc variantcalling config
//!
//! # Bring every result up to date on the cluster
//! ontvc variantcalling make full
//!
//! # Run locally with 8 parallel jobs
//! ontvc variantcalling make --local --jobs 8
//!
//! # Preview what would run
//! ontvc variantcalling make run_clair3 --dry-run
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use ontvc::config::{PipelineConfig, CONFIG_FILE};
use ontvc::execution::{Engine, ExecutionMode};
use ontvc::pipelines::{self, variantcalling::DEFAULT_TARGET};
use ontvc::{APP_NAME, VERSION};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "ontvc",
    version,
    about = "Nanopore sequencing workflows driven by file dependencies.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    pipeline: Pipeline,
}

#[derive(Debug, Subcommand)]
enum Pipeline {
    /// Mapping, small and structural variant calling, coverage.
    Variantcalling {
        #[command(subcommand)]
        command: PipelineCommand,
    },
}

#[derive(Debug, Subcommand)]
enum PipelineCommand {
    /// Write a default configuration file.
    Config {
        #[arg(long, short, value_name = "PATH", default_value = CONFIG_FILE)]
        output: PathBuf,
    },
    /// Bring the given targets up to date.
    Make(MakeArgs),
}

#[derive(Debug, Args)]
struct MakeArgs {
    /// Tasks to run, together with everything they depend on.
    #[arg(value_name = "TARGET", default_value = DEFAULT_TARGET)]
    targets: Vec<String>,

    /// Run jobs on this machine instead of submitting them.
    #[arg(long)]
    local: bool,

    /// Show what would run without executing anything.
    #[arg(long)]
    dry_run: bool,

    /// Configuration file. Default: pipeline.yml here or in the parent directory.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Maximum parallel jobs (local) or pending submissions (cluster).
    #[arg(long, short, value_name = "N")]
    jobs: Option<usize>,

    /// Cancel the run at the first failure.
    #[arg(long)]
    fail_fast: bool,

    /// Write the run report as JSON.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short)]
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Nanopore variant calling");
    println!();
}

fn load_config(path: Option<&Path>) -> Result<(PipelineConfig, PathBuf), Box<dyn std::error::Error>> {
    let loaded = match path {
        Some(path) => (PipelineConfig::load(path)?, path.to_path_buf()),
        None => PipelineConfig::discover().map_err(|e| {
            format!("{}; run '{} variantcalling config' to create one", e, APP_NAME)
        })?,
    };
    info!("Configuration: {}", loaded.1.display());
    Ok(loaded)
}

/// Runs a pipeline. Returns whether every selected task ended up to date.
fn make(pipeline: &str, args: MakeArgs) -> Result<bool, Box<dyn std::error::Error>> {
    setup_logging(args.verbose);
    print_banner();

    let (config, _) = load_config(args.config.as_deref())?;
    let registry = pipelines::registry(pipeline, &config)?;
    let working_dir = config.working_dir(&std::env::current_dir()?);

    let mut engine = Engine::new(registry, config);
    engine.set_working_dir(working_dir);
    engine.set_mode(if args.local {
        ExecutionMode::Local
    } else {
        ExecutionMode::Cluster
    });
    engine.set_dry_run(args.dry_run);
    engine.set_targets(args.targets.iter().cloned());
    if args.fail_fast {
        engine.set_fail_fast(true);
    }
    if let Some(jobs) = args.jobs {
        engine.set_max_parallel(jobs);
    }

    if args.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        println!();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let report = runtime.block_on(async {
        let cancel = engine.cancel_handle();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Interrupted - cancelling running jobs");
                    cancel.cancel();
                }
                Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
            }
        });

        engine.run().await
    })?;

    println!();
    println!("{}", report.summary());

    if let Some(path) = args.report {
        report.save(&path)?;
    }

    Ok(report.is_success())
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.pipeline {
        Pipeline::Variantcalling { command } => match command {
            PipelineCommand::Config { output } => {
                PipelineConfig::write_default(&output)?;
                println!("Wrote {}", output.display());
                Ok(true)
            }
            PipelineCommand::Make(args) => make(pipelines::VARIANTCALLING, args),
        },
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn make_args(argv: &[&str]) -> MakeArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.pipeline {
            Pipeline::Variantcalling {
                command: PipelineCommand::Make(args),
            } => args,
            other => panic!("expected make, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_subcommand_names_a_pipeline() {
        let command = Cli::command();
        assert!(command.find_subcommand(pipelines::VARIANTCALLING).is_some());
        assert!(pipelines::registry(pipelines::VARIANTCALLING, &PipelineConfig::default()).is_ok());
    }

    #[test]
    fn test_make_defaults_to_full() {
        let args = make_args(&["ontvc", "variantcalling", "make"]);
        assert_eq!(args.targets, vec!["full".to_string()]);
        assert!(!args.local);
        assert!(!args.dry_run);
        assert!(args.jobs.is_none());
    }

    #[test]
    fn test_make_options() {
        let args = make_args(&[
            "ontvc",
            "variantcalling",
            "make",
            "run_clair3",
            "mosdepth",
            "--local",
            "--dry-run",
            "-j",
            "8",
            "--fail-fast",
            "--report",
            "run.json",
            "-v",
        ]);
        assert_eq!(args.targets, vec!["run_clair3", "mosdepth"]);
        assert!(args.local && args.dry_run && args.fail_fast && args.verbose);
        assert_eq!(args.jobs, Some(8));
        assert_eq!(args.report, Some(PathBuf::from("run.json")));
    }

    #[test]
    fn test_config_output() {
        let cli = Cli::try_parse_from(["ontvc", "variantcalling", "config"]).unwrap();
        match cli.pipeline {
            Pipeline::Variantcalling {
                command: PipelineCommand::Config { output },
            } => assert_eq!(output, PathBuf::from(CONFIG_FILE)),
            other => panic!("expected config, got {:?}", other),
        }
    }
}
