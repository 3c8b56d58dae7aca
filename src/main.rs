use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use class_downgrader::batch::{self, BatchOptions, BatchPolicy, UnitStatus};
use class_downgrader::{DowngradeConfig, Downgrader};

#[derive(Parser)]
#[command(name = "downgrader")]
#[command(about = "Rewrite class files for an older JVM verifier")]
#[command(version)]
struct Cli {
    /// Class files or directories to rewrite in place
    #[arg(value_name = "PATH", required = true)]
    roots: Vec<PathBuf>,

    /// TOML file overriding the built-in tables
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Keep going after a class fails instead of stopping
    #[arg(short, long)]
    keep_going: bool,

    /// Run every rewrite but write nothing
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// More output; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();

    let config = match &cli.config {
        Some(path) => DowngradeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DowngradeConfig::default(),
    };
    let downgrader = Downgrader::new(config).context("invalid configuration")?;

    let options = BatchOptions {
        policy: if cli.keep_going {
            BatchPolicy::Continue
        } else {
            BatchPolicy::AbortOnError
        },
        dry_run: cli.dry_run,
    };
    let report = batch::run(&cli.roots, &downgrader, options)?;

    for (path, err) in report.failures() {
        eprintln!("error: {}: {}", path.display(), format_chain(err));
    }
    log::info!(
        "{} downgraded, {} unchanged, {} failed",
        report.count(|status| matches!(status, UnitStatus::Downgraded)),
        report.count(|status| matches!(status, UnitStatus::Unchanged)),
        report.count(|status| matches!(status, UnitStatus::Failed(_))),
    );

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn format_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
