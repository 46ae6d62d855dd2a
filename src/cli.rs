use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand, value_parser};
use tracing::info;

use crate::{
    Harness,
    config::AuditBackend,
    report::{format_bytes, format_number},
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "framebench", author, version, about = "Frontend framework benchmark harness", long_about = None)]
pub struct Cli {
    /// Increase logging verbosity.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Custom config path.
    #[arg(long, global = true, value_parser = value_parser!(PathBuf))]
    pub config: Option<PathBuf>,

    /// Directory for the JSON result files (defaults to benchmarks/results).
    #[arg(long, global = true, value_parser = value_parser!(PathBuf))]
    pub results_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the configured targets.
    Targets,
    /// Measure locally built bundles without starting any container.
    Bundle(TargetArgs),
    /// Audit targets that are already running.
    Audit(AuditCommand),
    /// Start each target, stress it at every concurrency level and stop it.
    Load(TargetArgs),
    /// Run the whole pipeline and regenerate the reports.
    Suite(SuiteCommand),
    /// Regenerate SUMMARY.md and RESULTS.md from saved results.
    Report,
}

#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Restrict the run to these targets (repeatable or comma separated).
    #[arg(long = "target", value_name = "NAME", value_delimiter = ',')]
    pub targets: Vec<String>,
}

#[derive(Args, Debug)]
pub struct AuditCommand {
    #[command(flatten)]
    pub targets: TargetArgs,

    /// Override the configured audit backend.
    #[arg(long, value_enum)]
    pub backend: Option<AuditBackend>,
}

#[derive(Args, Debug)]
pub struct SuiteCommand {
    #[command(flatten)]
    pub targets: TargetArgs,

    /// Skip the browser audit stage.
    #[arg(long, action = ArgAction::SetTrue)]
    pub skip_audit: bool,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let harness = Harness::bootstrap(cli.config.clone(), cli.results_dir.clone())?;
    telemetry::init_tracing("framebench", cli.verbose, &harness.settings().telemetry)?;
    if let Some(path) = telemetry::current_trace_file() {
        info!(path = %path.display(), "writing trace file");
    }
    execute(cli.command, harness)
}

fn execute(command: Command, harness: Harness) -> Result<()> {
    match command {
        Command::Targets => {
            for target in harness.targets(&[])? {
                println!(
                    "{:<10} {:<11} port {:<5} service {}",
                    target.name,
                    target.kind,
                    target.port,
                    target.service()
                );
            }
        }
        Command::Bundle(args) => {
            let targets = harness.targets(&args.targets)?;
            for record in harness.run_bundle_stage(&targets)? {
                println!(
                    "{:<10} total {:>10}  gzipped {:>10}  files {}",
                    record.framework,
                    format_bytes(record.bundle.total_size()),
                    format_bytes(record.bundle.total_gzipped),
                    record.bundle.files.len()
                );
            }
        }
        Command::Audit(cmd) => {
            let harness = match cmd.backend {
                Some(backend) => harness.with_audit_backend(backend),
                None => harness,
            };
            let targets = harness.targets(&cmd.targets.targets)?;
            for record in harness.run_audit_stage(&targets)? {
                match (record.result.performance_score(), record.result.error()) {
                    (Some(score), _) => println!("{:<10} {score}/100", record.framework),
                    (None, error) => println!(
                        "{:<10} N/A ({})",
                        record.framework,
                        error.unwrap_or("no score")
                    ),
                }
            }
        }
        Command::Load(args) => {
            let targets = harness.targets(&args.targets)?;
            for record in harness.run_load_stage(&targets)? {
                if let Some(error) = &record.error {
                    println!("{:<10} {error}", record.framework);
                    continue;
                }
                for run in &record.runs {
                    match run.stats() {
                        Some(stats) => println!(
                            "{:<10} c={:<5} {:>8} req/s  p99 {:.0}ms  errors {}",
                            record.framework,
                            run.concurrency,
                            format_number(stats.requests_per_second_avg),
                            stats.latency.p99,
                            stats.error_count
                        ),
                        None => println!(
                            "{:<10} c={:<5} failed: {}",
                            record.framework,
                            run.concurrency,
                            run.error().unwrap_or("unknown error")
                        ),
                    }
                }
            }
        }
        Command::Suite(cmd) => {
            let targets = harness.targets(&cmd.targets.targets)?;
            if targets.is_empty() {
                bail!("no targets configured");
            }
            let results = harness.run_suite(&targets, !cmd.skip_audit)?;
            let failed = results.iter().filter(|result| result.error().is_some()).count();
            println!(
                "{} targets measured, {failed} failed; results in {}",
                results.len() - failed,
                harness.store().dir().display()
            );
        }
        Command::Report => {
            let (summary, detail) = harness.render_report()?;
            println!("{}", summary.display());
            println!("{}", detail.display());
        }
    }
    Ok(())
}
