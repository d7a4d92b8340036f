use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use labqueue::config::RunnerConfig;
use labqueue::item::{TestResult, TestStatus};
use labqueue::notify::Observer;
use labqueue::plan::TestPlan;

#[derive(Parser)]
#[command(
    name = "labqueue",
    about = "Sequential test queue for automotive bench rigs",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $LABQUEUE_CONFIG, then ./labqueue.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a test plan to completion
    Run {
        /// Plan file (TOML)
        plan: PathBuf,

        /// Session label used for the run directory
        #[arg(long)]
        label: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Parse a plan and check that every target resolves
    Validate {
        /// Plan file (TOML)
        plan: PathBuf,
    },

    /// Print the effective configuration
    ShowConfig,
}

fn load_config(path: Option<&Path>) -> Result<RunnerConfig> {
    match path {
        Some(path) => RunnerConfig::load(path),
        None => Ok(RunnerConfig::load_or_default()),
    }
}

fn init_tracing(config: &RunnerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Run { plan, label, json } => run(&config, &plan, label.as_deref(), json).await,
        Commands::Validate { plan } => validate(&config, &plan),
        Commands::ShowConfig => {
            let text = toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{}", text);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: &RunnerConfig, plan_path: &Path, label: Option<&str>, json: bool) -> Result<ExitCode> {
    let plan = TestPlan::load(plan_path)?;
    tracing::info!(plan = %plan_path.display(), tests = plan.tests.len(), "running plan");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let progress: Option<Observer> = if json {
        None
    } else {
        Some(Arc::new(|result: &TestResult| -> anyhow::Result<()> {
            eprintln!("  {:<8} {}", result.status, result.item.name);
            Ok(())
        }))
    };

    let outcome = labqueue::run_plan(config, plan, label, progress, shutdown).await?;
    let summary = outcome.summary;

    if json {
        let results: Vec<_> = outcome
            .results
            .iter()
            .map(|r| {
                json!({
                    "test": r.item.name,
                    "kind": r.item.kind,
                    "status": r.status,
                    "details": r.details(),
                })
            })
            .collect();
        let report = json!({
            "summary": summary,
            "resultsFile": outcome.results_file.as_ref().map(|p| p.display().to_string()),
            "interrupted": outcome.interrupted,
            "results": results,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\nlabqueue run report");
        println!("{:<30} | {:<8} | {:>9} | Message", "Test", "Status", "Duration");
        println!("{:-<30}-|-{:-<8}-|-{:->9}-|-{:-<40}", "", "", "", "");
        for r in &outcome.results {
            println!(
                "{:<30} | {:<8} | {:>8.3}s | {}",
                r.item.name,
                r.status,
                r.duration_seconds(),
                r.message
            );
        }
        println!(
            "\n{} total, {} passed, {} failed, {} errors, {} skipped in {:.1}s",
            summary.total,
            summary.passed,
            summary.failed,
            summary.errored,
            summary.skipped,
            summary.elapsed.as_secs_f64()
        );
        if let Some(path) = &outcome.results_file {
            println!("Results written to {}", path.display());
        }
        if outcome.interrupted {
            println!("Run interrupted before the queue was drained.");
        }
    }

    if summary.all_passed() && !outcome.interrupted {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn validate(config: &RunnerConfig, plan_path: &Path) -> Result<ExitCode> {
    let plan = TestPlan::load(plan_path)?;
    let dispatcher = config.dispatcher();

    let mut problems = 0;
    println!("{:<30} | {:<15} | Target", "Test", "Kind");
    println!("{:-<30}-|-{:-<15}-|-{:-<40}", "", "", "");
    for test in &plan.tests {
        let item = &test.item;
        let verdict = if !test.enabled {
            "disabled".to_string()
        } else {
            match dispatcher.resolve(item) {
                Ok(path) => path.display().to_string(),
                Err(e) => {
                    problems += 1;
                    format!("{} ({})", TestStatus::Error, e)
                }
            }
        };
        println!("{:<30} | {:<15} | {}", item.name, item.kind, verdict);
    }

    if problems == 0 {
        println!("\n{} tests, {} enabled, all targets resolved", plan.tests.len(), plan.enabled_count());
        Ok(ExitCode::SUCCESS)
    } else {
        println!("\n{} of {} tests have unresolved targets", problems, plan.tests.len());
        Ok(ExitCode::FAILURE)
    }
}
