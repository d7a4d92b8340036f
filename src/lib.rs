//! labqueue -- sequential test queue for automotive bench rigs.
//!
//! Test items (scripted checks, debugger macros, bus simulations) are queued
//! in FIFO order and executed one at a time by a single background worker,
//! with per-item retries, per-attempt timeouts, operator abort, and a JSON
//! results log per session.

pub mod collab;
pub mod config;
pub mod dispatch;
pub mod item;
pub mod notify;
pub mod plan;
pub mod retry;
pub mod scheduler;
pub mod script;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::item::TestResult;
use crate::notify::{Observer, Summary};
use crate::plan::TestPlan;
use crate::scheduler::Scheduler;
use crate::session::RunLog;

/// What a completed plan run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: Summary,
    pub results: Vec<Arc<TestResult>>,
    /// `results.json` of the session.
    pub results_file: Option<PathBuf>,
    /// Set when the run was interrupted through `shutdown`.
    pub interrupted: bool,
}

/// Execute every test of `plan` in order and persist the session.
///
/// Cancelling `shutdown` aborts the in-flight item and stops the worker
/// before the next one; whatever completed is still written out.
pub async fn run_plan(
    config: &RunnerConfig,
    plan: TestPlan,
    label: Option<&str>,
    on_result: Option<Observer>,
    shutdown: CancellationToken,
) -> Result<RunOutcome> {
    let run_log = Arc::new(RunLog::new(&config.logging.log_dir));
    let run_dir = run_log
        .start(label.unwrap_or(&plan.label))
        .context("failed to open run log")?;
    info!(plan = %plan.path.display(), run_dir = %run_dir.display(), tests = plan.tests.len(), "starting plan");

    let scheduler = Scheduler::builder(config.dispatcher())
        .retry_policy(config.retry_policy())
        .sink(run_log.clone())
        .poll_interval(config.runner.poll_interval())
        .build();

    for test in plan.tests {
        let enabled = test.enabled;
        let id = scheduler.enqueue(test.item)?;
        if !enabled {
            scheduler.skip_when_reached(id);
        }
    }
    scheduler.close();

    scheduler.start(on_result);
    scheduler.stop_when_idle();

    let worker = scheduler.wait();
    tokio::pin!(worker);
    let interrupted = tokio::select! {
        _ = &mut worker => false,
        _ = shutdown.cancelled() => {
            warn!("interrupt received, aborting current item");
            scheduler.stop();
            scheduler.abort_current();
            (&mut worker).await;
            true
        }
    };

    let results_file = run_log.end().context("failed to write session results")?;
    Ok(RunOutcome {
        summary: scheduler.summary(),
        results: scheduler.results(),
        results_file,
        interrupted,
    })
}
