//! Run log: the logging collaborator and per-session results persistence.
//!
//! Each session gets its own directory under the configured log root.
//! Results are accumulated in memory and written once, as `results.json`,
//! when the session ends. Telemetry samples and collaborator errors logged
//! while the session is open are appended to `events.jsonl`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::collab::ResultSink;
use crate::item::TestStatus;

pub const RESULTS_FILE: &str = "results.json";
pub const EVENTS_FILE: &str = "events.jsonl";

/// One completed item as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    pub test: String,
    pub status: TestStatus,
    pub timestamp: String,
    pub details: Map<String, Value>,
}

/// The document written at the end of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub run_directory: String,
    pub elapsed_seconds: f64,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub results: Vec<ResultEntry>,
}

impl SessionReport {
    fn build(dir: &Path, opened: Instant, results: Vec<ResultEntry>) -> Self {
        let count = |status: TestStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            run_directory: dir.display().to_string(),
            elapsed_seconds: (opened.elapsed().as_secs_f64() * 1000.0).round() / 1000.0,
            total: results.len(),
            passed: count(TestStatus::Success),
            failed: count(TestStatus::Failed),
            errored: count(TestStatus::Error),
            skipped: count(TestStatus::Skipped),
            results,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }
}

struct ActiveRun {
    dir: PathBuf,
    opened: Instant,
    results: Vec<ResultEntry>,
}

pub struct RunLog {
    log_dir: PathBuf,
    active: Mutex<Option<ActiveRun>>,
}

impl RunLog {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new session directory `<log_dir>/<YYYYMMDD_HHMMSS>_<label>`.
    ///
    /// A session that is still open is ended first.
    pub fn start(&self, label: &str) -> Result<PathBuf> {
        if self.run_dir().is_some() {
            warn!("previous run was not ended, closing it");
            self.end()?;
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("{}_{}", stamp, sanitize(label));
        let mut dir = self.log_dir.join(&base);
        let mut n = 1;
        while dir.exists() {
            n += 1;
            dir = self.log_dir.join(format!("{}_{}", base, n));
        }
        fs::create_dir_all(&dir).with_context(|| format!("failed to create run directory {}", dir.display()))?;

        info!(run_dir = %dir.display(), "run started");
        *self.active() = Some(ActiveRun {
            dir: dir.clone(),
            opened: Instant::now(),
            results: Vec::new(),
        });
        Ok(dir)
    }

    pub fn run_dir(&self) -> Option<PathBuf> {
        self.active().as_ref().map(|r| r.dir.clone())
    }

    /// Record instrument readings that are not tied to a single test.
    pub fn log_telemetry(&self, source: &str, values: &Map<String, Value>) -> Result<()> {
        let sample = Value::Object(values.clone());
        info!(source, values = %sample, "telemetry");
        self.append_event(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "kind": "telemetry",
            "source": source,
            "values": values,
        }))
    }

    /// Record a collaborator error.
    pub fn log_error(&self, source: &str, message: &str) -> Result<()> {
        error!(source, error = message, "collaborator error");
        self.append_event(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "kind": "error",
            "source": source,
            "message": message,
        }))
    }

    fn append_event(&self, event: Value) -> Result<()> {
        let Some(dir) = self.run_dir() else {
            return Ok(());
        };
        let path = dir.join(EVENTS_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{}", event).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Close the session and write `results.json`.
    ///
    /// Returns the file's path, or `None` when no session was open.
    pub fn end(&self) -> Result<Option<PathBuf>> {
        let Some(run) = self.active().take() else {
            return Ok(None);
        };

        let report = SessionReport::build(&run.dir, run.opened, run.results);
        let path = run.dir.join(RESULTS_FILE);
        let body = serde_json::to_string_pretty(&report)?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;

        info!(
            path = %path.display(),
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            errored = report.errored,
            "run ended"
        );
        Ok(Some(path))
    }
}

impl ResultSink for RunLog {
    fn log_result(&self, name: &str, status: TestStatus, details: &Map<String, Value>) {
        info!(test = name, %status, "result");
        let mut active = self.active();
        match active.as_mut() {
            Some(run) => run.results.push(ResultEntry {
                test: name.to_string(),
                status,
                timestamp: Utc::now().to_rfc3339(),
                details: details.clone(),
            }),
            None => warn!(test = name, "result logged with no run in progress"),
        }
    }
}

fn sanitize(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}
