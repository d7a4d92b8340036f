//! Test items, lifecycle states and results.
//!
//! A [`TestItem`] is immutable once it has been enqueued; the scheduler
//! shares it as an `Arc<TestItem>` between the queue, the retry loop and
//! every [`TestResult`] produced for it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Parameters passed to a scripted run. Keys are script argument names.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Structured data reported back by a scripted run.
pub type Telemetry = serde_json::Map<String, serde_json::Value>;

/// The closed set of executor kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestKind {
    /// Invoke a script's entry point with the item's parameters.
    #[serde(alias = "python")]
    ScriptedRun,
    /// Run a command macro on a connected debugger.
    #[serde(alias = "cmm")]
    DebuggerMacro,
    /// Start a bus-simulation configuration.
    #[serde(alias = "canoe")]
    BusSimulation,
}

impl TestKind {
    /// Guess the kind from a target's file extension.
    pub fn infer(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("cmm") => TestKind::DebuggerMacro,
            Some("can") | Some("cfg") => TestKind::BusSimulation,
            _ => TestKind::ScriptedRun,
        }
    }

    /// Whether an in-flight dispatch of this kind can be cancelled.
    ///
    /// Debugger and bus-simulation sessions offer no cancel primitive, so an
    /// abort only takes effect once their call returns.
    pub fn supports_cancellation(self) -> bool {
        matches!(self, TestKind::ScriptedRun)
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TestKind::ScriptedRun => "scripted-run",
            TestKind::DebuggerMacro => "debugger-macro",
            TestKind::BusSimulation => "bus-simulation",
        };
        f.pad(name)
    }
}

/// One unit of work.
#[derive(Debug, Clone)]
pub struct TestItem {
    pub id: Uuid,
    /// Display name; unique within a session by convention only.
    pub name: String,
    pub kind: TestKind,
    /// Path or identifier interpreted per kind.
    pub target: String,
    pub parameters: Parameters,
    /// Additional attempts beyond the first (0 = use the session default).
    pub retry_budget: u32,
    /// Per-attempt timeout; `None` falls back to the dispatcher default.
    pub timeout: Option<Duration>,
}

impl TestItem {
    pub fn new(name: impl Into<String>, kind: TestKind, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            target: target.into(),
            parameters: Parameters::new(),
            retry_budget: 0,
            timeout: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_retry_budget(mut self, retries: u32) -> Self {
        self.retry_budget = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Lifecycle state of an item.
///
/// `Running` is transient and never appears in a recorded result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Queued,
    Running,
    Success,
    /// The test's own criterion was not met.
    Failed,
    /// The execution environment faulted.
    Error,
    Skipped,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TestStatus::Queued | TestStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Queued => "QUEUED",
            TestStatus::Running => "RUNNING",
            TestStatus::Success => "SUCCESS",
            TestStatus::Failed => "FAILED",
            TestStatus::Error => "ERROR",
            TestStatus::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of one attempt, or the final outcome of an item.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub item: Arc<TestItem>,
    pub status: TestStatus,
    pub message: String,
    pub telemetry: Telemetry,
    /// Wall-clock time from dispatch start to completion or fault.
    pub duration: Duration,
    /// Set when an operator abort was requested while the item was in flight.
    pub aborted: bool,
    /// Dispatch attempts made. Zero for skipped items and unresolved targets.
    pub attempts: u32,
}

impl TestResult {
    pub fn new(item: Arc<TestItem>, status: TestStatus, message: impl Into<String>) -> Self {
        Self {
            item,
            status,
            message: message.into(),
            telemetry: Telemetry::new(),
            duration: Duration::ZERO,
            aborted: false,
            attempts: 0,
        }
    }

    pub fn skipped(item: Arc<TestItem>) -> Self {
        Self::new(item, TestStatus::Skipped, "skipped before dispatch")
    }

    pub fn duration_seconds(&self) -> f64 {
        // Millisecond resolution is what the run log reports.
        (self.duration.as_secs_f64() * 1000.0).round() / 1000.0
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Success
    }

    /// Details handed to the logging collaborator: message and duration,
    /// merged with any telemetry.
    pub fn details(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut details = serde_json::Map::new();
        details.insert("message".into(), self.message.clone().into());
        details.insert("durationSeconds".into(), self.duration_seconds().into());
        if self.attempts > 1 {
            details.insert("attempts".into(), self.attempts.into());
        }
        if self.aborted {
            details.insert("aborted".into(), true.into());
        }
        for (key, value) in &self.telemetry {
            details.insert(key.clone(), value.clone());
        }
        details
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_infer_kind_from_extension() {
        assert_eq!(TestKind::infer(&PathBuf::from("boot.cmm")), TestKind::DebuggerMacro);
        assert_eq!(TestKind::infer(&PathBuf::from("bus/Body.CFG")), TestKind::BusSimulation);
        assert_eq!(TestKind::infer(&PathBuf::from("bus/diag.can")), TestKind::BusSimulation);
        assert_eq!(TestKind::infer(&PathBuf::from("volts.py")), TestKind::ScriptedRun);
        assert_eq!(TestKind::infer(&PathBuf::from("no_extension")), TestKind::ScriptedRun);
    }

    #[test]
    fn test_kind_accepts_legacy_names() {
        let kind: TestKind = serde_json::from_str("\"cmm\"").unwrap();
        assert_eq!(kind, TestKind::DebuggerMacro);
        let kind: TestKind = serde_json::from_str("\"bus-simulation\"").unwrap();
        assert_eq!(kind, TestKind::BusSimulation);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&TestStatus::Success).unwrap(), "\"SUCCESS\"");
        assert!(TestStatus::Skipped.is_terminal());
        assert!(!TestStatus::Running.is_terminal());
    }

    #[test]
    fn test_details_merge_telemetry() {
        let item = Arc::new(TestItem::new("volts", TestKind::ScriptedRun, "volts.py"));
        let mut result = TestResult::new(item, TestStatus::Success, "ok");
        result.duration = Duration::from_millis(1234);
        result.telemetry.insert("voltage".into(), 12.01.into());

        let details = result.details();
        assert_eq!(details["message"], "ok");
        assert_eq!(details["durationSeconds"], 1.234);
        assert_eq!(details["voltage"], 12.01);
        assert!(!details.contains_key("aborted"));
    }
}
