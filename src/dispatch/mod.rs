//! Execution dispatcher: runs one attempt of a test item against its
//! collaborator and normalizes whatever happens into a [`TestResult`].
//!
//! Every attempt runs in its own task under the item's timeout. Faults,
//! timeouts and panics are all converted at this boundary; nothing escapes
//! to the scheduler's worker loop.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::collab::Collaborators;
use crate::item::{Telemetry, TestItem, TestKind, TestResult, TestStatus};
use crate::script::{is_truthy, ScriptFault};

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("target not found: {target}")]
    TargetNotFound { target: String },

    #[error("{collaborator} collaborator not configured")]
    CollaboratorMissing { collaborator: &'static str },

    #[error("attempt timed out after {secs:.1}s")]
    Timeout { secs: f64 },

    #[error(transparent)]
    Script(#[from] ScriptFault),

    #[error("collaborator fault: {0:#}")]
    Collaborator(anyhow::Error),

    #[error("dispatch panicked: {0}")]
    Panicked(String),

    #[error("aborted by operator request")]
    Aborted,
}

impl DispatchError {
    /// Validation failures are `Failed`; everything else is an environment fault.
    pub fn status(&self) -> TestStatus {
        match self {
            DispatchError::Script(ScriptFault::Validation(_)) => TestStatus::Failed,
            _ => TestStatus::Error,
        }
    }
}

/// Status, message and telemetry of a finished attempt.
#[derive(Debug)]
struct Outcome {
    status: TestStatus,
    message: String,
    telemetry: Telemetry,
}

impl Outcome {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Success,
            message: message.into(),
            telemetry: Telemetry::new(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Failed,
            message: message.into(),
            telemetry: Telemetry::new(),
        }
    }
}

/// Maps items onto collaborators.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    collaborators: Collaborators,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn timeout_for(&self, item: &TestItem) -> Duration {
        item.timeout.unwrap_or(self.default_timeout)
    }

    /// Check that the item's target exists. Done once, before the first attempt.
    pub fn resolve(&self, item: &TestItem) -> Result<PathBuf, DispatchError> {
        match item.kind {
            TestKind::ScriptedRun => self
                .collaborators
                .scripts
                .resolve(&item.target)
                .map_err(|_| DispatchError::TargetNotFound {
                    target: item.target.clone(),
                }),
            TestKind::DebuggerMacro | TestKind::BusSimulation => resolve_file(&item.target),
        }
    }

    /// Run one attempt.
    ///
    /// When `cancel` fires during a cancellable attempt, the attempt is
    /// dropped and the result is an aborted `Error`. Other kinds ignore the
    /// token and run to completion.
    pub async fn dispatch(&self, item: &Arc<TestItem>, cancel: &CancellationToken) -> TestResult {
        let started = Instant::now();
        let timeout = self.timeout_for(item);
        let collaborators = self.collaborators.clone();
        let attempt_item = Arc::clone(item);

        debug!(item = %item.name, kind = %item.kind, target = %item.target, "dispatching");
        let mut handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, execute(&collaborators, &attempt_item, timeout)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(DispatchError::Timeout {
                    secs: timeout.as_secs_f64(),
                }),
            }
        });

        let joined = if item.kind.supports_cancellation() {
            tokio::select! {
                joined = &mut handle => joined,
                _ = cancel.cancelled() => {
                    handle.abort();
                    Ok(Err(DispatchError::Aborted))
                }
            }
        } else {
            (&mut handle).await
        };

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => Err(DispatchError::Panicked(panic_message(join_err.into_panic()))),
            Err(join_err) => Err(DispatchError::Panicked(join_err.to_string())),
        };

        let mut result = match outcome {
            Ok(outcome) => {
                let mut result = TestResult::new(Arc::clone(item), outcome.status, outcome.message);
                result.telemetry = outcome.telemetry;
                result
            }
            Err(err) => {
                let status = err.status();
                if status == TestStatus::Error {
                    error!(item = %item.name, error = %err, "dispatch fault");
                } else {
                    info!(item = %item.name, reason = %err, "validation failed");
                }
                TestResult::new(Arc::clone(item), status, err.to_string())
            }
        };
        result.duration = started.elapsed();
        result
    }
}

fn resolve_file(target: &str) -> Result<PathBuf, DispatchError> {
    let path = PathBuf::from(target);
    if path.is_file() {
        Ok(path)
    } else {
        Err(DispatchError::TargetNotFound {
            target: target.to_string(),
        })
    }
}

async fn execute(collaborators: &Collaborators, item: &TestItem, timeout: Duration) -> Result<Outcome, DispatchError> {
    match item.kind {
        TestKind::ScriptedRun => run_script(collaborators, item).await,
        TestKind::DebuggerMacro => run_macro(collaborators, item, timeout).await,
        TestKind::BusSimulation => run_bus(collaborators, item).await,
    }
}

async fn run_script(collaborators: &Collaborators, item: &TestItem) -> Result<Outcome, DispatchError> {
    let scripts = &collaborators.scripts;
    let path = scripts.resolve(&item.target)?;
    let script = scripts.load(&path).await?;
    let value = script.run(&item.parameters).await?;
    Ok(interpret_return(value))
}

/// Truthy values pass (a mapping becomes telemetry), falsy values fail.
fn interpret_return(value: Value) -> Outcome {
    if !is_truthy(&value) {
        return Outcome::failed(format!("run() returned falsy value: {}", value));
    }
    match value {
        Value::Bool(_) => Outcome::success("OK"),
        Value::String(s) => Outcome::success(s),
        Value::Object(map) => {
            let mut outcome = Outcome::success(Value::Object(map.clone()).to_string());
            outcome.telemetry = map;
            outcome
        }
        other => Outcome::success(other.to_string()),
    }
}

async fn run_macro(collaborators: &Collaborators, item: &TestItem, timeout: Duration) -> Result<Outcome, DispatchError> {
    let debugger = collaborators
        .debugger
        .as_ref()
        .ok_or(DispatchError::CollaboratorMissing { collaborator: "debugger" })?;
    let path = resolve_file(&item.target)?;

    let completed = debugger
        .run_macro(&path, &item.parameters, timeout)
        .await
        .map_err(DispatchError::Collaborator)?;
    if completed {
        Ok(Outcome::success("macro completed"))
    } else {
        let reason = debugger
            .last_error()
            .await
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "macro reported failure".to_string());
        Ok(Outcome::failed(reason))
    }
}

async fn run_bus(collaborators: &Collaborators, item: &TestItem) -> Result<Outcome, DispatchError> {
    let bus = collaborators
        .bus
        .as_ref()
        .ok_or(DispatchError::CollaboratorMissing {
            collaborator: "bus-simulation",
        })?;
    let path = resolve_file(&item.target)?;

    let started = bus.run_configuration(&path).await.map_err(DispatchError::Collaborator)?;
    let state = bus.state().await;
    if started {
        Ok(Outcome::success(format!("bus simulation state: {}", state)))
    } else {
        Ok(Outcome::failed(format!("bus simulation failed to start (state: {})", state)))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{BusSimulator, Debugger};
    use crate::item::Parameters;
    use crate::script::ScriptRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;

    fn registry_dispatcher(registry: ScriptRegistry) -> Dispatcher {
        Dispatcher::new(Collaborators::new(Arc::new(registry)))
    }

    fn scripted(target: &str) -> Arc<TestItem> {
        Arc::new(TestItem::new(target, TestKind::ScriptedRun, target))
    }

    struct FakeDebugger {
        completes: bool,
        error: Option<String>,
    }

    #[async_trait]
    impl Debugger for FakeDebugger {
        async fn run_macro(&self, _path: &Path, _parameters: &Parameters, _timeout: Duration) -> anyhow::Result<bool> {
            Ok(self.completes)
        }

        async fn last_error(&self) -> Option<String> {
            self.error.clone()
        }
    }

    struct HangingDebugger;

    #[async_trait]
    impl Debugger for HangingDebugger {
        async fn run_macro(&self, _path: &Path, _parameters: &Parameters, _timeout: Duration) -> anyhow::Result<bool> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(true)
        }

        async fn last_error(&self) -> Option<String> {
            None
        }
    }

    struct FakeBus {
        starts: bool,
    }

    #[async_trait]
    impl BusSimulator for FakeBus {
        async fn run_configuration(&self, _path: &Path) -> anyhow::Result<bool> {
            Ok(self.starts)
        }

        async fn state(&self) -> String {
            let state = if self.starts { "running" } else { "stopped" };
            state.to_string()
        }
    }

    fn target_file() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[tokio::test]
    async fn test_mapping_return_becomes_telemetry() {
        let registry = ScriptRegistry::new();
        registry.register_fn("volts", |_| Ok(json!({"voltage": 12.01})));
        let dispatcher = registry_dispatcher(registry);

        let result = dispatcher.dispatch(&scripted("volts"), &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Success);
        assert_eq!(result.telemetry.get("voltage"), Some(&json!(12.01)));
    }

    #[tokio::test]
    async fn test_true_and_string_returns() {
        let registry = ScriptRegistry::new();
        registry.register_fn("bool", |_| Ok(json!(true)));
        registry.register_fn("text", |_| Ok(json!("rails nominal")));
        let dispatcher = registry_dispatcher(registry);

        let result = dispatcher.dispatch(&scripted("bool"), &CancellationToken::new()).await;
        assert_eq!((result.status, result.message.as_str()), (TestStatus::Success, "OK"));

        let result = dispatcher.dispatch(&scripted("text"), &CancellationToken::new()).await;
        assert_eq!((result.status, result.message.as_str()), (TestStatus::Success, "rails nominal"));
        assert!(result.telemetry.is_empty());
    }

    #[tokio::test]
    async fn test_falsy_return_is_failed() {
        let registry = ScriptRegistry::new();
        registry.register_fn("falsy", |_| Ok(json!(false)));
        let dispatcher = registry_dispatcher(registry);

        let result = dispatcher.dispatch(&scripted("falsy"), &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Failed);
    }

    #[tokio::test]
    async fn test_validation_fault_is_failed_with_message() {
        let registry = ScriptRegistry::new();
        registry.register_fn("range", |_| Err(ScriptFault::validation("out of range")));
        let dispatcher = registry_dispatcher(registry);

        let result = dispatcher.dispatch(&scripted("range"), &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.message.contains("out of range"));
    }

    #[tokio::test]
    async fn test_other_fault_is_error() {
        let registry = ScriptRegistry::new();
        registry.register_fn("crash", |_| Err(ScriptFault::fault("RuntimeError: crash")));
        let dispatcher = registry_dispatcher(registry);

        let result = dispatcher.dispatch(&scripted("crash"), &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.message.contains("crash"));
    }

    #[tokio::test]
    async fn test_panicking_script_is_caught() {
        let registry = ScriptRegistry::new();
        registry.register_fn("panic", |_| panic!("probe wire snapped"));
        let dispatcher = registry_dispatcher(registry);

        let result = dispatcher.dispatch(&scripted("panic"), &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.message.contains("probe wire snapped"));
    }

    #[tokio::test]
    async fn test_blocking_script_hits_timeout() {
        let registry = ScriptRegistry::new();
        registry.register_fn("relay_poll", |_| {
            std::thread::sleep(Duration::from_millis(800));
            Ok(json!(true))
        });
        let dispatcher = registry_dispatcher(registry);
        let item = Arc::new(TestItem::new("relay", TestKind::ScriptedRun, "relay_poll").with_timeout(Duration::from_millis(100)));

        let result = dispatcher.dispatch(&item, &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.message.contains("timed out"), "{}", result.message);
        assert!(result.duration < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_unknown_script_is_error() {
        let dispatcher = registry_dispatcher(ScriptRegistry::new());
        let result = dispatcher.dispatch(&scripted("nope"), &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Error);
    }

    #[tokio::test]
    async fn test_macro_without_debugger_is_error() {
        let file = target_file();
        let item = Arc::new(TestItem::new("boot", TestKind::DebuggerMacro, file.path().display().to_string()));
        let dispatcher = Dispatcher::new(Collaborators::default());

        let result = dispatcher.dispatch(&item, &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.message.contains("debugger"));
    }

    #[tokio::test]
    async fn test_macro_outcomes() {
        let file = target_file();
        let item = Arc::new(TestItem::new("boot", TestKind::DebuggerMacro, file.path().display().to_string()));

        let ok = Dispatcher::new(Collaborators::default().with_debugger(Arc::new(FakeDebugger {
            completes: true,
            error: None,
        })));
        assert_eq!(ok.dispatch(&item, &CancellationToken::new()).await.status, TestStatus::Success);

        let failing = Dispatcher::new(Collaborators::default().with_debugger(Arc::new(FakeDebugger {
            completes: false,
            error: Some("Breakpoint not reached".into()),
        })));
        let result = failing.dispatch(&item, &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(result.message, "Breakpoint not reached");
    }

    #[tokio::test]
    async fn test_hanging_macro_times_out_as_error() {
        let file = target_file();
        let item = Arc::new(
            TestItem::new("hang", TestKind::DebuggerMacro, file.path().display().to_string())
                .with_timeout(Duration::from_millis(50)),
        );
        let dispatcher = Dispatcher::new(Collaborators::default().with_debugger(Arc::new(HangingDebugger)));

        let result = dispatcher.dispatch(&item, &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_bus_outcomes_surface_state() {
        let file = target_file();
        let item = Arc::new(TestItem::new("bus", TestKind::BusSimulation, file.path().display().to_string()));

        let running = Dispatcher::new(Collaborators::default().with_bus(Arc::new(FakeBus { starts: true })));
        let result = running.dispatch(&item, &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Success);
        assert!(result.message.contains("running"));

        let stopped = Dispatcher::new(Collaborators::default().with_bus(Arc::new(FakeBus { starts: false })));
        let result = stopped.dispatch(&item, &CancellationToken::new()).await;
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.message.contains("stopped"));
    }

    #[tokio::test]
    async fn test_bus_without_collaborator_is_error() {
        let file = target_file();
        let item = Arc::new(TestItem::new("bus", TestKind::BusSimulation, file.path().display().to_string()));
        let result = Dispatcher::new(Collaborators::default())
            .dispatch(&item, &CancellationToken::new())
            .await;
        assert_eq!(result.status, TestStatus::Error);
    }

    #[test]
    fn test_resolve_missing_target() {
        let dispatcher = Dispatcher::new(Collaborators::default());
        let item = TestItem::new("boot", TestKind::DebuggerMacro, "/nonexistent/boot.cmm");
        assert!(matches!(dispatcher.resolve(&item), Err(DispatchError::TargetNotFound { .. })));
    }
}
