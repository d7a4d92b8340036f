//! Subprocess script adapter.
//!
//! The script runs as a child process. Parameters are written to its stdin
//! as one JSON object; the last non-empty stdout line is its return value
//! (JSON when it parses, a plain string otherwise, `true` when empty).
//! Exit code 0 returns that value, exit code 1 is a validation failure whose
//! message is the last stderr line, anything else is a fault.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Executable, ScriptFault, ScriptLoader};
use crate::item::Parameters;

/// Exit code a script uses to report that its criterion was not met.
pub const VALIDATION_EXIT_CODE: i32 = 1;

/// Loads scripts as child processes, optionally through an interpreter.
#[derive(Debug, Clone, Default)]
pub struct ProcessLoader {
    interpreter: Option<PathBuf>,
    args: Vec<String>,
}

impl ProcessLoader {
    /// Execute scripts directly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute scripts as `<interpreter> <args...> <script>`.
    pub fn with_interpreter(interpreter: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            interpreter: Some(interpreter.into()),
            args,
        }
    }
}

#[async_trait]
impl ScriptLoader for ProcessLoader {
    async fn load(&self, path: &Path) -> Result<Arc<dyn Executable>, ScriptFault> {
        if !path.is_file() {
            return Err(ScriptFault::fault(format!("file not found: {}", path.display())));
        }

        let (program, mut args) = match &self.interpreter {
            Some(interp) => (interp.clone(), self.args.clone()),
            None => {
                if !is_executable(path) {
                    return Err(ScriptFault::fault(format!(
                        "{} has no runnable entry point (not executable and no interpreter configured)",
                        path.display()
                    )));
                }
                (path.to_path_buf(), Vec::new())
            }
        };
        if self.interpreter.is_some() {
            args.push(path.display().to_string());
        }

        Ok(Arc::new(ProcessScript { program, args }))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

struct ProcessScript {
    program: PathBuf,
    args: Vec<String>,
}

#[async_trait]
impl Executable for ProcessScript {
    async fn run(&self, parameters: &Parameters) -> Result<Value, ScriptFault> {
        let payload = serde_json::to_vec(parameters)
            .map_err(|e| ScriptFault::fault(format!("cannot encode parameters: {}", e)))?;

        debug!(program = %self.program.display(), args = ?self.args, "spawning script");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the attempt (abort, timeout) must not leave the script running.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScriptFault::fault(format!("failed to start {}: {}", self.program.display(), e)))?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // Scripts that ignore their parameters may exit before reading.
                let _ = stdin.write_all(&payload).await;
            }
        };
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| ScriptFault::fault(format!("failed to collect script output: {}", e)))?;

        interpret(&output)
    }
}

fn interpret(output: &Output) -> Result<Value, ScriptFault> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    match output.status.code() {
        Some(0) => Ok(return_value(&stdout)),
        Some(VALIDATION_EXIT_CODE) => Err(ScriptFault::validation(
            last_line(&stderr).unwrap_or("script reported a validation failure"),
        )),
        Some(code) => Err(ScriptFault::fault(format!(
            "script exited with code {}\n{}",
            code,
            stderr.trim_end()
        ))),
        None => Err(ScriptFault::fault(format!(
            "script terminated by signal\n{}",
            stderr.trim_end()
        ))),
    }
}

fn return_value(stdout: &str) -> Value {
    match last_line(stdout) {
        None => Value::Bool(true),
        Some(line) => serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string())),
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}
