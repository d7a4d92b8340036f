//! Debugger driven through its command-line front end.
//!
//! Most debugger front ends accept a startup macro (`t32marm64 -s boot.cmm`)
//! and exit with a non-zero code when the macro stops on an error. This
//! adapter uses that mode when no remote-control session is available.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::Debugger;
use crate::item::Parameters;

/// Prefix of the environment variables carrying item parameters.
pub const PARAM_ENV_PREFIX: &str = "LABQUEUE_PARAM_";

pub struct CommandDebugger {
    executable: PathBuf,
    args: Vec<String>,
    last_error: Mutex<Option<String>>,
}

impl CommandDebugger {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            last_error: Mutex::new(None),
        }
    }

    fn set_last_error(&self, err: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = err;
    }
}

/// `LABQUEUE_PARAM_<KEY>` pairs; strings are passed raw, everything else as JSON.
pub fn parameter_env(parameters: &Parameters) -> Vec<(String, String)> {
    parameters
        .iter()
        .map(|(k, v)| {
            let key = format!("{}{}", PARAM_ENV_PREFIX, k.to_ascii_uppercase());
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

#[async_trait]
impl Debugger for CommandDebugger {
    async fn run_macro(&self, path: &Path, parameters: &Parameters, timeout: Duration) -> Result<bool> {
        info!(executable = %self.executable.display(), script = %path.display(), "launching debugger macro");

        let child = Command::new(&self.executable)
            .args(&self.args)
            .arg(path)
            .envs(parameter_env(parameters))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch debugger {}", self.executable.display()))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.context("failed to collect debugger output")?,
            Err(_) => anyhow::bail!(
                "debugger macro {} did not complete within {:.0}s",
                path.display(),
                timeout.as_secs_f64()
            ),
        };

        if output.status.success() {
            self.set_last_error(None);
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(str::to_string)
            .unwrap_or_else(|| match output.status.code() {
                Some(code) => format!("macro exited with code {}", code),
                None => "macro terminated by signal".to_string(),
            });
        warn!(script = %path.display(), %reason, "debugger macro reported an error");
        self.set_last_error(Some(reason));
        Ok(false)
    }

    async fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
