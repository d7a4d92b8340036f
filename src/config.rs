//! TOML configuration for the test runner.
//!
//! Every section is optional. Lookup order for [`RunnerConfig::load_or_default`]:
//! `$LABQUEUE_CONFIG`, then `./labqueue.toml`, then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collab::{Collaborators, CommandDebugger};
use crate::dispatch::Dispatcher;
use crate::retry::RetryPolicy;
use crate::script::ProcessLoader;

pub const CONFIG_ENV: &str = "LABQUEUE_CONFIG";
pub const LOCAL_CONFIG: &str = "labqueue.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub debugger: DebuggerConfig,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded runner configuration");
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "LABQUEUE_CONFIG set but file could not be loaded, trying fallback"
                ),
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(
                    path = %local.display(),
                    error = %e,
                    "local config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.runner.timeout_secs == 0 {
            bail!("runner.timeout_secs must be greater than zero");
        }
        if self.runner.poll_interval_ms == 0 {
            bail!("runner.poll_interval_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(self.runner.auto_retry, self.runner.retry_count)
    }

    /// Collaborators available from configuration alone: the script loader
    /// and, when configured, the command-line debugger.
    pub fn collaborators(&self) -> Collaborators {
        let mut collaborators = Collaborators::new(Arc::new(self.scripts.loader()));
        if let Some(exe) = &self.debugger.executable {
            collaborators = collaborators.with_debugger(Arc::new(CommandDebugger::new(exe, self.debugger.args.clone())));
        }
        collaborators
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.collaborators()).with_default_timeout(self.runner.timeout())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// Apply `retry_count` to items that do not set their own budget.
    pub auto_retry: bool,
    pub retry_count: u32,
    /// Default per-attempt timeout.
    pub timeout_secs: u64,
    /// Bounded wait of the idle worker.
    pub poll_interval_ms: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            auto_retry: true,
            retry_count: 1,
            timeout_secs: 300,
            poll_interval_ms: 500,
        }
    }
}

impl RunnerSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Root of the per-run directories.
    pub log_dir: PathBuf,
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,
    /// Emit log lines as JSON.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Interpreter for script targets, e.g. `python3`. Unset = run directly.
    pub interpreter: Option<PathBuf>,
    pub args: Vec<String>,
}

impl ScriptsConfig {
    pub fn loader(&self) -> ProcessLoader {
        match &self.interpreter {
            Some(interp) => ProcessLoader::with_interpreter(interp, self.args.clone()),
            None => ProcessLoader::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Debugger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Debugger front-end executable. Unset = no debugger collaborator.
    pub executable: Option<PathBuf>,
    /// Arguments placed before the macro path.
    pub args: Vec<String>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: vec!["-s".to_string()],
        }
    }
}
