//! Boundaries to the lab hardware and the results sink.
//!
//! The core never speaks an instrument protocol itself. Each hardware
//! category is a trait; a [`Collaborators`] value holds one typed handle per
//! category and is handed to the dispatcher at construction.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::item::{Parameters, TestStatus};
use crate::script::{ProcessLoader, ScriptLoader};

pub mod debugger;

pub use debugger::CommandDebugger;

/// ECU debugger remote control.
#[async_trait]
pub trait Debugger: Send + Sync {
    /// Run a macro file and wait for it to finish.
    ///
    /// `Ok(true)` means the macro completed without an in-target error,
    /// `Ok(false)` means the target reported an error (see [`Debugger::last_error`]),
    /// and `Err` means the debugger session itself faulted.
    async fn run_macro(&self, path: &Path, parameters: &Parameters, timeout: Duration) -> anyhow::Result<bool>;

    /// Last in-target error reported by the debugger, if any.
    async fn last_error(&self) -> Option<String>;
}

/// Bus-simulation tool automation.
#[async_trait]
pub trait BusSimulator: Send + Sync {
    /// Open the configuration and start measurement. `Ok(false)` means the
    /// tool refused to start.
    async fn run_configuration(&self, path: &Path) -> anyhow::Result<bool>;

    /// Measurement state as reported by the tool, e.g. "running" or "stopped".
    async fn state(&self) -> String;
}

/// Receives one call per completed item.
pub trait ResultSink: Send + Sync {
    fn log_result(&self, name: &str, status: TestStatus, details: &serde_json::Map<String, serde_json::Value>);
}

/// Hardware handles injected into the dispatcher.
#[derive(Clone)]
pub struct Collaborators {
    pub scripts: Arc<dyn ScriptLoader>,
    pub debugger: Option<Arc<dyn Debugger>>,
    pub bus: Option<Arc<dyn BusSimulator>>,
}

impl Collaborators {
    pub fn new(scripts: Arc<dyn ScriptLoader>) -> Self {
        Self {
            scripts,
            debugger: None,
            bus: None,
        }
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn BusSimulator>) -> Self {
        self.bus = Some(bus);
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new(Arc::new(ProcessLoader::new()))
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("debugger", &self.debugger.is_some())
            .field("bus", &self.bus.is_some())
            .finish()
    }
}
