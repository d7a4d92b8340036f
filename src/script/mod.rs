//! Late-bound test scripts.
//!
//! A script is anything that can be loaded from a target and adapted to the
//! [`Executable`] capability: it receives the item's parameters and returns
//! a value. How the returned value maps onto a test status is decided by the
//! dispatcher, not by the script adapter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::item::Parameters;

pub mod process;
pub mod registry;

pub use process::ProcessLoader;
pub use registry::{FnExecutable, ScriptRegistry};

/// Fault raised while loading or running a script.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptFault {
    /// The script's own success criterion was not met.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Anything else: missing file, load failure, crash.
    #[error("{0}")]
    Fault(String),
}

impl ScriptFault {
    pub fn validation(msg: impl Into<String>) -> Self {
        ScriptFault::Validation(msg.into())
    }

    pub fn fault(msg: impl Into<String>) -> Self {
        ScriptFault::Fault(msg.into())
    }
}

/// A loaded script exposing a single entry point.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn run(&self, parameters: &Parameters) -> Result<Value, ScriptFault>;
}

/// Turns a target into an [`Executable`].
#[async_trait]
pub trait ScriptLoader: Send + Sync {
    /// Check that `target` names an existing script before any attempt is made.
    fn resolve(&self, target: &str) -> Result<PathBuf, ScriptFault> {
        let path = PathBuf::from(target);
        if path.is_file() {
            Ok(path)
        } else {
            Err(ScriptFault::fault(format!("file not found: {}", target)))
        }
    }

    async fn load(&self, path: &Path) -> Result<Arc<dyn Executable>, ScriptFault>;
}

/// Truthiness of a returned value: null, false, zero and empty values are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
