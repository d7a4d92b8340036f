//! In-process scripts registered under a target name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{Executable, ScriptFault, ScriptLoader};
use crate::item::Parameters;

/// Adapts a plain closure to [`Executable`].
///
/// The closure runs on the blocking pool, so a check that blocks on I/O
/// still honours the attempt timeout and operator abort. The blocking
/// thread itself is not interrupted; its late result is discarded.
pub struct FnExecutable<F> {
    f: Arc<F>,
}

impl<F> FnExecutable<F>
where
    F: Fn(&Parameters) -> Result<Value, ScriptFault> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl<F> Executable for FnExecutable<F>
where
    F: Fn(&Parameters) -> Result<Value, ScriptFault> + Send + Sync + 'static,
{
    async fn run(&self, parameters: &Parameters) -> Result<Value, ScriptFault> {
        let f = Arc::clone(&self.f);
        let parameters = parameters.clone();
        match tokio::task::spawn_blocking(move || (*f)(&parameters)).await {
            Ok(outcome) => outcome,
            // Re-raise so the dispatcher reports it like any other panic.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(ScriptFault::fault(format!("script task failed: {}", e))),
        }
    }
}

/// Loader backed by a name -> executable table.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<String, Arc<dyn Executable>>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target: impl Into<String>, script: Arc<dyn Executable>) {
        let mut scripts = self.scripts.write().unwrap_or_else(|e| e.into_inner());
        scripts.insert(target.into(), script);
    }

    /// Register a closure as the entry point for `target`.
    pub fn register_fn<F>(&self, target: impl Into<String>, f: F)
    where
        F: Fn(&Parameters) -> Result<Value, ScriptFault> + Send + Sync + 'static,
    {
        self.register(target, Arc::new(FnExecutable::new(f)));
    }

    fn lookup(&self, target: &str) -> Option<Arc<dyn Executable>> {
        let scripts = self.scripts.read().unwrap_or_else(|e| e.into_inner());
        scripts.get(target).cloned()
    }
}

#[async_trait]
impl ScriptLoader for ScriptRegistry {
    fn resolve(&self, target: &str) -> Result<PathBuf, ScriptFault> {
        match self.lookup(target) {
            Some(_) => Ok(PathBuf::from(target)),
            None => Err(ScriptFault::fault(format!("no script registered for '{}'", target))),
        }
    }

    async fn load(&self, path: &Path) -> Result<Arc<dyn Executable>, ScriptFault> {
        let key = path.to_string_lossy();
        self.lookup(&key)
            .ok_or_else(|| ScriptFault::fault(format!("script '{}' has no run() entry point", key)))
    }
}
