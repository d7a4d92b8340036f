//! Test plans: an ordered list of items described in TOML.
//!
//! ```toml
//! label = "bench-nightly"
//!
//! [[test]]
//! name = "boot voltage"
//! target = "checks/boot_voltage.py"
//! retry = 2
//! [test.parameters]
//! min_voltage = 11.5
//!
//! [[test]]
//! name = "flash app"
//! target = "macros/flash.cmm"
//! timeout_secs = 60
//! enabled = false
//! ```
//!
//! Relative targets are resolved against the plan file's directory. When
//! `kind` is omitted it is inferred from the target's extension.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::item::{Parameters, TestItem, TestKind};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse plan {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("test #{index} ({name}): {reason}")]
    InvalidEntry { index: usize, name: String, reason: String },

    #[error("plan {0} contains no tests")]
    Empty(PathBuf),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    label: Option<String>,
    #[serde(default, rename = "test")]
    tests: Vec<PlanEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanEntry {
    name: Option<String>,
    kind: Option<TestKind>,
    target: String,
    retry: Option<u32>,
    timeout_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    parameters: Parameters,
}

fn default_enabled() -> bool {
    true
}

/// A plan entry turned into a queueable item.
#[derive(Debug, Clone)]
pub struct PlannedTest {
    pub item: TestItem,
    /// Disabled tests are still enqueued so they show up as skipped.
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct TestPlan {
    pub path: PathBuf,
    pub label: String,
    pub tests: Vec<PlannedTest>,
}

impl TestPlan {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parse plan text as if it had been read from `path`.
    pub fn parse(text: &str, path: &Path) -> Result<Self, PlanError> {
        let file: PlanFile = toml::from_str(text).map_err(|source| PlanError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if file.tests.is_empty() {
            return Err(PlanError::Empty(path.to_path_buf()));
        }

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let tests = file
            .tests
            .into_iter()
            .enumerate()
            .map(|(index, entry)| entry.into_planned(index + 1, base))
            .collect::<Result<Vec<_>, _>>()?;

        let label = file.label.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "run".to_string())
        });

        debug!(plan = %path.display(), tests = tests.len(), "plan loaded");
        Ok(Self {
            path: path.to_path_buf(),
            label,
            tests,
        })
    }

    pub fn enabled_count(&self) -> usize {
        self.tests.iter().filter(|t| t.enabled).count()
    }
}

impl PlanEntry {
    fn into_planned(self, index: usize, base: &Path) -> Result<PlannedTest, PlanError> {
        let name = self.name.unwrap_or_else(|| self.target.clone());
        let invalid = |reason: &str| PlanError::InvalidEntry {
            index,
            name: name.clone(),
            reason: reason.to_string(),
        };

        if self.target.trim().is_empty() {
            return Err(invalid("target is empty"));
        }
        if name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.timeout_secs == Some(0) {
            return Err(invalid("timeout_secs must be greater than zero"));
        }

        let raw = Path::new(&self.target);
        let kind = self.kind.unwrap_or_else(|| TestKind::infer(raw));
        let target = if raw.is_relative() {
            base.join(raw)
        } else {
            raw.to_path_buf()
        };

        let mut item = TestItem::new(name, kind, target.display().to_string()).with_parameters(self.parameters);
        if let Some(retry) = self.retry {
            item = item.with_retry_budget(retry);
        }
        if let Some(secs) = self.timeout_secs {
            item = item.with_timeout(Duration::from_secs(secs));
        }

        Ok(PlannedTest {
            item,
            enabled: self.enabled,
        })
    }
}
