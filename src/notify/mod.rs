//! Session result log and observer fan-out.
//!
//! Results are appended in completion order and never mutated afterwards.
//! Registered observers are called synchronously after each append; a
//! failing or panicking observer is logged and otherwise ignored. Async
//! consumers can [`ResultLog::subscribe`] instead and are never waited on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::item::{TestResult, TestStatus};

/// Callback invoked with every recorded result.
pub type Observer = Arc<dyn Fn(&TestResult) -> anyhow::Result<()> + Send + Sync>;

/// Capacity of the broadcast channel handed out by [`ResultLog::subscribe`].
const SUBSCRIBER_BACKLOG: usize = 256;

/// Counts by terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    #[serde(rename = "elapsedSeconds", serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
}

impl Summary {
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

fn as_secs_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

pub struct ResultLog {
    opened: Instant,
    results: Mutex<Vec<Arc<TestResult>>>,
    observers: RwLock<Vec<Observer>>,
    events: broadcast::Sender<Arc<TestResult>>,
}

impl Default for ResultLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultLog {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        Self {
            opened: Instant::now(),
            results: Mutex::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn add_observer(&self, observer: Observer) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Receive every result recorded from now on.
    ///
    /// A receiver that falls more than the backlog behind loses the oldest
    /// results (`RecvError::Lagged`), the log itself is unaffected.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TestResult>> {
        self.events.subscribe()
    }

    /// Append `result` and notify observers.
    pub fn record(&self, result: TestResult) -> Arc<TestResult> {
        let result = Arc::new(result);
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&result));

        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner()).clone();
        for observer in &observers {
            notify_guarded(observer, &result);
        }
        // No subscribers is not an error.
        let _ = self.events.send(Arc::clone(&result));
        result
    }

    /// Snapshot of all recorded results in completion order.
    pub fn results(&self) -> Vec<Arc<TestResult>> {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> Summary {
        let results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        let count = |status: TestStatus| results.iter().filter(|r| r.status == status).count();
        Summary {
            total: results.len(),
            passed: count(TestStatus::Success),
            failed: count(TestStatus::Failed),
            errored: count(TestStatus::Error),
            skipped: count(TestStatus::Skipped),
            elapsed: self.opened.elapsed(),
        }
    }
}

/// Call `observer`, swallowing both errors and panics.
pub fn notify_guarded(observer: &Observer, result: &TestResult) {
    match catch_unwind(AssertUnwindSafe(|| observer(result))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(item = %result.item.name, error = %e, "result observer failed"),
        Err(_) => warn!(item = %result.item.name, "result observer panicked"),
    }
}
