//! Queue & scheduler: a single worker drains a FIFO queue of test items.
//!
//! Items complete strictly in enqueue order. `stop()` is honoured between
//! items only; `abort_current()` cancels the in-flight attempt when its kind
//! supports it and always prevents further retries.

pub mod engine;
pub mod queue;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collab::ResultSink;
use crate::dispatch::Dispatcher;
use crate::item::{TestItem, TestResult};
use crate::notify::{Observer, ResultLog, Summary};
use crate::retry::RetryPolicy;

use self::engine::Shared;
pub use self::queue::{QueueError, TestQueue};

/// Bounded wait of the idle worker before it re-polls the queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SchedulerBuilder {
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    sink: Option<Arc<dyn ResultSink>>,
    log: Option<Arc<ResultLog>>,
    poll_interval: Duration,
}

impl SchedulerBuilder {
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Logging collaborator called once per completed item.
    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn result_log(mut self, log: Arc<ResultLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> Scheduler {
        Scheduler {
            shared: Arc::new(Shared {
                queue: TestQueue::new(),
                log: self.log.unwrap_or_default(),
                dispatcher: self.dispatcher,
                policy: self.policy,
                sink: self.sink,
                poll_interval: self.poll_interval,
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                exit_when_idle: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                current: Mutex::new(None),
                skip_marks: Mutex::new(HashSet::new()),
                on_result: RwLock::new(None),
            }),
            worker: Arc::new(Mutex::new(None)),
        }
    }
}

/// Cloneable handle to the queue and its worker.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn builder(dispatcher: Dispatcher) -> SchedulerBuilder {
        SchedulerBuilder {
            dispatcher,
            policy: RetryPolicy::default(),
            sink: None,
            log: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn new(dispatcher: Dispatcher, policy: RetryPolicy) -> Self {
        Self::builder(dispatcher).retry_policy(policy).build()
    }

    // -----------------------------------------------------------------------
    // Queue management
    // -----------------------------------------------------------------------

    /// Append an item to the tail of the queue.
    pub fn enqueue(&self, item: TestItem) -> Result<Uuid, QueueError> {
        let item = self.shared.queue.push(item)?;
        debug!(item = %item.name, kind = %item.kind, "queued");
        Ok(item.id)
    }

    /// Remove all items not yet dispatched. The in-flight item is unaffected.
    pub fn clear(&self) -> usize {
        let removed = self.shared.queue.clear();
        self.shared.skip_marks().clear();
        info!(removed, "test queue cleared");
        removed
    }

    /// Drop a queued item without recording anything.
    pub fn remove(&self, id: Uuid) -> bool {
        match self.shared.queue.remove(id) {
            Some(item) => {
                info!(item = %item.name, "removed from queue");
                true
            }
            None => false,
        }
    }

    /// Take a queued item out of the run and record it as `Skipped`.
    ///
    /// Returns `false` when the item is no longer pending.
    pub fn skip(&self, id: Uuid) -> bool {
        match self.shared.queue.remove(id) {
            Some(item) => {
                info!(item = %item.name, "skipped");
                self.shared.finish(TestResult::skipped(item));
                true
            }
            None => false,
        }
    }

    /// Leave a queued item in place and record it as `Skipped` when the
    /// worker reaches it, keeping results in enqueue order.
    ///
    /// Returns `false` when the item is no longer pending.
    pub fn skip_when_reached(&self, id: Uuid) -> bool {
        let mut marks = self.shared.skip_marks();
        if self.shared.queue.contains(id) {
            marks.insert(id);
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> Vec<Arc<TestItem>> {
        self.shared.queue.snapshot()
    }

    /// Permanently refuse new items.
    pub fn close(&self) {
        self.shared.queue.close();
        info!("test queue closed");
    }

    // -----------------------------------------------------------------------
    // Execution control
    // -----------------------------------------------------------------------

    /// Start draining the queue on a background task.
    ///
    /// `on_result` is called once per completed item with its final result.
    /// Calling this while the worker is active only logs a warning. A worker
    /// that is winding down after `stop()` is told to keep draining instead.
    pub fn start(&self, on_result: Option<Observer>) {
        let _lifecycle = self.shared.lifecycle();
        if self.shared.running.load(Ordering::SeqCst) {
            if self.shared.stop_requested.swap(false, Ordering::SeqCst) {
                self.shared.exit_when_idle.store(false, Ordering::SeqCst);
                *self.shared.on_result.write().unwrap_or_else(|e| e.into_inner()) = on_result;
                self.shared.queue.wake();
                info!("pending stop withdrawn, worker keeps draining");
            } else {
                warn!("scheduler is already running");
            }
            return;
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.exit_when_idle.store(false, Ordering::SeqCst);
        *self.shared.on_result.write().unwrap_or_else(|e| e.into_inner()) = on_result;

        let handle = tokio::spawn(engine::drain(Arc::clone(&self.shared)));
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!("scheduler started");
    }

    /// Ask the worker to exit after the current item finishes.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.queue.wake();
        info!("scheduler stop requested");
    }

    /// Let the worker exit once the queue is empty.
    pub fn stop_when_idle(&self) {
        self.shared.exit_when_idle.store(true, Ordering::SeqCst);
        self.shared.queue.wake();
    }

    /// Mark the in-flight item as aborted.
    ///
    /// Returns `false` when nothing is running.
    pub fn abort_current(&self) -> bool {
        let current = self.shared.current();
        match current.as_ref() {
            Some(in_flight) => {
                warn!(item = %in_flight.name, id = %in_flight.id, "abort requested");
                in_flight.abort.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for the worker task to exit.
    pub async fn wait(&self) {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler worker terminated abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Name of the item being dispatched right now.
    pub fn current(&self) -> Option<String> {
        self.shared.current().as_ref().map(|c| c.name.clone())
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    pub fn log(&self) -> &Arc<ResultLog> {
        &self.shared.log
    }

    pub fn results(&self) -> Vec<Arc<TestResult>> {
        self.shared.log.results()
    }

    pub fn summary(&self) -> Summary {
        self.shared.log.summary()
    }
}
