use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::collab::ResultSink;
use crate::dispatch::Dispatcher;
use crate::item::{TestItem, TestResult};
use crate::notify::{notify_guarded, Observer, ResultLog};
use crate::retry::RetryPolicy;
use crate::scheduler::queue::TestQueue;

/// The item currently being worked on.
pub(crate) struct InFlight {
    pub id: Uuid,
    pub name: String,
    pub abort: CancellationToken,
}

/// What the worker took off the queue.
pub(crate) enum Next {
    Run(Arc<TestItem>, CancellationToken),
    Skip(Arc<TestItem>),
}

/// State shared between the [`super::Scheduler`] handle and its worker.
pub(crate) struct Shared {
    pub queue: TestQueue,
    pub log: Arc<ResultLog>,
    pub dispatcher: Dispatcher,
    pub policy: RetryPolicy,
    pub sink: Option<Arc<dyn ResultSink>>,
    pub poll_interval: Duration,
    pub running: AtomicBool,
    pub stop_requested: AtomicBool,
    pub exit_when_idle: AtomicBool,
    /// Held while the worker decides to exit and while `start` inspects it.
    pub lifecycle: Mutex<()>,
    pub current: Mutex<Option<InFlight>>,
    /// Queued ids to record as skipped when the worker reaches them.
    pub skip_marks: Mutex<HashSet<Uuid>>,
    pub on_result: RwLock<Option<Observer>>,
}

impl Shared {
    /// Record a final result: session log, logging collaborator, then the
    /// `start` callback.
    pub fn finish(&self, result: TestResult) -> Arc<TestResult> {
        let result = self.log.record(result);
        if let Some(sink) = &self.sink {
            let logged = catch_unwind(AssertUnwindSafe(|| {
                sink.log_result(&result.item.name, result.status, &result.details())
            }));
            if logged.is_err() {
                error!(item = %result.item.name, "logging collaborator panicked");
            }
        }
        let on_result = self.on_result.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(cb) = on_result {
            notify_guarded(&cb, &result);
        }
        result
    }

    pub fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn skip_marks(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.skip_marks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pop the head item and, unless it is marked for skipping, publish it
    /// as in flight in the same critical section as the pop.
    pub fn next_item(&self) -> Option<Next> {
        let mut current = self.current();
        let item = self.queue.pop()?;
        if self.skip_marks().remove(&item.id) {
            return Some(Next::Skip(item));
        }
        let abort = CancellationToken::new();
        *current = Some(InFlight {
            id: item.id,
            name: item.name.clone(),
            abort: abort.clone(),
        });
        Some(Next::Run(item, abort))
    }

    /// Clear `running` if `should_exit` still holds under the lifecycle lock.
    fn release_if(&self, should_exit: impl Fn() -> bool) -> bool {
        let _lifecycle = self.lifecycle();
        if should_exit() {
            self.running.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

/// Clears the running flag if the worker unwinds.
struct PanicGuard<'a>(&'a AtomicBool);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(false, Ordering::SeqCst);
        }
    }
}

/// Main worker loop: drain the queue one item at a time until stopped.
pub(crate) async fn drain(shared: Arc<Shared>) {
    let _guard = PanicGuard(&shared.running);
    info!("scheduler worker started");

    loop {
        if shared.stop_requested.load(Ordering::SeqCst)
            && shared.release_if(|| shared.stop_requested.load(Ordering::SeqCst))
        {
            info!("stop requested, worker exiting");
            break;
        }

        match shared.next_item() {
            Some(Next::Run(item, abort)) => run_item(&shared, item, abort).await,
            Some(Next::Skip(item)) => {
                info!(item = %item.name, "skipped");
                shared.finish(TestResult::skipped(item));
            }
            None => {
                let idle_exit = || shared.exit_when_idle.load(Ordering::SeqCst) && shared.queue.is_empty();
                if idle_exit() && shared.release_if(idle_exit) {
                    info!("queue drained, worker exiting");
                    break;
                }
                shared.queue.wait(shared.poll_interval).await;
            }
        }
    }
}

async fn run_item(shared: &Shared, item: Arc<TestItem>, abort: CancellationToken) {
    info!(item = %item.name, kind = %item.kind, "running");

    let result = shared.policy.run(&shared.dispatcher, item, &abort).await;
    *shared.current() = None;

    if result.status.is_terminal() {
        info!(
            item = %result.item.name,
            status = %result.status,
            duration_s = result.duration_seconds(),
            attempts = result.attempts,
            aborted = result.aborted,
            "item finished"
        );
    } else {
        error!(item = %result.item.name, status = %result.status, "non-terminal status after dispatch");
    }
    shared.finish(result);
}
