//! Bounded re-attempts of a single item.
//!
//! Attempts stop at the first `Success`. Both `Failed` and `Error` outcomes
//! are retried the same way; once the budget is spent the last attempt's
//! result is returned as-is.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::item::{TestItem, TestResult, TestStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Retries applied to items whose own budget is zero.
    default_retries: u32,
}

impl RetryPolicy {
    pub fn new(default_retries: u32) -> Self {
        Self { default_retries }
    }

    /// Session default: `retry_count` when auto-retry is on, none otherwise.
    pub fn from_settings(auto_retry: bool, retry_count: u32) -> Self {
        Self::new(if auto_retry { retry_count } else { 0 })
    }

    pub fn default_retries(&self) -> u32 {
        self.default_retries
    }

    /// Total attempts for `item`, first attempt included.
    pub fn attempts_for(&self, item: &TestItem) -> u32 {
        let retries = if item.retry_budget > 0 {
            item.retry_budget
        } else {
            self.default_retries
        };
        retries.saturating_add(1)
    }

    /// Run `item` until it succeeds, the budget is spent, or `abort` fires.
    ///
    /// A target that does not resolve yields a single `Error` result without
    /// any dispatch attempt.
    pub async fn run(&self, dispatcher: &Dispatcher, item: Arc<TestItem>, abort: &CancellationToken) -> TestResult {
        if let Err(err) = dispatcher.resolve(&item) {
            warn!(item = %item.name, error = %err, "target did not resolve, not dispatching");
            return TestResult::new(item, TestStatus::Error, err.to_string());
        }

        let max_attempts = self.attempts_for(&item);
        let mut attempt = 1;
        loop {
            let mut result = dispatcher.dispatch(&item, abort).await;
            result.attempts = attempt;

            if abort.is_cancelled() {
                warn!(item = %item.name, attempt, status = %result.status, "item aborted by request");
                result.aborted = true;
                return result;
            }
            if result.is_success() || attempt >= max_attempts {
                if attempt > 1 {
                    info!(item = %item.name, attempts = attempt, status = %result.status, "retries finished");
                }
                return result;
            }

            attempt += 1;
            info!(
                item = %item.name,
                kind = %item.kind,
                attempt,
                max_attempts,
                previous = %result.status,
                "retrying"
            );
        }
    }
}
