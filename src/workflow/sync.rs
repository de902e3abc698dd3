//! Concurrent start of independent hardware actions.
//!
//! Some pairs of actions (mechanical scan and detector capture) have to begin
//! together. [`synchronize`] spawns one task per action, holds all of them at
//! a shared barrier until every task exists, then releases them at once. Each
//! task may wait a fixed extra delay after release to absorb known device
//! start-up latency. The caller resumes when every task has joined.

use futures::future::{join_all, BoxFuture};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::Instant;

use crate::error::{AppResult, PositionerError};

/// One action for [`synchronize`].
pub type SyncTask = Box<dyn FnOnce() -> BoxFuture<'static, AppResult<()>> + Send>;

/// Box an async closure as a [`SyncTask`].
pub fn sync_task<F, Fut>(f: F) -> SyncTask
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    Box::new(move || -> BoxFuture<'static, AppResult<()>> { Box::pin(f()) })
}

/// Timing and result of one synchronized task.
#[derive(Debug)]
pub struct TaskReport {
    /// When the barrier released the task
    pub released: Instant,
    /// When the action was invoked (after its delay)
    pub started: Instant,
    /// When the action returned
    pub finished: Instant,
    /// Action result
    pub result: AppResult<()>,
}

/// Outcome of a [`synchronize`] call, in task order.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// One report per task
    pub tasks: Vec<TaskReport>,
}

impl SyncReport {
    /// Gap between the earliest and latest action start
    pub fn start_spread(&self) -> Duration {
        let starts = self.tasks.iter().map(|t| t.started);
        match (starts.clone().min(), starts.max()) {
            (Some(first), Some(last)) => last - first,
            _ => Duration::ZERO,
        }
    }

    /// First failure, if any
    pub fn into_result(self) -> AppResult<()> {
        self.tasks
            .into_iter()
            .map(|t| t.result)
            .find(Result::is_err)
            .unwrap_or(Ok(()))
    }
}

/// Start `tasks` together and wait for all of them.
///
/// `delays[i]` is applied to task `i` after release; missing entries mean no
/// delay.
pub async fn synchronize(tasks: Vec<SyncTask>, delays: &[Duration]) -> SyncReport {
    if tasks.is_empty() {
        return SyncReport::default();
    }

    let gate = Arc::new(Barrier::new(tasks.len()));
    let handles: Vec<_> = tasks
        .into_iter()
        .enumerate()
        .map(|(index, task)| {
            let gate = gate.clone();
            let delay = delays.get(index).copied().unwrap_or_default();
            tokio::spawn(async move {
                gate.wait().await;
                let released = Instant::now();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let started = Instant::now();
                let result = task().await;
                TaskReport {
                    released,
                    started,
                    finished: Instant::now(),
                    result,
                }
            })
        })
        .collect();

    let tasks = join_all(handles)
        .await
        .into_iter()
        .enumerate()
        .map(|(index, joined)| {
            joined.unwrap_or_else(|e| {
                let now = Instant::now();
                TaskReport {
                    released: now,
                    started: now,
                    finished: now,
                    result: Err(PositionerError::Device(format!(
                        "synchronized task {} did not complete: {}",
                        index, e
                    ))),
                }
            })
        })
        .collect::<Vec<_>>();

    let report = SyncReport { tasks };
    tracing::debug!(
        tasks = report.tasks.len(),
        spread_us = report.start_spread().as_micros() as u64,
        "Synchronized start complete"
    );
    report
}
