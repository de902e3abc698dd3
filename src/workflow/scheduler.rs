//! FIFO workflow scheduler.
//!
//! A workflow is a queue of [`WorkflowItem`]s. Each item is an async action
//! plus an optional [`CompletionTrigger`]: an event the scheduler waits for
//! before starting the next item. Items without a trigger chain straight into
//! the next one.
//!
//! # Lifecycle
//!
//! ```text
//!   advance() ──pop──> arm trigger ──> run action ──┬── trigger? ──> Waiting
//!       ^                                           └── none ──────> next item
//!       └──────────────── wait_for_trigger(): Fired ─┘
//! ```
//!
//! The trigger is armed (its broadcast receiver created) before the action
//! runs, so a completion that arrives while the action is still returning is
//! never missed. A pending trigger is dropped on every `advance()`, so stale
//! subscriptions never accumulate.
//!
//! Every run ends with exactly one terminal [`WorkflowEvent`]: `Finished`,
//! `Aborted`, `Stalled` or `Cancelled`. On the last three, the cleanup
//! actions registered with [`WorkflowScheduler::on_failure`] run before
//! [`WorkflowScheduler::run`] returns.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::error::{AppResult, PositionerError};

const WORKFLOW_EVENT_CAPACITY: usize = 128;

/// Boxed action future.
pub type ActionFuture = BoxFuture<'static, AppResult<()>>;

type ArmedTrigger = BoxFuture<'static, AppResult<()>>;

/// Scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Per-trigger timeout in milliseconds; 0 waits forever
    pub trigger_timeout_ms: u64,
    /// Discard the remaining queue when an action fails
    pub abort_on_error: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            trigger_timeout_ms: 0,
            abort_on_error: true,
        }
    }
}

impl WorkflowSettings {
    /// Timeout as a duration, `None` when disabled
    pub fn trigger_timeout(&self) -> Option<Duration> {
        (self.trigger_timeout_ms > 0).then(|| Duration::from_millis(self.trigger_timeout_ms))
    }
}

/// Event that marks a workflow item as complete.
pub struct CompletionTrigger {
    description: String,
    arm: Box<dyn FnOnce() -> ArmedTrigger + Send>,
}

impl CompletionTrigger {
    /// Trigger on the first event from `subscribe()` matching `predicate`.
    /// `subscribe` is called when the trigger is armed.
    pub fn new<E, S, P>(description: impl Into<String>, subscribe: S, predicate: P) -> Self
    where
        E: Clone + Send + 'static,
        S: FnOnce() -> broadcast::Receiver<E> + Send + 'static,
        P: Fn(&E) -> bool + Send + 'static,
    {
        Self::resolving(description, subscribe, move |event: &E| {
            predicate(event).then_some(Ok(()))
        })
    }

    /// Trigger on the first event for which `resolve` returns `Some`.
    ///
    /// `Some(Err(_))` fails the wait, which aborts the run the same way a
    /// failing action does.
    pub fn resolving<E, S, R>(description: impl Into<String>, subscribe: S, resolve: R) -> Self
    where
        E: Clone + Send + 'static,
        S: FnOnce() -> broadcast::Receiver<E> + Send + 'static,
        R: Fn(&E) -> Option<AppResult<()>> + Send + 'static,
    {
        let description = description.into();
        let label = description.clone();
        Self {
            description,
            arm: Box::new(move || -> ArmedTrigger {
                let mut events = subscribe();
                Box::pin(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) => {
                                if let Some(result) = resolve(&event) {
                                    return result;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(trigger = %label, skipped, "Trigger lagged behind events");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                return Err(PositionerError::Device(format!(
                                    "event source for '{}' closed",
                                    label
                                )))
                            }
                        }
                    }
                })
            }),
        }
    }

    /// Trigger on events published through `sender`.
    pub fn on<E, P>(description: impl Into<String>, sender: &broadcast::Sender<E>, predicate: P) -> Self
    where
        E: Clone + Send + 'static,
        P: Fn(&E) -> bool + Send + 'static,
    {
        let sender = sender.clone();
        Self::new(description, move || sender.subscribe(), predicate)
    }

    /// What the trigger waits for
    pub fn description(&self) -> &str {
        &self.description
    }

    fn arm(self) -> (String, ArmedTrigger) {
        let armed = (self.arm)();
        (self.description, armed)
    }
}

/// One queued step.
pub struct WorkflowItem {
    label: String,
    action: Box<dyn FnOnce() -> ActionFuture + Send>,
    trigger: Option<CompletionTrigger>,
}

impl WorkflowItem {
    /// Item running `action`; arguments are captured by the closure.
    pub fn new<F, Fut>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            action: Box::new(move || -> ActionFuture { Box::pin(action()) }),
            trigger: None,
        }
    }

    /// Wait for `trigger` before the next item starts
    pub fn until(mut self, trigger: CompletionTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Item label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the item waits for a trigger
    pub fn has_trigger(&self) -> bool {
        self.trigger.is_some()
    }
}

impl std::fmt::Debug for WorkflowItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowItem")
            .field("label", &self.label)
            .field(
                "trigger",
                &self.trigger.as_ref().map(CompletionTrigger::description),
            )
            .finish()
    }
}

/// Events published by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    /// An item was popped and its action invoked
    ItemStarted {
        /// Item label
        label: String,
        /// Items still queued
        remaining: usize,
    },
    /// An item's trigger fired
    TriggerFired {
        /// Item label
        label: String,
    },
    /// Queue drained
    Finished,
    /// An action failed; queue discarded
    Aborted {
        /// Item label
        label: String,
        /// Failure description
        reason: String,
    },
    /// A trigger timed out; queue discarded
    Stalled {
        /// Item label
        label: String,
        /// Elapsed wait
        waited_ms: u64,
    },
    /// Cancelled; queue discarded
    Cancelled {
        /// Item label, or the empty string between items
        label: String,
    },
}

impl WorkflowEvent {
    /// Ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::Finished
                | WorkflowEvent::Aborted { .. }
                | WorkflowEvent::Stalled { .. }
                | WorkflowEvent::Cancelled { .. }
        )
    }
}

/// Result of one `advance()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Waiting for the trigger of the named item
    Waiting(String),
    /// Queue drained
    Finished,
}

/// How a trigger wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Trigger fired (or nothing was pending)
    Fired,
    /// Timeout elapsed
    TimedOut {
        /// Elapsed wait
        waited_ms: u64,
    },
    /// Cancelled through the [`CancelHandle`]
    Cancelled,
}

/// Cloneable handle that cancels a running workflow.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

struct PendingTrigger {
    label: String,
    description: String,
    armed: ArmedTrigger,
}

/// FIFO queue of workflow items.
pub struct WorkflowScheduler {
    queue: VecDeque<WorkflowItem>,
    cleanup: Vec<WorkflowItem>,
    pending: Option<PendingTrigger>,
    terminated: bool,
    settings: WorkflowSettings,
    events: broadcast::Sender<WorkflowEvent>,
    cancel: CancelHandle,
}

impl Default for WorkflowScheduler {
    fn default() -> Self {
        Self::new(WorkflowSettings::default())
    }
}

impl WorkflowScheduler {
    /// Empty scheduler
    pub fn new(settings: WorkflowSettings) -> Self {
        let (events, _) = broadcast::channel(WORKFLOW_EVENT_CAPACITY);
        Self {
            queue: VecDeque::new(),
            cleanup: Vec::new(),
            pending: None,
            terminated: false,
            settings,
            events,
            cancel: CancelHandle::new(),
        }
    }

    /// Append an item
    pub fn enqueue(&mut self, item: WorkflowItem) {
        self.queue.push_back(item);
        self.terminated = false;
    }

    /// Append several items in order
    pub fn extend(&mut self, items: impl IntoIterator<Item = WorkflowItem>) {
        for item in items {
            self.enqueue(item);
        }
    }

    /// Register an action that runs whenever a run ends without `Finished`
    /// (abort, stall or cancel). Cleanup triggers are ignored and failures
    /// are only logged; every cleanup action runs once per failed run.
    pub fn on_failure(&mut self, item: WorkflowItem) {
        self.cleanup.push(item);
    }

    /// Items still queued
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// A trigger is armed and not yet awaited
    pub fn is_waiting(&self) -> bool {
        self.pending.is_some()
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Handle for cancelling from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn publish(&self, event: WorkflowEvent) {
        let _ = self.events.send(event);
    }

    fn terminate(&mut self, event: WorkflowEvent) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.pending = None;
        if !self.terminated {
            self.terminated = true;
            tracing::info!(?event, dropped, "Workflow terminated");
            self.publish(event);
        }
    }

    /// Start the next item(s).
    ///
    /// Drops any armed trigger, then pops items until one with a trigger has
    /// been invoked (returns [`Step::Waiting`]) or the queue is empty
    /// (returns [`Step::Finished`], publishing `Finished` once per run).
    ///
    /// # Errors
    /// `WorkflowAborted` when an action fails and `abort_on_error` is set.
    pub async fn advance(&mut self) -> AppResult<Step> {
        if let Some(stale) = self.pending.take() {
            tracing::debug!(item = %stale.label, "Detached pending trigger");
        }

        loop {
            let Some(item) = self.queue.pop_front() else {
                self.terminate(WorkflowEvent::Finished);
                return Ok(Step::Finished);
            };
            let WorkflowItem {
                label,
                action,
                trigger,
            } = item;

            tracing::info!(item = %label, remaining = self.queue.len(), "Workflow item started");
            self.publish(WorkflowEvent::ItemStarted {
                label: label.clone(),
                remaining: self.queue.len(),
            });

            let armed = trigger.map(CompletionTrigger::arm);

            if let Err(error) = action().await {
                if self.settings.abort_on_error {
                    tracing::error!(item = %label, %error, "Workflow action failed, aborting");
                    self.terminate(WorkflowEvent::Aborted {
                        label: label.clone(),
                        reason: error.to_string(),
                    });
                    return Err(PositionerError::WorkflowAborted {
                        item: label,
                        reason: error.to_string(),
                    });
                }
                tracing::warn!(item = %label, %error, "Workflow action failed, continuing");
                continue;
            }

            match armed {
                Some((description, armed)) => {
                    tracing::debug!(item = %label, trigger = %description, "Waiting for trigger");
                    self.pending = Some(PendingTrigger {
                        label: label.clone(),
                        description,
                        armed,
                    });
                    return Ok(Step::Waiting(label));
                }
                None => continue,
            }
        }
    }

    /// Wait for the armed trigger, the timeout or cancellation.
    ///
    /// Timeout and cancellation discard the queue and publish `Stalled` or
    /// `Cancelled`.
    ///
    /// # Errors
    /// `WorkflowAborted` when the trigger resolves to an error or its event
    /// source closes.
    pub async fn wait_for_trigger(&mut self) -> AppResult<TriggerOutcome> {
        let Some(pending) = self.pending.take() else {
            return Ok(TriggerOutcome::Fired);
        };
        let PendingTrigger {
            label,
            description,
            armed,
        } = pending;

        let started = Instant::now();
        let timeout = self.settings.trigger_timeout();
        let cancel = self.cancel.clone();

        let outcome = tokio::select! {
            result = armed => match result {
                Ok(()) => TriggerOutcome::Fired,
                Err(error) => {
                    self.terminate(WorkflowEvent::Aborted {
                        label: label.clone(),
                        reason: error.to_string(),
                    });
                    return Err(PositionerError::WorkflowAborted {
                        item: label,
                        reason: error.to_string(),
                    });
                }
            },
            _ = cancel.cancelled() => TriggerOutcome::Cancelled,
            _ = sleep_or_forever(timeout) => TriggerOutcome::TimedOut {
                waited_ms: started.elapsed().as_millis() as u64,
            },
        };

        match outcome {
            TriggerOutcome::Fired => {
                tracing::debug!(item = %label, trigger = %description, "Trigger fired");
                self.publish(WorkflowEvent::TriggerFired { label });
            }
            TriggerOutcome::TimedOut { waited_ms } => {
                tracing::warn!(item = %label, trigger = %description, waited_ms, "Trigger timed out");
                self.terminate(WorkflowEvent::Stalled { label, waited_ms });
            }
            TriggerOutcome::Cancelled => {
                self.terminate(WorkflowEvent::Cancelled { label });
            }
        }
        Ok(outcome)
    }

    /// Run until the queue drains.
    ///
    /// Cleanup actions registered with [`on_failure`](Self::on_failure) run
    /// before an error is returned.
    ///
    /// # Errors
    /// `WorkflowAborted`, `WorkflowStall` or `WorkflowCancelled`.
    pub async fn run(&mut self) -> AppResult<()> {
        let result = self.drain_queue().await;
        if result.is_err() {
            self.run_cleanup().await;
        } else {
            self.cleanup.clear();
        }
        result
    }

    async fn run_cleanup(&mut self) {
        for item in std::mem::take(&mut self.cleanup) {
            let WorkflowItem { label, action, .. } = item;
            match action().await {
                Ok(()) => tracing::info!(item = %label, "Cleanup done"),
                Err(error) => tracing::error!(item = %label, %error, "Cleanup failed"),
            }
        }
    }

    async fn drain_queue(&mut self) -> AppResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                self.terminate(WorkflowEvent::Cancelled {
                    label: String::new(),
                });
                return Err(PositionerError::WorkflowCancelled(String::new()));
            }
            let label = match self.advance().await? {
                Step::Finished => return Ok(()),
                Step::Waiting(label) => label,
            };
            match self.wait_for_trigger().await? {
                TriggerOutcome::Fired => {}
                TriggerOutcome::TimedOut { waited_ms } => {
                    return Err(PositionerError::WorkflowStall {
                        item: label,
                        waited_ms,
                    })
                }
                TriggerOutcome::Cancelled => return Err(PositionerError::WorkflowCancelled(label)),
            }
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn logging_item(log: &Log, label: &'static str) -> WorkflowItem {
        let log = log.clone();
        WorkflowItem::new(label, move || async move {
            log.lock().push(label);
            Ok(())
        })
    }

    fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn untriggered_item_chains_into_the_next() {
        let (signals, _) = broadcast::channel::<&'static str>(8);
        let log: Log = Arc::default();
        let mut scheduler = WorkflowScheduler::default();
        let mut events = scheduler.subscribe();

        scheduler.extend([
            logging_item(&log, "A").until(CompletionTrigger::on("evtA", &signals, |e| *e == "evtA")),
            logging_item(&log, "B"),
            logging_item(&log, "C").until(CompletionTrigger::on("evtC", &signals, |e| *e == "evtC")),
        ]);

        assert_eq!(scheduler.advance().await.unwrap(), Step::Waiting("A".into()));
        assert_eq!(*log.lock(), vec!["A"]);

        signals.send("evtA").unwrap();
        assert_eq!(scheduler.wait_for_trigger().await.unwrap(), TriggerOutcome::Fired);
        assert_eq!(scheduler.advance().await.unwrap(), Step::Waiting("C".into()));
        assert_eq!(*log.lock(), vec!["A", "B", "C"]);

        signals.send("evtC").unwrap();
        assert_eq!(scheduler.wait_for_trigger().await.unwrap(), TriggerOutcome::Fired);
        assert_eq!(scheduler.advance().await.unwrap(), Step::Finished);
        assert_eq!(scheduler.advance().await.unwrap(), Step::Finished);

        let finished = drain(&mut events)
            .into_iter()
            .filter(|e| *e == WorkflowEvent::Finished)
            .count();
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn completion_during_action_is_not_missed() {
        let (signals, _) = broadcast::channel::<u32>(8);
        let tx = signals.clone();
        let mut scheduler = WorkflowScheduler::default();
        scheduler.enqueue(
            WorkflowItem::new("fast", move || async move {
                // completes before the action even returns
                let _ = tx.send(7);
                Ok(())
            })
            .until(CompletionTrigger::on("done", &signals, |v| *v == 7)),
        );

        tokio::time::timeout(Duration::from_secs(1), scheduler.run())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn failing_action_aborts_queue() {
        let log: Log = Arc::default();
        let mut scheduler = WorkflowScheduler::default();
        let mut events = scheduler.subscribe();
        scheduler.extend([
            logging_item(&log, "first"),
            WorkflowItem::new("broken", || async {
                Err(PositionerError::Device("shutter jammed".into()))
            }),
            logging_item(&log, "never"),
        ]);

        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(err, PositionerError::WorkflowAborted { ref item, .. } if item == "broken"));
        assert_eq!(*log.lock(), vec!["first"]);
        assert!(scheduler.is_empty());
        let terminal: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(WorkflowEvent::is_terminal)
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], WorkflowEvent::Aborted { .. }));
    }

    #[tokio::test]
    async fn failing_action_can_be_skipped() {
        let log: Log = Arc::default();
        let mut scheduler = WorkflowScheduler::new(WorkflowSettings {
            abort_on_error: false,
            ..Default::default()
        });
        scheduler.extend([
            WorkflowItem::new("broken", || async {
                Err(PositionerError::Device("glitch".into()))
            }),
            logging_item(&log, "after"),
        ]);
        scheduler.run().await.unwrap();
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[tokio::test]
    async fn silent_trigger_times_out_when_configured() {
        let (signals, _) = broadcast::channel::<()>(4);
        let log: Log = Arc::default();
        let mut scheduler = WorkflowScheduler::new(WorkflowSettings {
            trigger_timeout_ms: 50,
            abort_on_error: true,
        });
        scheduler.extend([
            logging_item(&log, "stuck").until(CompletionTrigger::on("never", &signals, |_| true)),
            logging_item(&log, "next"),
        ]);

        let err = scheduler.run().await.unwrap_err();
        match err {
            PositionerError::WorkflowStall { item, waited_ms } => {
                assert_eq!(item, "stuck");
                assert!(waited_ms >= 50);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(*log.lock(), vec!["stuck"]);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn cancel_releases_a_waiting_workflow() {
        let (signals, _) = broadcast::channel::<()>(4);
        let mut scheduler = WorkflowScheduler::default();
        scheduler.enqueue(
            WorkflowItem::new("wait", || async { Ok(()) })
                .until(CompletionTrigger::on("never", &signals, |_| true)),
        );
        let cancel = scheduler.cancel_handle();
        let mut events = scheduler.subscribe();

        let run = tokio::spawn(async move { scheduler.run().await });
        while !matches!(events.recv().await.unwrap(), WorkflowEvent::ItemStarted { .. }) {}
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, PositionerError::WorkflowCancelled(ref item) if item == "wait"));
    }

    #[tokio::test]
    async fn n_items_run_once_in_fifo_order() {
        let (signals, _) = broadcast::channel::<usize>(64);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = WorkflowScheduler::default();
        let mut events = scheduler.subscribe();

        for i in 0..10usize {
            let order = order.clone();
            let tx = signals.clone();
            let item = WorkflowItem::new(format!("item{i}"), move || async move {
                order.lock().push(i);
                if i % 2 == 0 {
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        let _ = tx.send(i);
                    });
                }
                Ok(())
            });
            let item = if i % 2 == 0 {
                item.until(CompletionTrigger::on(format!("sig{i}"), &signals, move |v| *v == i))
            } else {
                item
            };
            scheduler.enqueue(item);
        }

        scheduler.run().await.unwrap();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
        let finished = drain(&mut events)
            .into_iter()
            .filter(|e| *e == WorkflowEvent::Finished)
            .count();
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn failed_completion_aborts_and_runs_cleanup() {
        let (signals, _) = broadcast::channel::<Result<u32, String>>(8);
        let tx = signals.clone();
        let log: Log = Arc::default();
        let mut scheduler = WorkflowScheduler::default();
        let mut events = scheduler.subscribe();
        scheduler.extend([
            WorkflowItem::new("position", move || async move {
                let _ = tx.send(Err("following error".to_string()));
                Ok(())
            })
            .until(CompletionTrigger::resolving(
                "position settled",
                {
                    let signals = signals.clone();
                    move || signals.subscribe()
                },
                |event: &Result<u32, String>| {
                    Some(event.clone().map(|_| ()).map_err(PositionerError::Device))
                },
            )),
            logging_item(&log, "open shutter"),
        ]);
        scheduler.on_failure(logging_item(&log, "close shutter"));

        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(
            err,
            PositionerError::WorkflowAborted { ref item, ref reason }
                if item == "position" && reason.contains("following error")
        ));
        assert_eq!(*log.lock(), vec!["close shutter"]);
        let terminal: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(WorkflowEvent::is_terminal)
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], WorkflowEvent::Aborted { .. }));
    }

    #[tokio::test]
    async fn cleanup_runs_on_cancel_and_stall_only() {
        let (signals, _) = broadcast::channel::<()>(4);
        let log: Log = Arc::default();

        let mut cancelled = WorkflowScheduler::default();
        cancelled.enqueue(logging_item(&log, "never"));
        cancelled.on_failure(logging_item(&log, "cleanup after cancel"));
        cancelled.cancel_handle().cancel();
        assert!(cancelled.run().await.is_err());

        let mut stalled = WorkflowScheduler::new(WorkflowSettings {
            trigger_timeout_ms: 20,
            abort_on_error: true,
        });
        stalled.enqueue(
            logging_item(&log, "stuck").until(CompletionTrigger::on("never", &signals, |_| true)),
        );
        stalled.on_failure(logging_item(&log, "cleanup after stall"));
        assert!(stalled.run().await.is_err());

        let mut finished = WorkflowScheduler::default();
        finished.enqueue(logging_item(&log, "done"));
        finished.on_failure(logging_item(&log, "unused cleanup"));
        finished.run().await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["cleanup after cancel", "stuck", "cleanup after stall", "done"]
        );
    }

    #[test]
    fn zero_timeout_means_wait_forever() {
        assert_eq!(WorkflowSettings::default().trigger_timeout(), None);
        let settings = WorkflowSettings {
            trigger_timeout_ms: 250,
            abort_on_error: true,
        };
        assert_eq!(settings.trigger_timeout(), Some(Duration::from_millis(250)));
    }
}
