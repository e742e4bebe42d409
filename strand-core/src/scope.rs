//! Structured-concurrency boundary.
//!
//! A [`CancellableScope`] owns every task it launches. Cancelling the scope
//! (or dropping its last owner) cancels all of them, and child scopes with
//! them. Cancellation is cooperative: a task observes it at its next
//! suspension point, and a result that arrives after cancellation is
//! discarded rather than delivered.
//!
//! Failures travel the other way. A task launched without isolation that
//! returns an error (or panics) becomes the scope's terminal failure, cancels
//! its siblings, and is forwarded to the parent scope unless the scope was
//! created as an isolated child.

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{
    sync::{oneshot, watch},
    time::Instant,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::dispatch::{ContextName, DispatcherProvider};

/// Per-scope task identifier, assigned in launch order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Raw sequence number, starting at 1.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a single task. Every terminal state is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Launched and not yet finished.
    Running,
    /// Returned a value.
    Completed,
    /// Stopped by cancellation, or finished after it.
    Cancelled,
    /// Returned an error or panicked.
    Failed,
}

impl TaskState {
    /// Anything but `Running`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// Observable lifecycle of a scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeState {
    /// Accepting and running work.
    Active,
    /// Cancellation was requested but some tasks have not stopped yet.
    Cancelling,
    /// Cancelled and every task has stopped.
    Cancelled,
    /// Closed normally after its work finished.
    Completed,
}

/// Why a scope was cancelled. Only the first reason is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// An explicit `cancel()` from the owner, e.g. screen teardown.
    Requested,
    /// A newer run for the same operation key replaced this one.
    Superseded,
    /// The scope's deadline expired.
    TimedOut,
    /// A non-isolated task failed.
    SiblingFailed,
    /// The enclosing scope was cancelled or closed.
    ParentCancelled,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CancelReason::Requested => "requested",
            CancelReason::Superseded => "superseded",
            CancelReason::TimedOut => "timed out",
            CancelReason::SiblingFailed => "sibling task failed",
            CancelReason::ParentCancelled => "parent scope cancelled",
        };
        f.write_str(label)
    }
}

/// First unrecovered failure recorded by a scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeFailure {
    /// Label of the scope the task ran in.
    pub scope: String,
    /// The task that failed.
    pub task: TaskId,
    /// Error or panic message.
    pub message: String,
}

impl fmt::Display for ScopeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in scope '{}' failed: {}",
            self.task, self.scope, self.message
        )
    }
}

/// How a scope ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScopeExit {
    /// Closed normally.
    Completed,
    /// Cancelled for the given reason.
    Cancelled(CancelReason),
    /// Ended by its first failure.
    Failed(ScopeFailure),
}

/// Result of joining a task.
#[derive(Debug, PartialEq)]
pub enum Outcome<T, E> {
    /// The task returned `Ok`.
    Completed(T),
    /// Cancelled before finishing, or finished after cancellation and had
    /// its result discarded.
    Cancelled,
    /// The task returned `Err`.
    Failed(E),
    /// The task panicked; carries the panic message.
    Panicked(String),
}

impl<T, E> Outcome<T, E> {
    /// Terminal task state matching this outcome.
    pub fn task_state(&self) -> TaskState {
        match self {
            Outcome::Completed(_) => TaskState::Completed,
            Outcome::Cancelled => TaskState::Cancelled,
            Outcome::Failed(_) | Outcome::Panicked(_) => TaskState::Failed,
        }
    }

    /// The value of a `Completed` outcome.
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled
            | Outcome::Failed(_)
            | Outcome::Panicked(_) => None,
        }
    }

    /// True for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

/// Per-launch overrides.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Context to run on; the scope's default when `None`.
    pub context: Option<ContextName>,
    /// Keep a failure local to this task's `join` instead of failing the
    /// whole scope.
    pub isolated: bool,
}

impl TaskOptions {
    /// Isolated launch on the scope's default context.
    pub fn isolated() -> Self {
        Self {
            context: None,
            isolated: true,
        }
    }

    /// Run on `context` instead of the scope's default.
    pub fn on(mut self, context: ContextName) -> Self {
        self.context = Some(context);
        self
    }
}

/// Handle to one launched task. Owned by whoever launched it and consumed by
/// [`CancellableScope::join`]; it cannot be cloned or reused.
pub struct TaskHandle<T, E> {
    id: TaskId,
    state: watch::Receiver<TaskState>,
    result: oneshot::Receiver<Outcome<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    /// Id of the task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Whether the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

struct TaskEntry {
    id: TaskId,
    state: Arc<watch::Sender<TaskState>>,
}

#[derive(Default)]
struct ScopeShared {
    reason: Option<CancelReason>,
    failure: Option<ScopeFailure>,
    deadline: Option<Instant>,
    tasks: Vec<TaskEntry>,
}

struct ScopeInner {
    label: String,
    token: CancellationToken,
    dispatchers: DispatcherProvider,
    default_context: ContextName,
    parent: Option<Weak<ScopeInner>>,
    propagate_failure: bool,
    completed: AtomicBool,
    next_task: AtomicU64,
    running: watch::Sender<usize>,
    shared: Mutex<ScopeShared>,
    _cancel_on_drop: DropGuard,
}

impl ScopeInner {
    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() && !self.completed.load(Ordering::SeqCst)
    }

    fn cancel_with(&self, reason: CancelReason) {
        {
            let mut shared = self.shared.lock();
            if self.completed.load(Ordering::SeqCst) {
                return;
            }
            if shared.reason.is_none() {
                // Cancellation inherited from the parent wins over whatever
                // arrives later.
                shared.reason = Some(if self.token.is_cancelled() {
                    CancelReason::ParentCancelled
                } else {
                    reason
                });
            }
            for task in &shared.tasks {
                mark_cancelled(&task.state);
            }
        }

        if !self.token.is_cancelled() {
            debug!(
                target: "strand::scope",
                scope = %self.label,
                %reason,
                "cancelling scope"
            );
        }
        self.token.cancel();
    }

    fn fail(&self, failure: ScopeFailure) {
        {
            let mut shared = self.shared.lock();
            if shared.failure.is_some() || self.completed.load(Ordering::SeqCst)
            {
                return;
            }
            shared.failure = Some(failure.clone());
        }

        warn!(
            target: "strand::scope",
            scope = %self.label,
            task = %failure.task,
            error = %failure.message,
            "task failed; cancelling siblings"
        );
        self.cancel_with(CancelReason::SiblingFailed);

        if self.propagate_failure
            && let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade)
        {
            parent.fail(failure);
        }
    }

    fn task_finished(&self) {
        self.running.send_modify(|running| {
            *running = running.saturating_sub(1);
        });
    }
}

fn mark_cancelled(state: &watch::Sender<TaskState>) -> bool {
    state.send_if_modified(|current| {
        if *current == TaskState::Running {
            *current = TaskState::Cancelled;
            true
        } else {
            false
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Owner of a set of cooperatively cancellable tasks.
///
/// Cloning yields another owner of the same scope. When the last owner is
/// dropped the scope is cancelled.
#[derive(Clone)]
pub struct CancellableScope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for CancellableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .inner
            .shared
            .try_lock()
            .map(|shared| shared.tasks.len())
            .unwrap_or_default();

        f.debug_struct("CancellableScope")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .field("default_context", &self.inner.default_context)
            .field("task_count", &task_count)
            .field("running", &*self.inner.running.borrow())
            .finish()
    }
}

impl CancellableScope {
    /// Root scope launching onto the I/O context by default.
    pub fn new(
        label: impl Into<String>,
        dispatchers: DispatcherProvider,
    ) -> Self {
        Self::builder(dispatchers).label(label).build()
    }

    /// Start configuring a root scope.
    pub fn builder(dispatchers: DispatcherProvider) -> ScopeBuilder {
        ScopeBuilder::new(dispatchers)
    }

    fn from_parts(
        label: String,
        token: CancellationToken,
        dispatchers: DispatcherProvider,
        default_context: ContextName,
        parent: Option<Weak<ScopeInner>>,
        propagate_failure: bool,
    ) -> Self {
        let (running, _) = watch::channel(0usize);
        let inner = ScopeInner {
            _cancel_on_drop: token.clone().drop_guard(),
            label,
            token,
            dispatchers,
            default_context,
            parent,
            propagate_failure,
            completed: AtomicBool::new(false),
            next_task: AtomicU64::new(1),
            running,
            shared: Mutex::new(ScopeShared::default()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Label used in logs and failures.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Contexts this scope launches onto.
    pub fn dispatchers(&self) -> &DispatcherProvider {
        &self.inner.dispatchers
    }

    /// Launch `work` on the scope's default context. An error or panic fails
    /// the whole scope.
    pub fn launch<T, E, F, Fut>(&self, work: F) -> TaskHandle<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.launch_with(TaskOptions::default(), work)
    }

    /// Launch `work` whose failure is reported only to its own `join`.
    pub fn launch_isolated<T, E, F, Fut>(&self, work: F) -> TaskHandle<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.launch_with(TaskOptions::isolated(), work)
    }

    /// Launch with explicit options. Returns immediately.
    ///
    /// `work` receives a token that fires when the task is cancelled, for
    /// work that wants to check between non-async steps. Dropping the future
    /// at its next suspension point is the primary cancellation mechanism.
    pub fn launch_with<T, E, F, Fut>(
        &self,
        options: TaskOptions,
        work: F,
    ) -> TaskHandle<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let id = TaskId(self.inner.next_task.fetch_add(1, Ordering::Relaxed));
        let (state_tx, state_rx) = watch::channel(TaskState::Running);
        let state_tx = Arc::new(state_tx);
        let (result_tx, result_rx) = oneshot::channel();
        let handle = TaskHandle {
            id,
            state: state_rx,
            result: result_rx,
        };

        {
            let mut shared = self.inner.shared.lock();
            if self.inner.token.is_cancelled() {
                // A cancelled or closed scope starts nothing new.
                mark_cancelled(&state_tx);
                let _ = result_tx.send(Outcome::Cancelled);
                debug!(
                    target: "strand::scope",
                    scope = %self.inner.label,
                    task = %id,
                    "launch refused; scope no longer active"
                );
                return handle;
            }
            shared.tasks.push(TaskEntry {
                id,
                state: Arc::clone(&state_tx),
            });
            self.inner.running.send_modify(|running| *running += 1);
        }

        let task_token = self.inner.token.child_token();
        let future = work(task_token.clone());
        let context = self
            .inner
            .dispatchers
            .context(options.context.unwrap_or(self.inner.default_context))
            .clone();
        let scope = Arc::downgrade(&self.inner);
        let scope_label = self.inner.label.clone();
        let isolated = options.isolated;

        debug!(
            target: "strand::scope",
            scope = %scope_label,
            task = %id,
            context = %context.name(),
            isolated,
            "launching task"
        );

        let runtime = context.handle().clone();
        runtime.spawn(async move {
            let guarded = AssertUnwindSafe(context.run(future)).catch_unwind();
            let raw = tokio::select! {
                biased;
                _ = task_token.cancelled() => None,
                result = guarded => Some(result),
            };

            let outcome = match raw {
                None => Outcome::Cancelled,
                Some(Ok(Ok(value))) => Outcome::Completed(value),
                Some(Ok(Err(error))) => Outcome::Failed(error),
                Some(Err(payload)) => Outcome::Panicked(panic_message(payload)),
            };

            let terminal = outcome.task_state();
            let applied = state_tx.send_if_modified(|current| {
                if *current == TaskState::Running {
                    *current = terminal;
                    true
                } else {
                    false
                }
            });
            // Finished after cancellation: the result is discarded.
            let outcome = if applied { outcome } else { Outcome::Cancelled };

            let failure = match (&outcome, isolated) {
                (Outcome::Failed(error), false) => Some(error.to_string()),
                (Outcome::Panicked(message), false) => Some(message.clone()),
                _ => None,
            };

            // Deliver before failing the scope so the failing task's own
            // join observes `Failed`, not the cancellation it triggers.
            let _ = result_tx.send(outcome);

            if let Some(inner) = scope.upgrade() {
                if let Some(message) = failure {
                    inner.fail(ScopeFailure {
                        scope: scope_label,
                        task: id,
                        message,
                    });
                }
                inner.task_finished();
            }
        });

        handle
    }

    /// Wait for `handle` to reach a terminal state.
    ///
    /// Returns [`Outcome::Cancelled`] as soon as the scope is cancelled, so a
    /// deadline on the scope bounds this wait even if the task is slow to
    /// notice.
    pub async fn join<T, E>(&self, handle: TaskHandle<T, E>) -> Outcome<T, E> {
        let TaskHandle { mut result, .. } = handle;
        tokio::select! {
            biased;
            outcome = &mut result => {
                return outcome.unwrap_or(Outcome::Cancelled);
            }
            _ = self.inner.token.cancelled() => {}
        }
        // The task may have delivered in the same instant.
        result.try_recv().unwrap_or(Outcome::Cancelled)
    }

    /// Cancel with [`CancelReason::Requested`].
    pub fn cancel(&self) {
        self.inner.cancel_with(CancelReason::Requested);
    }

    /// Cancel with an explicit reason. Idempotent; the first reason sticks.
    pub fn cancel_with(&self, reason: CancelReason) {
        self.inner.cancel_with(reason);
    }

    /// True once cancelled, directly or through a parent. A completed scope is
    /// not cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves once the scope is cancelled or closed.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// A token that fires with this scope. Cancelling it does not cancel the
    /// scope.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// First reason the scope was cancelled with.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        let shared = self.inner.shared.lock();
        Some(shared.reason.unwrap_or(CancelReason::ParentCancelled))
    }

    /// First failure of a non-isolated task.
    pub fn failure(&self) -> Option<ScopeFailure> {
        self.inner.shared.lock().failure.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScopeState {
        if self.inner.completed.load(Ordering::SeqCst) {
            ScopeState::Completed
        } else if self.inner.token.is_cancelled() {
            if *self.inner.running.borrow() == 0 {
                ScopeState::Cancelled
            } else {
                ScopeState::Cancelling
            }
        } else {
            ScopeState::Active
        }
    }

    /// Snapshot of every task this scope launched, in launch order.
    pub fn task_states(&self) -> Vec<(TaskId, TaskState)> {
        let shared = self.inner.shared.lock();
        shared
            .tasks
            .iter()
            .map(|task| (task.id, *task.state.borrow()))
            .collect()
    }

    /// Tasks launched and not yet stopped.
    pub fn running_tasks(&self) -> usize {
        *self.inner.running.borrow()
    }

    /// Instant at which the scope times out, if a deadline is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.shared.lock().deadline
    }

    /// Cancel the scope with [`CancelReason::TimedOut`] once `timeout`
    /// elapses, unless it ends first. An earlier deadline is kept. A timeout
    /// too large to represent as an instant sets no deadline.
    pub fn with_deadline(&self, timeout: Duration) {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            debug!(
                target: "strand::scope",
                scope = %self.inner.label,
                "deadline out of range; scope runs without one"
            );
            return;
        };
        {
            let mut shared = self.inner.shared.lock();
            match shared.deadline {
                Some(existing) if existing <= deadline => return,
                _ => shared.deadline = Some(deadline),
            }
        }

        let token = self.inner.token.clone();
        let scope = Arc::downgrade(&self.inner);
        self.inner.dispatchers.coordination().handle().spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(inner) = scope.upgrade() {
                        debug!(
                            target: "strand::scope",
                            scope = %inner.label,
                            timeout_ms = timeout.as_millis() as u64,
                            "deadline expired"
                        );
                        inner.cancel_with(CancelReason::TimedOut);
                    }
                }
            }
        });
    }

    /// Nested scope whose failure propagates to this one.
    pub fn child(&self, label: impl Into<String>) -> CancellableScope {
        self.spawn_child(label.into(), true)
    }

    /// Nested scope whose failure stays contained.
    pub fn child_isolated(&self, label: impl Into<String>) -> CancellableScope {
        self.spawn_child(label.into(), false)
    }

    fn spawn_child(&self, label: String, propagate_failure: bool) -> Self {
        Self::from_parts(
            label,
            self.inner.token.child_token(),
            self.inner.dispatchers.clone(),
            self.inner.default_context,
            Some(Arc::downgrade(&self.inner)),
            propagate_failure,
        )
    }

    /// Close a scope whose work is done. Stragglers are cancelled and their
    /// results discarded. No-op on a cancelled scope.
    pub fn complete(&self) {
        {
            let shared = self.inner.shared.lock();
            if self.inner.token.is_cancelled() {
                return;
            }
            self.inner.completed.store(true, Ordering::SeqCst);
            for task in &shared.tasks {
                mark_cancelled(&task.state);
            }
        }
        debug!(
            target: "strand::scope",
            scope = %self.inner.label,
            "scope completed"
        );
        self.inner.token.cancel();
    }

    /// Wait until every launched task has stopped, close the scope if it is
    /// still active, and report how it ended.
    pub async fn finish(&self) -> ScopeExit {
        let mut running = self.inner.running.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = running.wait_for(|count| *count == 0).await;

        if !self.inner.token.is_cancelled() {
            self.complete();
        }
        self.exit()
    }

    fn exit(&self) -> ScopeExit {
        if let Some(failure) = self.failure() {
            ScopeExit::Failed(failure)
        } else if let Some(reason) = self.cancel_reason() {
            ScopeExit::Cancelled(reason)
        } else {
            ScopeExit::Completed
        }
    }
}

/// Helper for constructing a scope with explicit policy.
#[derive(Debug)]
pub struct ScopeBuilder {
    dispatchers: DispatcherProvider,
    label: String,
    default_context: ContextName,
    deadline: Option<Duration>,
}

impl ScopeBuilder {
    /// Builder for a scope labelled `scope` on the I/O context.
    pub fn new(dispatchers: DispatcherProvider) -> Self {
        Self {
            dispatchers,
            label: "scope".to_string(),
            default_context: ContextName::Io,
            deadline: None,
        }
    }

    /// Label used in logs and failures.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Context for launches that do not name one.
    pub fn default_context(mut self, context: ContextName) -> Self {
        self.default_context = context;
        self
    }

    /// Time the scope out after `timeout`; see
    /// [`CancellableScope::with_deadline`].
    pub fn deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(timeout);
        self
    }

    /// Create the scope and start its deadline, if any.
    pub fn build(self) -> CancellableScope {
        let scope = CancellableScope::from_parts(
            self.label,
            CancellationToken::new(),
            self.dispatchers,
            self.default_context,
            None,
            false,
        );
        if let Some(timeout) = self.deadline {
            scope.with_deadline(timeout);
        }
        scope
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::runtime::Handle;

    use super::*;
    use crate::dispatch::ExecutionContext;

    fn scope(label: &str) -> CancellableScope {
        CancellableScope::new(label, DispatcherProvider::current())
    }

    #[tokio::test]
    async fn completed_task_delivers_value() {
        let scope = scope("value");
        let handle = scope.launch(|_| async { Ok::<_, String>(7) });
        let id = handle.id();

        assert_eq!(scope.join(handle).await, Outcome::Completed(7));
        assert_eq!(scope.task_states(), vec![(id, TaskState::Completed)]);
        assert_eq!(scope.finish().await, ScopeExit::Completed);
        assert_eq!(scope.state(), ScopeState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_moves_every_running_task_to_cancelled() {
        let scope = scope("cancel-all");
        let handles: Vec<_> = (0..3)
            .map(|_| {
                scope.launch(|_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, String>(())
                })
            })
            .collect();
        tokio::task::yield_now().await;

        scope.cancel();
        scope.cancel();

        for (_, state) in scope.task_states() {
            assert_eq!(state, TaskState::Cancelled);
        }
        for handle in handles {
            assert!(scope.join(handle).await.is_cancelled());
        }
        assert_eq!(
            scope.finish().await,
            ScopeExit::Cancelled(CancelReason::Requested)
        );
        assert_eq!(scope.state(), ScopeState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn non_isolated_failure_cancels_siblings() {
        let scope = scope("fatal");
        let sibling = scope.launch(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>("late")
        });
        let failing = scope.launch(|_| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err::<(), _>("boom".to_string())
        });
        let failing_id = failing.id();

        assert_eq!(scope.join(failing).await, Outcome::Failed("boom".into()));
        assert!(scope.join(sibling).await.is_cancelled());

        match scope.finish().await {
            ScopeExit::Failed(failure) => {
                assert_eq!(failure.task, failing_id);
                assert_eq!(failure.message, "boom");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(scope.cancel_reason(), Some(CancelReason::SiblingFailed));
    }

    #[tokio::test]
    async fn isolated_failure_stays_with_its_handle() {
        let scope = scope("isolated");
        let failing = scope.launch_isolated(|_| async { Err::<(), _>("nope") });
        let healthy = scope.launch(|_| async { Ok::<_, &str>(1) });

        assert_eq!(scope.join(failing).await, Outcome::Failed("nope"));
        assert_eq!(scope.join(healthy).await, Outcome::Completed(1));
        assert!(scope.failure().is_none());
        assert!(!scope.is_cancelled());
    }

    #[tokio::test]
    async fn panics_are_captured_as_failures() {
        let scope = scope("panic");
        let handle = scope.launch(|_| async {
            if true {
                panic!("exploded");
            }
            Ok::<(), String>(())
        });

        assert_eq!(
            scope.join(handle).await,
            Outcome::Panicked("exploded".to_string())
        );
        assert!(matches!(scope.finish().await, ScopeExit::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_and_unblocks_join() {
        let scope = CancellableScope::builder(DispatcherProvider::current())
            .label("deadline")
            .deadline(Duration::from_millis(50))
            .build();
        let handle = scope.launch(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(())
        });

        let started = Instant::now();
        assert!(scope.join(handle).await.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(scope.cancel_reason(), Some(CancelReason::TimedOut));
    }

    #[tokio::test]
    async fn oversized_deadline_is_ignored() {
        let scope = CancellableScope::builder(DispatcherProvider::current())
            .label("unbounded")
            .deadline(Duration::MAX)
            .build();
        let handle = scope.launch(|_| async { Ok::<_, String>(3) });

        assert_eq!(scope.deadline(), None);
        assert_eq!(scope.join(handle).await, Outcome::Completed(3));
        assert_eq!(scope.finish().await, ScopeExit::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_runs_on_the_requested_context() {
        let handle = Handle::current();
        let dispatchers = DispatcherProvider::builder(handle.clone())
            .with_context(ExecutionContext::new(
                ContextName::Cpu,
                handle.clone(),
                1,
            ))
            .with_context(ExecutionContext::new(ContextName::Io, handle, 4))
            .build();
        let scope = CancellableScope::new("placed", dispatchers.clone());

        let task = scope.launch_with(
            TaskOptions::default().on(ContextName::Cpu),
            |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, String>(())
            },
        );
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(dispatchers.cpu().available_permits(), Some(0));
        assert_eq!(dispatchers.io().available_permits(), Some(4));

        scope.cancel();
        assert!(scope.join(task).await.is_cancelled());
        scope.finish().await;
        assert_eq!(dispatchers.cpu().available_permits(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn default_context_applies_to_plain_launches() {
        let handle = Handle::current();
        let dispatchers = DispatcherProvider::builder(handle.clone())
            .with_context(ExecutionContext::new(
                ContextName::Cpu,
                handle.clone(),
                1,
            ))
            .with_context(ExecutionContext::new(ContextName::Io, handle, 4))
            .build();
        let scope = CancellableScope::builder(dispatchers.clone())
            .label("cpu-bound")
            .default_context(ContextName::Cpu)
            .build();

        let _task = scope.launch(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(())
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(dispatchers.cpu().available_permits(), Some(0));
        assert_eq!(dispatchers.io().available_permits(), Some(4));
        scope.cancel();
    }

    #[tokio::test]
    async fn cancelled_scope_refuses_new_work() {
        let scope = scope("closed");
        scope.cancel();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let handle = scope.launch(move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        });

        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(scope.join(handle).await.is_cancelled());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_reaches_children() {
        let parent = scope("parent");
        let child = parent.child("child");
        let handle = child.launch(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(())
        });

        parent.cancel_with(CancelReason::Superseded);

        assert!(child.join(handle).await.is_cancelled());
        assert!(child.is_cancelled());
        assert_eq!(child.cancel_reason(), Some(CancelReason::ParentCancelled));
        assert_eq!(parent.cancel_reason(), Some(CancelReason::Superseded));
    }

    #[tokio::test]
    async fn child_failure_propagates_unless_isolated() {
        let parent = scope("parent");
        let contained = parent.child_isolated("contained");
        let handle = contained.launch(|_| async { Err::<(), _>("contained") });
        contained.join(handle).await;
        contained.finish().await;
        assert!(parent.failure().is_none());

        let fatal = parent.child("fatal");
        let handle = fatal.launch(|_| async { Err::<(), _>("escalated") });
        fatal.join(handle).await;
        fatal.finish().await;

        let failure = parent.failure().expect("parent records child failure");
        assert_eq!(failure.message, "escalated");
        assert_eq!(failure.scope, "fatal");
        assert!(parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_last_owner_cancels_tasks() {
        let scope = scope("dropped");
        let token = scope.token();
        let _handle = scope.launch(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(())
        });

        drop(scope);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("drop cancels the scope token");
    }

    #[tokio::test]
    async fn complete_is_not_cancellation() {
        let scope = scope("complete");
        scope.complete();

        assert!(!scope.is_cancelled());
        assert_eq!(scope.cancel_reason(), None);
        scope.cancel();
        assert_eq!(scope.state(), ScopeState::Completed);
    }
}
