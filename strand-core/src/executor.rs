//! Use-case execution with supersession and deadlines.
//!
//! [`UseCaseExecutor::execute`] starts one pipeline run for an
//! [`OperationKey`]. A newer run for the same key cancels the older one
//! before it starts any work of its own, so at most one run per key is ever
//! in flight and the last request wins. A deadline, when configured, is a
//! scheduled cancellation of the run's scope: the consumer sees the state
//! stream end, not a synthesized error.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use strand_model::{OperationKey, ResultState, RetryPolicy, RunId};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{ExecutorConfig, OrchestratorConfig},
    dispatch::DispatcherProvider,
    error::{OrchestrationError, Result},
    pipeline::{ReconcilingPipeline, StateStream},
    scope::{CancelReason, CancellableScope, ScopeExit, ScopeFailure},
    sources::{LocalSource, RemoteSource},
    state_holder::StateHolder,
};

/// Deadline selection for a single run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Deadline {
    /// Use the executor's configured timeout, if any.
    #[default]
    Inherit,
    /// No deadline, whatever the executor is configured with.
    Disabled,
    /// Cancel the run once this much time has passed.
    /// A duration too large to represent sets no deadline.
    After(Duration),
}

/// Per-call overrides for [`UseCaseExecutor::execute_with`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Deadline for this run.
    pub deadline: Deadline,
}

impl ExecuteOptions {
    /// Run with a deadline of `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            deadline: Deadline::After(timeout),
        }
    }

    /// Run without any deadline.
    pub fn no_timeout() -> Self {
        Self {
            deadline: Deadline::Disabled,
        }
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome<T> {
    /// The pipeline ran to its end; carries the last state it emitted.
    Completed(ResultState<T>),
    /// The run's scope was cancelled before the pipeline ended.
    Cancelled(CancelReason),
    /// A non-isolated task failed the run's scope.
    Failed(ScopeFailure),
}

impl<T> RunOutcome<T> {
    /// True for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled(_))
    }

    /// The final state, with cancellation and failure as errors.
    pub fn into_result(self) -> Result<ResultState<T>> {
        match self {
            RunOutcome::Completed(state) => Ok(state),
            RunOutcome::Cancelled(reason) => {
                Err(OrchestrationError::Cancelled(reason))
            }
            RunOutcome::Failed(failure) => {
                Err(OrchestrationError::ScopeFailed(failure))
            }
        }
    }
}

struct InFlight {
    run_id: RunId,
    scope: CancellableScope,
    finished: CancellationToken,
}

type InFlightMap = Arc<Mutex<HashMap<OperationKey, InFlight>>>;

/// Handle to one run started by the executor.
///
/// Dropping it does not cancel the run; use [`Execution::cancel`] or
/// [`UseCaseExecutor::cancel`].
pub struct Execution<T> {
    key: OperationKey,
    run_id: RunId,
    scope: CancellableScope,
    holder: StateHolder<T>,
    run_states: StateHolder<T>,
    finished: CancellationToken,
    outcome: oneshot::Receiver<RunOutcome<T>>,
}

impl<T> fmt::Debug for Execution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("key", &self.key)
            .field("run_id", &self.run_id)
            .field("scope", &self.scope)
            .field("finished", &self.finished.is_cancelled())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Execution<T> {
    /// Key the run was started for.
    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    /// Id of this run.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Scope the run's tasks live in.
    pub fn scope(&self) -> &CancellableScope {
        &self.scope
    }

    /// The holder states are recorded into. For
    /// [`UseCaseExecutor::execute_into`] this is the caller's holder, which
    /// also carries earlier runs.
    pub fn holder(&self) -> &StateHolder<T> {
        &self.holder
    }

    /// States of this run only: a replay of the latest, then live states,
    /// ending when the run ends.
    pub fn states(&self) -> BoxStream<'static, ResultState<T>> {
        self.run_states.observe()
    }

    /// Every state this run recorded so far.
    pub fn history(&self) -> Vec<ResultState<T>> {
        self.run_states.history()
    }

    /// Latest state of this run.
    pub fn current(&self) -> ResultState<T> {
        self.run_states.current()
    }

    /// Cancel this run with [`CancelReason::Requested`].
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    /// Whether the run has ended and released its key.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once the run has ended and released its key.
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> RunOutcome<T> {
        match self.outcome.await {
            Ok(outcome) => outcome,
            // The driver was dropped with its runtime.
            Err(_) => RunOutcome::Cancelled(
                self.scope
                    .cancel_reason()
                    .unwrap_or(CancelReason::ParentCancelled),
            ),
        }
    }
}

/// Starts pipeline runs keyed by [`OperationKey`].
///
/// Cloning yields another handle sharing the same in-flight table.
#[derive(Clone)]
pub struct UseCaseExecutor {
    dispatchers: DispatcherProvider,
    config: ExecutorConfig,
    default_policy: RetryPolicy,
    in_flight: InFlightMap,
}

impl fmt::Debug for UseCaseExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UseCaseExecutor")
            .field("config", &self.config)
            .field("default_policy", &self.default_policy)
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl UseCaseExecutor {
    /// Executor on `dispatchers` with the default retry policy.
    pub fn new(
        dispatchers: DispatcherProvider,
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dispatchers,
            config,
            default_policy: RetryPolicy::default(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Executor on contexts budgeted per `config.dispatch`, with the retry
    /// section as its default policy.
    pub fn from_config(
        handle: tokio::runtime::Handle,
        config: &OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let dispatchers = DispatcherProvider::new(handle, &config.dispatch);
        Ok(Self {
            dispatchers,
            config: config.executor,
            default_policy: config.retry.policy()?,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Contexts runs are scheduled on.
    pub fn dispatchers(&self) -> &DispatcherProvider {
        &self.dispatchers
    }

    /// Executor settings.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Policy configured for this executor; callers pass it (or their own)
    /// to each run.
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Start a run for `key` with a fresh holder.
    pub fn execute<T, L, R>(
        &self,
        key: OperationKey,
        local: L,
        remote: R,
        policy: RetryPolicy,
    ) -> Execution<T>
    where
        T: Clone + Send + Sync + 'static,
        L: LocalSource<T> + 'static,
        R: RemoteSource<T> + 'static,
    {
        self.execute_with(key, local, remote, policy, ExecuteOptions::default())
    }

    /// Start a run with per-call [`ExecuteOptions`].
    pub fn execute_with<T, L, R>(
        &self,
        key: OperationKey,
        local: L,
        remote: R,
        policy: RetryPolicy,
        options: ExecuteOptions,
    ) -> Execution<T>
    where
        T: Clone + Send + Sync + 'static,
        L: LocalSource<T> + 'static,
        R: RemoteSource<T> + 'static,
    {
        let pipeline = ReconcilingPipeline::new(local, remote);
        self.execute_pipeline(key, &pipeline, policy, options, None)
    }

    /// Start a run that records into `holder`, which outlives the run.
    pub fn execute_into<T, L, R>(
        &self,
        key: OperationKey,
        local: L,
        remote: R,
        policy: RetryPolicy,
        holder: &StateHolder<T>,
    ) -> Execution<T>
    where
        T: Clone + Send + Sync + 'static,
        L: LocalSource<T> + 'static,
        R: RemoteSource<T> + 'static,
    {
        let pipeline = ReconcilingPipeline::new(local, remote);
        self.execute_pipeline(
            key,
            &pipeline,
            policy,
            ExecuteOptions::default(),
            Some(holder),
        )
    }

    /// Start a run of an existing pipeline. The most general entry point.
    pub fn execute_pipeline<T, L, R>(
        &self,
        key: OperationKey,
        pipeline: &ReconcilingPipeline<T, L, R>,
        policy: RetryPolicy,
        options: ExecuteOptions,
        holder: Option<&StateHolder<T>>,
    ) -> Execution<T>
    where
        T: Clone + Send + Sync + 'static,
        L: LocalSource<T> + 'static,
        R: RemoteSource<T> + 'static,
    {
        let run_id = RunId::new();
        let scope = CancellableScope::builder(self.dispatchers.clone())
            .label(format!("{key}/{run_id}"))
            .build();
        let finished = CancellationToken::new();

        let previous = self.in_flight.lock().insert(
            key.clone(),
            InFlight {
                run_id,
                scope: scope.clone(),
                finished: finished.clone(),
            },
        );
        if let Some(previous) = &previous {
            info!(
                target: "strand::executor",
                key = %key,
                run_id = %run_id,
                superseded = %previous.run_id,
                "superseding in-flight run"
            );
            previous.scope.cancel_with(CancelReason::Superseded);
        }

        let timeout = match options.deadline {
            Deadline::Inherit => self.config.timeout(),
            Deadline::Disabled => None,
            Deadline::After(timeout) => Some(timeout),
        };
        debug!(
            target: "strand::executor",
            key = %key,
            run_id = %run_id,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            max_attempts = policy.max_attempts(),
            "starting run"
        );

        let run_states = StateHolder::new();
        let shared_holder = holder.is_some();
        let holder = holder.cloned().unwrap_or_else(|| run_states.clone());
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let driver = RunDriver {
            key: key.clone(),
            run_id,
            scope: scope.clone(),
            stream: pipeline.run(policy, &scope),
            holder: holder.clone(),
            run_states: run_states.clone(),
            shared_holder,
            previous,
            supersede_grace: self.config.supersede_grace(),
            timeout,
            in_flight: Arc::clone(&self.in_flight),
            finished: finished.clone(),
        };
        self.dispatchers
            .coordination()
            .spawn(driver.drive(outcome_tx));

        Execution {
            key,
            run_id,
            scope,
            holder,
            run_states,
            finished,
            outcome: outcome_rx,
        }
    }

    /// Cancel the in-flight run for `key`. Returns whether there was one.
    pub fn cancel(&self, key: &OperationKey) -> bool {
        match self.in_flight.lock().get(key) {
            Some(entry) => {
                entry.scope.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight run, e.g. when the owning screen goes away.
    pub fn cancel_all(&self) {
        let in_flight = self.in_flight.lock();
        if !in_flight.is_empty() {
            debug!(
                target: "strand::executor",
                runs = in_flight.len(),
                "cancelling all runs"
            );
        }
        for entry in in_flight.values() {
            entry.scope.cancel();
        }
    }

    /// Keys with a run in flight, sorted.
    pub fn in_flight(&self) -> Vec<OperationKey> {
        let mut keys: Vec<_> = self.in_flight.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Moves states from a run's pipeline into its holders and settles the run.
struct RunDriver<T> {
    key: OperationKey,
    run_id: RunId,
    scope: CancellableScope,
    stream: StateStream<T>,
    holder: StateHolder<T>,
    run_states: StateHolder<T>,
    /// `holder` is a caller-owned holder distinct from `run_states`.
    shared_holder: bool,
    previous: Option<InFlight>,
    supersede_grace: Duration,
    timeout: Option<Duration>,
    in_flight: InFlightMap,
    finished: CancellationToken,
}

impl<T: Clone + Send + Sync + 'static> RunDriver<T> {
    async fn drive(self, outcome_tx: oneshot::Sender<RunOutcome<T>>) {
        let RunDriver {
            key,
            run_id,
            scope,
            mut stream,
            holder,
            run_states,
            shared_holder,
            previous,
            supersede_grace,
            timeout,
            in_flight,
            finished,
        } = self;

        if let Some(previous) = previous {
            let stopped = tokio::time::timeout(
                supersede_grace,
                previous.finished.cancelled(),
            )
            .await
            .is_ok();
            if !stopped {
                warn!(
                    target: "strand::executor",
                    key = %key,
                    run_id = %run_id,
                    superseded = %previous.run_id,
                    grace_ms = supersede_grace.as_millis() as u64,
                    "superseded run did not stop within grace period; \
                     starting anyway"
                );
            }
        }

        if let Some(timeout) = timeout {
            scope.with_deadline(timeout);
        }

        let mut last = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = scope.cancelled() => None,
                state = stream.next() => state,
            };
            let Some(state) = next else { break };
            if scope.is_cancelled() {
                break;
            }
            run_states.record(state.clone());
            if shared_holder {
                holder.record(state.clone());
            }
            last = Some(state);
        }
        drop(stream);

        let outcome = match scope.finish().await {
            ScopeExit::Completed => {
                RunOutcome::Completed(last.unwrap_or_default())
            }
            ScopeExit::Cancelled(reason) => RunOutcome::Cancelled(reason),
            ScopeExit::Failed(failure) => RunOutcome::Failed(failure),
        };

        {
            let mut in_flight = in_flight.lock();
            if in_flight.get(&key).is_some_and(|entry| entry.run_id == run_id) {
                in_flight.remove(&key);
            }
        }
        run_states.close();

        match &outcome {
            RunOutcome::Completed(state) => debug!(
                target: "strand::executor",
                key = %key,
                run_id = %run_id,
                terminal = state.is_terminal(),
                "run completed"
            ),
            RunOutcome::Cancelled(reason) => debug!(
                target: "strand::executor",
                key = %key,
                run_id = %run_id,
                reason = %reason,
                "run cancelled"
            ),
            RunOutcome::Failed(failure) => warn!(
                target: "strand::executor",
                key = %key,
                run_id = %run_id,
                error = %failure,
                "run failed"
            ),
        }

        let _ = outcome_tx.send(outcome);
        finished.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use strand_model::ErrorKind;

    use super::*;
    use crate::sources::{NoLocal, local_fn, remote_fn};

    fn executor() -> UseCaseExecutor {
        UseCaseExecutor::new(
            DispatcherProvider::current(),
            ExecutorConfig::default(),
        )
        .expect("default config")
    }

    fn key(raw: &str) -> OperationKey {
        OperationKey::new(raw).expect("valid key")
    }

    #[tokio::test]
    async fn run_records_states_and_releases_key() {
        let executor = executor();
        let run = executor.execute(
            key("get-user:42"),
            local_fn(|| async { Ok(Some("cached")) }),
            remote_fn(|| async { Ok::<_, String>("fresh") }, |_: &String| {
                ErrorKind::Transient
            }),
            RetryPolicy::default(),
        );
        assert_eq!(executor.in_flight(), vec![key("get-user:42")]);

        let holder = run.holder().clone();
        let outcome = run.wait().await;

        assert_eq!(
            outcome,
            RunOutcome::Completed(ResultState::remote("fresh"))
        );
        assert_eq!(
            holder.history(),
            vec![
                ResultState::Loading,
                ResultState::local("cached"),
                ResultState::remote("fresh"),
            ]
        );
        assert!(executor.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_ends_run_silently() {
        let executor = executor();
        let run = executor.execute_with(
            key("slow"),
            NoLocal,
            remote_fn(
                || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, String>(1)
                },
                |_: &String| ErrorKind::Transient,
            ),
            RetryPolicy::default(),
            ExecuteOptions::timeout(Duration::from_millis(250)),
        );

        let holder = run.holder().clone();
        assert_eq!(
            run.wait().await,
            RunOutcome::Cancelled(CancelReason::TimedOut)
        );
        assert_eq!(holder.history(), vec![ResultState::Loading]);
    }

    #[tokio::test]
    async fn unrepresentable_timeout_runs_without_deadline() {
        let executor = executor();
        let run = executor.execute_with(
            key("forever"),
            NoLocal,
            remote_fn(
                || async { Ok::<_, String>(1) },
                |_: &String| ErrorKind::Transient,
            ),
            RetryPolicy::default(),
            ExecuteOptions::timeout(Duration::MAX),
        );

        let holder = run.holder().clone();
        assert_eq!(
            run.wait().await,
            RunOutcome::Completed(ResultState::remote(1))
        );
        assert_eq!(
            holder.history(),
            vec![ResultState::Loading, ResultState::remote(1)]
        );
        assert!(executor.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_by_key_stops_the_run() {
        let executor = executor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let run = executor.execute(
            key("search:rust"),
            NoLocal,
            remote_fn(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<u8, String>(1)
                    }
                },
                |_: &String| ErrorKind::Transient,
            ),
            RetryPolicy::default(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(executor.cancel(&key("search:rust")));
        assert!(!executor.cancel(&key("unknown")));
        assert_eq!(
            run.wait().await,
            RunOutcome::Cancelled(CancelReason::Requested)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let config = OrchestratorConfig {
            executor: ExecutorConfig {
                timeout_ms: Some(0),
                ..ExecutorConfig::default()
            },
            ..OrchestratorConfig::default()
        };

        let result =
            UseCaseExecutor::from_config(runtime.handle().clone(), &config);
        assert!(matches!(result, Err(OrchestrationError::InvalidConfig(_))));
    }
}
