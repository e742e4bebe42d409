//! Cache-then-network reconciliation.
//!
//! [`ReconcilingPipeline::run`] turns one local read and one (retried)
//! remote read into an ordered stream of [`ResultState`]s:
//!
//! ```text
//! Loading -> [Success(local)] -> Success(remote) | Error | (end)
//! ```
//!
//! The stream is lazy: nothing is read until it is polled. Both reads run as
//! isolated tasks of the supplied scope, so a failing read never tears the
//! scope down, while cancelling the scope ends the stream at its next
//! suspension point without a synthetic error.

use std::{fmt, marker::PhantomData, sync::Arc};

use async_stream::stream;
use futures::stream::BoxStream;
use strand_model::{ErrorKind, ResultState, RetryPolicy};
use tracing::{debug, warn};

use crate::{
    dispatch::ContextName,
    scope::{CancellableScope, Outcome, TaskOptions},
    sources::{LocalSource, RemoteFailure, RemoteSource},
};

/// Single-consumer stream of states for one run.
pub type StateStream<T> = BoxStream<'static, ResultState<T>>;

/// A local and a remote source bound together.
pub struct ReconcilingPipeline<T, L, R> {
    local: Arc<L>,
    remote: Arc<R>,
    _value: PhantomData<fn() -> T>,
}

impl<T, L, R> Clone for ReconcilingPipeline<T, L, R> {
    fn clone(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            remote: Arc::clone(&self.remote),
            _value: PhantomData,
        }
    }
}

impl<T, L, R> fmt::Debug for ReconcilingPipeline<T, L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilingPipeline")
            .field("value", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}

impl<T, L, R> ReconcilingPipeline<T, L, R>
where
    T: Send + 'static,
    L: LocalSource<T> + 'static,
    R: RemoteSource<T> + 'static,
{
    /// Pipeline over owned sources.
    pub fn new(local: L, remote: R) -> Self {
        Self::from_shared(Arc::new(local), Arc::new(remote))
    }

    /// Pipeline over sources shared with other pipelines.
    pub fn from_shared(local: Arc<L>, remote: Arc<R>) -> Self {
        Self {
            local,
            remote,
            _value: PhantomData,
        }
    }

    /// Build the state stream for one run inside `scope`.
    ///
    /// The policy is taken by value and is fixed for the run.
    pub fn run(
        &self,
        policy: RetryPolicy,
        scope: &CancellableScope,
    ) -> StateStream<T> {
        let local = Arc::clone(&self.local);
        let remote = Arc::clone(&self.remote);
        let scope = scope.clone();
        let read_options = TaskOptions::isolated().on(ContextName::Io);

        Box::pin(stream! {
            if scope.is_cancelled() {
                return;
            }
            yield ResultState::Loading;

            let read = scope.launch_with(read_options, move |_| async move {
                local.read().await
            });
            let mut has_local = false;
            match scope.join(read).await {
                Outcome::Completed(Some(value)) => {
                    if scope.is_cancelled() {
                        return;
                    }
                    debug!(
                        target: "strand::pipeline",
                        scope = %scope.label(),
                        "serving local value"
                    );
                    has_local = true;
                    yield ResultState::local(value);
                }
                Outcome::Completed(None) => {
                    debug!(
                        target: "strand::pipeline",
                        scope = %scope.label(),
                        "no local value"
                    );
                }
                Outcome::Failed(error) => {
                    debug!(
                        target: "strand::pipeline",
                        scope = %scope.label(),
                        error = %error,
                        "local read failed; continuing without a local value"
                    );
                }
                Outcome::Panicked(message) => {
                    warn!(
                        target: "strand::pipeline",
                        scope = %scope.label(),
                        panic = %message,
                        "local read panicked; continuing without a local value"
                    );
                }
                Outcome::Cancelled => return,
            }

            let mut attempt: u32 = 0;
            let failure = loop {
                attempt += 1;
                let remote = Arc::clone(&remote);
                let fetch = scope.launch_with(read_options, move |_| {
                    async move {
                        remote.fetch().await.map_err(|error| {
                            let kind = remote.classify(&error);
                            RemoteFailure::new(kind, error.to_string())
                        })
                    }
                });

                match scope.join(fetch).await {
                    Outcome::Completed(value) => {
                        if scope.is_cancelled() {
                            return;
                        }
                        debug!(
                            target: "strand::pipeline",
                            scope = %scope.label(),
                            attempt,
                            "remote read succeeded"
                        );
                        yield ResultState::remote(value);
                        return;
                    }
                    Outcome::Cancelled => return,
                    Outcome::Panicked(message) => {
                        break RemoteFailure::new(ErrorKind::Permanent, message);
                    }
                    Outcome::Failed(failure) => {
                        if !policy.should_retry(attempt, failure.kind) {
                            break failure;
                        }
                        let delay = policy.delay_after(attempt);
                        debug!(
                            target: "strand::pipeline",
                            scope = %scope.label(),
                            attempt,
                            kind = %failure.kind,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.message,
                            "remote read failed; backing off"
                        );
                        let cancelled = tokio::select! {
                            biased;
                            _ = scope.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        };
                        if cancelled {
                            return;
                        }
                    }
                }
            };

            if has_local {
                debug!(
                    target: "strand::pipeline",
                    scope = %scope.label(),
                    attempt,
                    error = %failure.message,
                    "remote read gave up; local value stands"
                );
                return;
            }
            if scope.is_cancelled() {
                return;
            }

            let retryable = policy.is_retryable(failure.kind);
            warn!(
                target: "strand::pipeline",
                scope = %scope.label(),
                attempt,
                kind = %failure.kind,
                retryable,
                error = %failure.message,
                "remote read failed"
            );
            yield ResultState::error(failure.kind, failure.message, retryable);
        })
    }
}

/// One-shot form of [`ReconcilingPipeline::run`].
pub fn reconcile<T, L, R>(
    local: L,
    remote: R,
    policy: RetryPolicy,
    scope: &CancellableScope,
) -> StateStream<T>
where
    T: Send + 'static,
    L: LocalSource<T> + 'static,
    R: RemoteSource<T> + 'static,
{
    ReconcilingPipeline::new(local, remote).run(policy, scope)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;
    use strand_model::Origin;

    use super::*;
    use crate::{
        dispatch::DispatcherProvider,
        sources::{NoLocal, local_fn, remote_fn},
    };

    fn scope() -> CancellableScope {
        CancellableScope::new("pipeline-test", DispatcherProvider::current())
    }

    #[tokio::test]
    async fn nothing_runs_until_polled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let scope = scope();
        let stream = reconcile(
            NoLocal,
            remote_fn(
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(1)
                    }
                },
                |_: &String| ErrorKind::Permanent,
            ),
            RetryPolicy::default(),
            &scope,
        );

        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let states: Vec<_> = stream.collect().await;
        assert_eq!(states, vec![ResultState::Loading, ResultState::remote(1)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_local_read_counts_as_absent() {
        let scope = scope();
        let states: Vec<_> = reconcile(
            local_fn(|| async {
                Err::<Option<&str>, _>(anyhow::anyhow!("disk gone"))
            }),
            remote_fn(|| async { Ok::<_, String>("fresh") }, |_: &String| {
                ErrorKind::Transient
            }),
            RetryPolicy::default(),
            &scope,
        )
        .collect()
        .await;

        assert_eq!(
            states,
            vec![ResultState::Loading, ResultState::remote("fresh")]
        );
    }

    #[tokio::test]
    async fn panicking_remote_is_permanent() {
        let scope = scope();
        let states: Vec<ResultState<u8>> = reconcile(
            NoLocal,
            remote_fn(
                || async {
                    if true {
                        panic!("fetch exploded");
                    }
                    Ok::<u8, String>(0)
                },
                |_: &String| ErrorKind::Transient,
            ),
            RetryPolicy::default(),
            &scope,
        )
        .collect()
        .await;

        assert_eq!(states.len(), 2);
        assert_eq!(states[1].error_kind(), Some(ErrorKind::Permanent));
        assert!(scope.failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_remote_keeps_local_value() {
        let scope = scope();
        let states: Vec<_> = reconcile(
            local_fn(|| async { Ok(Some("cached")) }),
            remote_fn(
                || async { Err::<&str, _>("timeout".to_string()) },
                |_: &String| ErrorKind::Transient,
            ),
            RetryPolicy::default(),
            &scope,
        )
        .collect()
        .await;

        assert_eq!(states.len(), 2);
        assert_eq!(states[1].origin(), Some(Origin::Local));
    }

    #[tokio::test]
    async fn cancelled_scope_yields_nothing() {
        let scope = scope();
        scope.cancel();

        let states: Vec<ResultState<u8>> = reconcile(
            NoLocal,
            remote_fn(|| async { Ok::<_, String>(1) }, |_: &String| {
                ErrorKind::Transient
            }),
            RetryPolicy::default(),
            &scope,
        )
        .collect()
        .await;

        assert!(states.is_empty());
    }
}
