use std::{
    fmt,
    fmt::Write as _,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use clap::ValueEnum;
use serde::Serialize;
use strand_core::{
    ErrorKind, ExecuteOptions, NoLocal, OperationKey, OrchestratorConfig,
    ResultState, RunOutcome, StateHolder, UseCaseExecutor, local_fn, remote_fn,
};
use tokio::runtime::Handle;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Cached value first, then the fresh remote value
    CacheThenNetwork,
    /// Two transient remote failures, then success
    RetryThenSuccess,
    /// Transient failures until the retry budget runs out
    Exhausted,
    /// A permanent failure that is not retried
    NonRetryable,
    /// A second request for the same key replaces the first
    Supersede,
    /// The remote is slower than the run's deadline
    Timeout,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => write!(f, "{self:?}"),
        }
    }
}

#[derive(Debug, Clone)]
struct SimulatedError {
    kind: ErrorKind,
    message: &'static str,
}

impl fmt::Display for SimulatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

fn classify(error: &SimulatedError) -> ErrorKind {
    error.kind
}

const UNAVAILABLE: SimulatedError = SimulatedError {
    kind: ErrorKind::Transient,
    message: "503 service unavailable",
};

const NOT_FOUND: SimulatedError = SimulatedError {
    kind: ErrorKind::Permanent,
    message: "404 record not found",
};

#[derive(Debug, Serialize)]
pub struct DemoReport {
    scenario: Scenario,
    history: Vec<ResultState<String>>,
    outcome: String,
    remote_calls: usize,
    elapsed_ms: u64,
}

impl DemoReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "scenario: {}", self.scenario);
        for (index, state) in self.history.iter().enumerate() {
            let _ = writeln!(out, "  [{index}] {state}");
        }
        let _ = writeln!(out, "outcome: {}", self.outcome);
        let _ = writeln!(out, "remote calls: {}", self.remote_calls);
        let _ = writeln!(out, "elapsed: {}ms", self.elapsed_ms);
        out
    }
}

fn describe(outcome: &RunOutcome<String>) -> String {
    match outcome {
        RunOutcome::Completed(state) if state.error_kind().is_some() => {
            "completed with error".to_string()
        }
        RunOutcome::Completed(_) => "completed".to_string(),
        RunOutcome::Cancelled(reason) => format!("cancelled ({reason})"),
        RunOutcome::Failed(failure) => format!("failed: {failure}"),
    }
}

/// Remote that fails with the scripted errors in order, then succeeds.
fn scripted_remote(
    script: Vec<SimulatedError>,
    value: &'static str,
    latency: Duration,
    calls: Arc<AtomicUsize>,
) -> impl strand_core::RemoteSource<String, Error = SimulatedError> {
    let script = Arc::new(script);
    remote_fn(
        move || {
            let script = Arc::clone(&script);
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(latency).await;
                match script.get(attempt) {
                    Some(error) => Err(error.clone()),
                    None => Ok(value.to_string()),
                }
            }
        },
        classify,
    )
}

pub async fn run(
    scenario: Scenario,
    latency: Duration,
    config: &OrchestratorConfig,
) -> anyhow::Result<DemoReport> {
    let executor = UseCaseExecutor::from_config(Handle::current(), config)?;
    let policy = executor.default_policy().clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = OperationKey::new(format!("demo:{scenario}"))?;
    let started = tokio::time::Instant::now();

    info!(
        %scenario,
        latency_ms = latency.as_millis() as u64,
        "running scenario"
    );

    let (history, outcome) = match scenario {
        Scenario::CacheThenNetwork => {
            let run = executor.execute(
                key,
                local_fn(|| async { Ok(Some("cached profile".to_string())) }),
                scripted_remote(
                    Vec::new(),
                    "fresh profile",
                    latency,
                    Arc::clone(&calls),
                ),
                policy,
            );
            let holder = run.holder().clone();
            holder_after(run.wait().await, &holder)
        }
        Scenario::RetryThenSuccess => {
            let run = executor.execute(
                key,
                NoLocal,
                scripted_remote(
                    vec![UNAVAILABLE, UNAVAILABLE],
                    "fresh profile",
                    latency,
                    Arc::clone(&calls),
                ),
                policy,
            );
            let holder = run.holder().clone();
            holder_after(run.wait().await, &holder)
        }
        Scenario::Exhausted => {
            let script = vec![UNAVAILABLE; policy.max_attempts() as usize];
            let run = executor.execute(
                key,
                NoLocal,
                scripted_remote(
                    script,
                    "unreachable",
                    latency,
                    Arc::clone(&calls),
                ),
                policy,
            );
            let holder = run.holder().clone();
            holder_after(run.wait().await, &holder)
        }
        Scenario::NonRetryable => {
            let run = executor.execute(
                key,
                NoLocal,
                scripted_remote(
                    vec![NOT_FOUND],
                    "unreachable",
                    latency,
                    Arc::clone(&calls),
                ),
                policy,
            );
            let holder = run.holder().clone();
            holder_after(run.wait().await, &holder)
        }
        Scenario::Supersede => {
            let holder = StateHolder::new();
            let first = executor.execute_into(
                key.clone(),
                local_fn(|| async { Ok(Some("cached results".to_string())) }),
                scripted_remote(
                    Vec::new(),
                    "stale results",
                    latency * 10,
                    Arc::clone(&calls),
                ),
                policy.clone(),
                &holder,
            );
            tokio::time::sleep(latency).await;
            let second = executor.execute_into(
                key,
                NoLocal,
                scripted_remote(
                    Vec::new(),
                    "latest results",
                    latency,
                    Arc::clone(&calls),
                ),
                policy,
                &holder,
            );
            let first_outcome = first.wait().await;
            info!(outcome = %describe(&first_outcome), "first run settled");
            holder_after(second.wait().await, &holder)
        }
        Scenario::Timeout => {
            let run = executor.execute_with(
                key,
                local_fn(|| async { Ok(Some("cached profile".to_string())) }),
                scripted_remote(
                    Vec::new(),
                    "too late",
                    latency * 20,
                    Arc::clone(&calls),
                ),
                policy,
                ExecuteOptions::timeout(latency * 5),
            );
            let holder = run.holder().clone();
            holder_after(run.wait().await, &holder)
        }
    };

    Ok(DemoReport {
        scenario,
        history,
        outcome: describe(&outcome),
        remote_calls: calls.load(Ordering::SeqCst),
        elapsed_ms: u64::try_from(started.elapsed().as_millis())
            .unwrap_or(u64::MAX),
    })
}

fn holder_after(
    outcome: RunOutcome<String>,
    holder: &StateHolder<String>,
) -> (Vec<ResultState<String>>, RunOutcome<String>) {
    (holder.history(), outcome)
}
