//! Named execution contexts.
//!
//! Every component that schedules work receives a [`DispatcherProvider`]
//! explicitly; nothing in the core reaches for an ambient runtime on its own.
//! Tests build the provider from a current-thread runtime so scheduling is
//! deterministic.

use std::{fmt, future::Future, sync::Arc};

use tokio::{
    runtime::Handle,
    sync::Semaphore,
    task::JoinHandle,
};
use tracing::trace;

use crate::{config::DispatchConfig, error::Result};

/// The three execution contexts the core schedules onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextName {
    /// Blocking-prone or latency-bound reads (local cache, remote fetch).
    Io,
    /// Compute-heavy transformations.
    Cpu,
    /// Lightweight drivers that move states between components.
    Coordination,
}

impl ContextName {
    /// Every context, in lookup order.
    pub const ALL: [ContextName; 3] =
        [ContextName::Io, ContextName::Cpu, ContextName::Coordination];

    /// Lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextName::Io => "io",
            ContextName::Cpu => "cpu",
            ContextName::Coordination => "coordination",
        }
    }
}

impl fmt::Display for ContextName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime handle plus an optional concurrency budget.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    name: ContextName,
    handle: Handle,
    permits: Option<Arc<Semaphore>>,
    limit: Option<usize>,
}

impl ExecutionContext {
    /// `limit == 0` leaves the context unbounded.
    pub fn new(name: ContextName, handle: Handle, limit: usize) -> Self {
        let limit = (limit > 0).then_some(limit);
        Self {
            name,
            handle,
            permits: limit.map(|n| Arc::new(Semaphore::new(n))),
            limit,
        }
    }

    /// Context without a concurrency budget.
    pub fn unbounded(name: ContextName, handle: Handle) -> Self {
        Self::new(name, handle, 0)
    }

    /// Which context this is.
    pub fn name(&self) -> ContextName {
        self.name
    }

    /// Runtime the context spawns onto.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Configured budget, `None` when unbounded.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Permits currently free, or `None` for unbounded contexts.
    pub fn available_permits(&self) -> Option<usize> {
        self.permits.as_ref().map(|permits| permits.available_permits())
    }

    /// Run `future` once a permit is available. Does not spawn; callers that
    /// need cancellation race the returned future themselves so waiting for a
    /// permit stays interruptible.
    pub async fn run<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        let _permit = match &self.permits {
            // The semaphore is never closed.
            Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
            None => None,
        };
        trace!(
            target: "strand::dispatch",
            context = %self.name,
            "running work item"
        );
        future.await
    }

    /// Spawn `future` onto this context's runtime, respecting its budget.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let context = self.clone();
        self.handle.spawn(async move { context.run(future).await })
    }
}

/// Supplies an [`ExecutionContext`] for every [`ContextName`].
///
/// Because the provider always carries all three contexts, a lookup cannot
/// miss; the set of names is closed.
#[derive(Clone, Debug)]
pub struct DispatcherProvider {
    io: ExecutionContext,
    cpu: ExecutionContext,
    coordination: ExecutionContext,
}

impl DispatcherProvider {
    /// Contexts on `handle`, budgeted per `config`.
    pub fn new(handle: Handle, config: &DispatchConfig) -> Self {
        Self {
            io: ExecutionContext::new(
                ContextName::Io,
                handle.clone(),
                config.io_parallelism,
            ),
            cpu: ExecutionContext::new(
                ContextName::Cpu,
                handle.clone(),
                config.cpu_parallelism,
            ),
            coordination: ExecutionContext::new(
                ContextName::Coordination,
                handle,
                config.coordination_parallelism,
            ),
        }
    }

    /// Unbounded contexts on the runtime the caller is running in.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime. Use
    /// [`DispatcherProvider::try_current`] to handle that case.
    pub fn current() -> Self {
        Self::builder(Handle::current()).build()
    }

    /// Like [`DispatcherProvider::current`], but fails outside a runtime.
    pub fn try_current() -> Result<Self> {
        Ok(Self::builder(Handle::try_current()?).build())
    }

    /// Start a builder on `handle`.
    pub fn builder(handle: Handle) -> DispatcherProviderBuilder {
        DispatcherProviderBuilder::new(handle)
    }

    /// Context registered under `name`.
    pub fn context(&self, name: ContextName) -> &ExecutionContext {
        match name {
            ContextName::Io => &self.io,
            ContextName::Cpu => &self.cpu,
            ContextName::Coordination => &self.coordination,
        }
    }

    /// The I/O context.
    pub fn io(&self) -> &ExecutionContext {
        &self.io
    }

    /// The CPU context.
    pub fn cpu(&self) -> &ExecutionContext {
        &self.cpu
    }

    /// The coordination context.
    pub fn coordination(&self) -> &ExecutionContext {
        &self.coordination
    }
}

/// Helper for constructing a provider while substituting single contexts.
#[derive(Debug)]
pub struct DispatcherProviderBuilder {
    handle: Handle,
    io: Option<ExecutionContext>,
    cpu: Option<ExecutionContext>,
    coordination: Option<ExecutionContext>,
}

impl DispatcherProviderBuilder {
    /// Builder with no contexts supplied yet.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            io: None,
            cpu: None,
            coordination: None,
        }
    }

    /// Replace the context registered under `context.name()`.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        match context.name() {
            ContextName::Io => self.io = Some(context),
            ContextName::Cpu => self.cpu = Some(context),
            ContextName::Coordination => self.coordination = Some(context),
        }
        self
    }

    /// Replace all three contexts with ones budgeted per `config`.
    pub fn with_limits(self, config: &DispatchConfig) -> Self {
        let handle = self.handle.clone();
        self.with_context(ExecutionContext::new(
            ContextName::Io,
            handle.clone(),
            config.io_parallelism,
        ))
        .with_context(ExecutionContext::new(
            ContextName::Cpu,
            handle.clone(),
            config.cpu_parallelism,
        ))
        .with_context(ExecutionContext::new(
            ContextName::Coordination,
            handle,
            config.coordination_parallelism,
        ))
    }

    /// Contexts that were not supplied are unbounded on the builder's handle.
    pub fn build(self) -> DispatcherProvider {
        let handle = self.handle;
        DispatcherProvider {
            io: self.io.unwrap_or_else(|| {
                ExecutionContext::unbounded(ContextName::Io, handle.clone())
            }),
            cpu: self.cpu.unwrap_or_else(|| {
                ExecutionContext::unbounded(ContextName::Cpu, handle.clone())
            }),
            coordination: self.coordination.unwrap_or_else(|| {
                ExecutionContext::unbounded(ContextName::Coordination, handle)
            }),
        }
    }
}
