//! Sink for emitted states.
//!
//! A [`StateHolder`] keeps the latest [`ResultState`], the full ordered
//! history, and a set of live observers. Recording and attaching an observer
//! take the same lock, so an observer sees either the replay of a state or
//! its live delivery, never both and never neither.

use std::{fmt, sync::Arc};

use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use strand_model::ResultState;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

struct StateLog<T> {
    current: ResultState<T>,
    history: Vec<ResultState<T>>,
    observers: Vec<mpsc::UnboundedSender<ResultState<T>>>,
    closed: bool,
}

/// Latest state, append-only history, and live observers.
///
/// Cloning yields another handle to the same holder.
pub struct StateHolder<T> {
    log: Arc<Mutex<StateLog<T>>>,
}

impl<T> Clone for StateHolder<T> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
        }
    }
}

impl<T> Default for StateHolder<T> {
    fn default() -> Self {
        Self {
            log: Arc::new(Mutex::new(StateLog {
                current: ResultState::Loading,
                history: Vec::new(),
                observers: Vec::new(),
                closed: false,
            })),
        }
    }
}

impl<T> fmt::Debug for StateHolder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log = self.log.lock();
        f.debug_struct("StateHolder")
            .field("history_len", &log.history.len())
            .field("observers", &log.observers.len())
            .field("closed", &log.closed)
            .finish()
    }
}

impl<T: Clone + Send + 'static> StateHolder<T> {
    /// Holder whose current state is `Loading`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `state`, make it current, and deliver it to every observer.
    ///
    /// Returns `false` once the holder is closed.
    pub fn record(&self, state: ResultState<T>) -> bool {
        let mut log = self.log.lock();
        if log.closed {
            debug!(target: "strand::state", "holder closed; dropping state");
            return false;
        }

        log.observers
            .retain(|observer| observer.send(state.clone()).is_ok());
        trace!(
            target: "strand::state",
            observers = log.observers.len(),
            terminal = state.is_terminal(),
            "recording state"
        );
        log.history.push(state.clone());
        log.current = state;
        true
    }

    /// Latest state, or `Loading` if nothing was recorded yet.
    pub fn current(&self) -> ResultState<T> {
        self.log.lock().current.clone()
    }

    /// Every recorded state, oldest first.
    pub fn history(&self) -> Vec<ResultState<T>> {
        self.log.lock().history.clone()
    }

    /// Stream of the current state followed by every state recorded after
    /// attachment. Ends when the holder is closed.
    pub fn observe(&self) -> BoxStream<'static, ResultState<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut log = self.log.lock();
        // The receiver is alive, so the replay cannot fail.
        let _ = tx.send(log.current.clone());
        if !log.closed {
            log.observers.push(tx);
        }
        UnboundedReceiverStream::new(rx).boxed()
    }

    /// Number of observers still attached.
    pub fn observers(&self) -> usize {
        let mut log = self.log.lock();
        log.observers.retain(|observer| !observer.is_closed());
        log.observers.len()
    }

    /// Stop accepting states and end every observer stream.
    pub fn close(&self) {
        let mut log = self.log.lock();
        if !log.closed {
            log.closed = true;
            log.observers.clear();
            trace!(target: "strand::state", "holder closed");
        }
    }

    /// Whether [`StateHolder::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use strand_model::ErrorKind;

    use super::*;

    #[test]
    fn starts_loading_with_empty_history() {
        let holder = StateHolder::<u8>::new();
        assert_eq!(holder.current(), ResultState::Loading);
        assert!(holder.history().is_empty());
    }

    #[tokio::test]
    async fn observers_get_replay_then_live_states() {
        let holder = StateHolder::new();
        holder.record(ResultState::Loading);
        holder.record(ResultState::local("cached"));

        let mut early = holder.observe();
        holder.record(ResultState::remote("fresh"));
        let mut late = holder.observe();
        holder.close();

        let early_seen: Vec<_> = (&mut early).collect().await;
        assert_eq!(
            early_seen,
            vec![ResultState::local("cached"), ResultState::remote("fresh")]
        );
        assert_eq!(late.next().await, Some(ResultState::remote("fresh")));
        assert_eq!(late.next().await, None);
    }

    #[tokio::test]
    async fn closed_holder_ignores_records() {
        let holder = StateHolder::new();
        holder.record(ResultState::error(ErrorKind::Permanent, "404", false));
        holder.close();

        assert!(!holder.record(ResultState::remote(1)));
        assert_eq!(holder.history().len(), 1);

        let replay: Vec<_> = holder.observe().collect().await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].error_kind(), Some(ErrorKind::Permanent));
    }

    #[tokio::test]
    async fn dropped_observers_are_pruned() {
        let holder = StateHolder::<u8>::new();
        let first = holder.observe();
        let _second = holder.observe();
        assert_eq!(holder.observers(), 2);

        drop(first);
        assert_eq!(holder.observers(), 1);
    }
}
