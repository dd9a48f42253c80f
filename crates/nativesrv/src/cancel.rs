//! Query cancellation and callback state.
//!
//! The cancellation status and the read-task waiters live behind a single
//! lock, separate from the socket write lock. Pipeline tasks may lower the
//! status or register a waiter while the read loop does the same.

use std::collections::VecDeque;
use std::pin::pin;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tracing::debug;

use crate::parallel_read::types::ParallelReadResponse;

/// How far a query has been cancelled. Ordered from most to least cancelled,
/// and only ever moves towards [`CancellationStatus::FullyCancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CancellationStatus {
    /// Stop everything, no more results.
    FullyCancelled,
    /// Stop reading client input, but finish and send what was already read.
    ReadCancelled,
    NotCancelled,
}

#[derive(Debug)]
struct CallbackState {
    cancellation: CancellationStatus,
    /// Pulls waiting for a MergeTreeReadTaskResponse, oldest first.
    parallel_waiters: VecDeque<oneshot::Sender<ParallelReadResponse>>,
    /// Pulls waiting for a ReadTaskResponse, oldest first.
    task_waiters: VecDeque<oneshot::Sender<String>>,
}

/// Callback state of a single query, shared between the connection and the
/// pipeline.
#[derive(Debug)]
pub struct QueryCallbacks {
    state: Mutex<CallbackState>,
    changed: Notify,
}

impl Default for QueryCallbacks {
    fn default() -> Self {
        QueryCallbacks {
            state: Mutex::new(CallbackState {
                cancellation: CancellationStatus::NotCancelled,
                parallel_waiters: VecDeque::new(),
                task_waiters: VecDeque::new(),
            }),
            changed: Notify::new(),
        }
    }
}

impl QueryCallbacks {
    pub fn status(&self) -> CancellationStatus {
        self.state.lock().cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() != CancellationStatus::NotCancelled
    }

    pub fn is_fully_cancelled(&self) -> bool {
        self.status() == CancellationStatus::FullyCancelled
    }

    /// Lower the status to `status`. Never raises it.
    ///
    /// Returns true if the status changed. Full cancellation drops every
    /// pending read-task waiter.
    pub fn lower_to(&self, status: CancellationStatus) -> bool {
        let mut state = self.state.lock();
        if status >= state.cancellation {
            return false;
        }
        state.cancellation = status;
        if status == CancellationStatus::FullyCancelled {
            state.parallel_waiters.clear();
            state.task_waiters.clear();
        }
        drop(state);
        self.changed.notify_waiters();
        true
    }

    /// Handle a Cancel packet from the client.
    ///
    /// With `partial_result_on_first_cancel` the first cancel only stops
    /// reading so the rows read so far still get returned. Any further
    /// cancel stops the query.
    pub fn decrease_cancellation_status(
        &self,
        partial_result_on_first_cancel: bool,
    ) -> CancellationStatus {
        let mut state = self.state.lock();
        let target = if partial_result_on_first_cancel
            && state.cancellation == CancellationStatus::NotCancelled
        {
            CancellationStatus::ReadCancelled
        } else {
            CancellationStatus::FullyCancelled
        };
        if target < state.cancellation {
            state.cancellation = target;
            if target == CancellationStatus::FullyCancelled {
                state.parallel_waiters.clear();
                state.task_waiters.clear();
            }
            drop(state);
            self.changed.notify_waiters();
            debug!(status = ?target, "query cancelled by client");
            return target;
        }
        state.cancellation
    }

    /// Resolves once the status is at or below `status`.
    pub async fn reached(&self, status: CancellationStatus) {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();
            if self.status() <= status {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once client input should no longer be read.
    pub async fn read_cancelled(&self) {
        self.reached(CancellationStatus::ReadCancelled).await
    }

    pub async fn fully_cancelled(&self) {
        self.reached(CancellationStatus::FullyCancelled).await
    }

    /// Register a waiter for the next MergeTreeReadTaskResponse, unless the
    /// query is fully cancelled.
    pub(crate) fn wait_parallel_response(&self) -> Option<oneshot::Receiver<ParallelReadResponse>> {
        let mut state = self.state.lock();
        if state.cancellation == CancellationStatus::FullyCancelled {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        state.parallel_waiters.push_back(tx);
        Some(rx)
    }

    /// Register a waiter for the next ReadTaskResponse, unless the query is
    /// fully cancelled.
    pub(crate) fn wait_task_response(&self) -> Option<oneshot::Receiver<String>> {
        let mut state = self.state.lock();
        if state.cancellation == CancellationStatus::FullyCancelled {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        state.task_waiters.push_back(tx);
        Some(rx)
    }

    /// Whether a read-task response from the peer is currently expected.
    pub fn awaiting_parallel_response(&self) -> bool {
        !self.state.lock().parallel_waiters.is_empty()
    }

    pub fn awaiting_task_response(&self) -> bool {
        !self.state.lock().task_waiters.is_empty()
    }

    /// Hand a response to the oldest waiter. Returns false if nobody was
    /// waiting.
    pub(crate) fn deliver_parallel_response(&self, response: ParallelReadResponse) -> bool {
        let waiter = self.state.lock().parallel_waiters.pop_front();
        match waiter {
            // A dropped receiver means the pull went away, nothing to do.
            Some(tx) => {
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }

    pub(crate) fn deliver_task_response(&self, response: String) -> bool {
        let waiter = self.state.lock().task_waiters.pop_front();
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_cancel_policy() {
        let c = QueryCallbacks::default();
        assert_eq!(
            CancellationStatus::ReadCancelled,
            c.decrease_cancellation_status(true)
        );
        assert_eq!(
            CancellationStatus::FullyCancelled,
            c.decrease_cancellation_status(true)
        );

        let c = QueryCallbacks::default();
        assert_eq!(
            CancellationStatus::FullyCancelled,
            c.decrease_cancellation_status(false)
        );
    }

    #[test]
    fn full_cancel_drops_waiters() {
        let c = QueryCallbacks::default();
        let mut rx = c.wait_task_response().unwrap();
        assert!(c.awaiting_task_response());

        c.lower_to(CancellationStatus::ReadCancelled);
        assert!(c.awaiting_task_response());

        c.lower_to(CancellationStatus::FullyCancelled);
        assert!(!c.awaiting_task_response());
        assert!(rx.try_recv().is_err());
        assert!(c.wait_task_response().is_none());
        assert!(!c.deliver_task_response("late".to_string()));
    }

    #[test]
    fn responses_go_to_oldest_waiter() {
        let c = QueryCallbacks::default();
        let mut first = c.wait_task_response().unwrap();
        let mut second = c.wait_task_response().unwrap();
        assert!(c.deliver_task_response("a".to_string()));
        assert!(c.deliver_task_response("b".to_string()));
        assert_eq!("a", first.try_recv().unwrap());
        assert_eq!("b", second.try_recv().unwrap());
    }

    #[tokio::test]
    async fn waiters_are_woken() {
        let c = Arc::new(QueryCallbacks::default());
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.fully_cancelled().await })
        };

        c.lower_to(CancellationStatus::ReadCancelled);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        c.lower_to(CancellationStatus::FullyCancelled);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    fn status_strategy() -> impl Strategy<Value = CancellationStatus> {
        prop_oneof![
            Just(CancellationStatus::FullyCancelled),
            Just(CancellationStatus::ReadCancelled),
            Just(CancellationStatus::NotCancelled),
        ]
    }

    proptest! {
        #[test]
        fn status_only_decreases(updates in proptest::collection::vec(status_strategy(), 0..20)) {
            let c = QueryCallbacks::default();
            let mut prev = c.status();
            for update in &updates {
                c.lower_to(*update);
                let now = c.status();
                prop_assert!(now <= prev);
                prev = now;
            }
            let expected = updates.iter().copied().min().unwrap_or(CancellationStatus::NotCancelled);
            prop_assert_eq!(expected, c.status());
        }

        #[test]
        fn concurrent_lowering_ends_at_minimum(
            a in proptest::collection::vec(status_strategy(), 0..16),
            b in proptest::collection::vec(status_strategy(), 0..16),
        ) {
            let c = Arc::new(QueryCallbacks::default());
            let spawn = |updates: Vec<CancellationStatus>| {
                let c = c.clone();
                std::thread::spawn(move || {
                    for update in updates {
                        c.lower_to(update);
                    }
                })
            };
            let t1 = spawn(a.clone());
            let t2 = spawn(b.clone());
            t1.join().unwrap();
            t2.join().unwrap();

            let expected = a
                .iter()
                .chain(b.iter())
                .copied()
                .min()
                .unwrap_or(CancellationStatus::NotCancelled);
            prop_assert_eq!(expected, c.status());
        }
    }
}
