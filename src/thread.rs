//! Child handles.
//!
//! A [`Thread`] pairs a child's worker identity with the single-assignment
//! slot its completion hook fills. The handle may outlive the scope that
//! spawned the child: it owns the slot, so joining after the scope closed
//! returns the stored outcome without blocking.

use crate::alarm::Alarm;
use crate::signal::{self, Failure, WorkerHandle};
use crate::stm::{atomically, retry, StmResult, TVar, Tx};
use std::fmt;
use std::time::Duration;

/// What a child left behind in its slot.
#[derive(Clone)]
pub(crate) enum ThreadResult<T> {
    /// The action produced a value.
    Produced(T),
    /// The action failed; joining re-raises the failure. Only the
    /// propagating spawn variants store this.
    Failed(Failure),
}

/// A handle to a child of a scope.
///
/// Handles compare, order, and hash by the child's worker identity. The
/// slot is written exactly once; any number of joins read it, which is why
/// the value type must be [`Clone`].
pub struct Thread<T> {
    worker: WorkerHandle,
    slot: TVar<Option<ThreadResult<T>>>,
}

impl<T: Clone + Send + 'static> Thread<T> {
    pub(crate) const fn new(worker: WorkerHandle, slot: TVar<Option<ThreadResult<T>>>) -> Self {
        Self { worker, slot }
    }

    /// Returns the child's worker identity.
    #[must_use]
    pub const fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// Blocks until the child has terminated and returns its outcome,
    /// re-raising the failure of a propagating child.
    ///
    /// One stuck-wait wakeup is tolerated: when both sides of a
    /// transactional wait are reported stuck, the slot has in fact been
    /// written, so a single rerun succeeds. A second wakeup propagates;
    /// anything else would mask a genuine deadlock.
    pub fn join(&self) -> T {
        match signal::catch(|| self.join_blocking()) {
            Ok(value) => value,
            Err(Failure::Interrupted(i)) if i.is_stuck_wait() => self.join_blocking(),
            Err(failure) => failure.raise(),
        }
    }

    /// Like [`Self::join`] with a deadline; `None` when the child is still
    /// running after `timeout`.
    #[must_use]
    pub fn join_for(&self, timeout: Duration) -> Option<T> {
        let alarm = Alarm::after(timeout);
        let result = atomically(|tx| {
            tx.or_else(
                |tx| match tx.read(&self.slot) {
                    Some(result) => StmResult::Success(Some(result)),
                    None => retry(),
                },
                |tx| {
                    if alarm.elapsed_tx(tx) {
                        StmResult::Success(None)
                    } else {
                        retry()
                    }
                },
            )
        });
        result.map(Self::decode)
    }

    /// Transactional form of [`Self::join`], composable with other
    /// transactional waits. Re-raises a propagating child's failure out of
    /// the transaction (nothing commits).
    pub fn join_tx(&self, tx: &mut Tx) -> StmResult<T> {
        match tx.read(&self.slot) {
            None => retry(),
            Some(result) => StmResult::Success(Self::decode(result)),
        }
    }

    fn join_blocking(&self) -> T {
        let result = atomically(|tx| match tx.read(&self.slot) {
            Some(result) => StmResult::Success(result),
            None => retry(),
        });
        Self::decode(result)
    }

    fn decode(result: ThreadResult<T>) -> T {
        match result {
            ThreadResult::Produced(value) => value,
            ThreadResult::Failed(failure) => failure.raise(),
        }
    }
}

impl<T> Clone for Thread<T> {
    fn clone(&self) -> Self {
        Self {
            worker: self.worker.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<T> PartialEq for Thread<T> {
    fn eq(&self, other: &Self) -> bool {
        self.worker == other.worker
    }
}

impl<T> Eq for Thread<T> {}

impl<T> PartialOrd for Thread<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Thread<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.worker.cmp(&other.worker)
    }
}

impl<T> std::hash::Hash for Thread<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.worker.hash(state);
    }
}

impl<T> fmt::Debug for Thread<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::PanicPayload;

    fn prefilled<T: Clone + Send + 'static>(result: ThreadResult<T>) -> Thread<T> {
        let slot = TVar::new(Some(result));
        Thread::new(signal::current(), slot)
    }

    #[test]
    fn join_returns_a_produced_value() {
        let thread = prefilled(ThreadResult::Produced(41));
        assert_eq!(thread.join(), 41);
    }

    #[test]
    fn join_is_repeatable() {
        let thread = prefilled(ThreadResult::Produced(String::from("twice")));
        assert_eq!(thread.join(), "twice");
        assert_eq!(thread.join(), "twice");
    }

    #[test]
    fn join_reraises_a_stored_failure() {
        let thread: Thread<()> =
            prefilled(ThreadResult::Failed(Failure::Panic(PanicPayload::new("inner"))));
        let failure = signal::catch(|| thread.join()).unwrap_err();
        match failure {
            Failure::Panic(payload) => assert_eq!(payload.message(), "inner"),
            Failure::Interrupted(_) => panic!("expected the stored panic back"),
        }
    }

    #[test]
    fn join_for_times_out_on_an_empty_slot() {
        let slot: TVar<Option<ThreadResult<u8>>> = TVar::new(None);
        let thread = Thread::new(signal::current(), slot);
        assert_eq!(thread.join_for(Duration::from_millis(20)), None);
    }

    #[test]
    fn handles_compare_by_worker() {
        let a = prefilled(ThreadResult::Produced(1));
        let b = a.clone();
        assert_eq!(a, b);
    }
}
