//! Transactional variables.
//!
//! All shared scope state in this crate is coordinated through [`TVar`]s and
//! [`atomically`]: a transaction observes a consistent snapshot across any
//! number of variables, can block with [`retry`] until another commit
//! changes something, and composes alternatives with [`Tx::or_else`].
//!
//! The implementation is deliberately coarse: one global commit lock
//! serializes transactions, and a retrying transaction parks its worker
//! until any later commit. That is exactly enough for the linearizability
//! the scope protocol needs; it is not a scalable STM.
//!
//! # Rules
//!
//! - Transactions must not nest; an `atomically` inside `atomically`
//!   deadlocks on the commit lock.
//! - The transaction closure may run any number of times; it must not have
//!   effects outside its [`Tx`].

use crate::signal::{self, PollSite, WorkerHandle};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

static NEXT_TVAR_ID: AtomicU64 = AtomicU64::new(1);

fn commit_lock() -> &'static Mutex<Vec<WorkerHandle>> {
    static LOCK: OnceLock<Mutex<Vec<WorkerHandle>>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(Vec::new()))
}

struct TVarCell<T> {
    id: u64,
    value: Mutex<T>,
}

/// A transactional variable.
///
/// Clones share the same cell. Reads and writes go through a [`Tx`] inside
/// [`atomically`].
pub struct TVar<T> {
    cell: Arc<TVarCell<T>>,
}

impl<T: Clone + Send + 'static> TVar<T> {
    /// Creates a new variable holding `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(TVarCell {
                id: NEXT_TVAR_ID.fetch_add(1, Ordering::Relaxed),
                value: Mutex::new(value),
            }),
        }
    }
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> std::fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TVar({})", self.cell.id)
    }
}

/// The verdict of one transaction attempt.
#[derive(Debug)]
pub enum StmResult<T> {
    /// The transaction is done and its writes should commit.
    Success(T),
    /// The transaction cannot proceed; block until another commit, then
    /// re-run it.
    Retry,
}

/// Shorthand for [`StmResult::Retry`].
#[must_use]
pub const fn retry<T>() -> StmResult<T> {
    StmResult::Retry
}

struct LogEntry {
    var: u64,
    value: Box<dyn Any>,
    store: Box<dyn FnOnce(Box<dyn Any>)>,
}

/// An in-flight transaction: a write log with read-your-writes semantics.
#[derive(Default)]
pub struct Tx {
    log: Vec<LogEntry>,
}

impl Tx {
    /// Reads a variable, seeing earlier writes from this transaction.
    #[must_use]
    pub fn read<T: Clone + Send + 'static>(&self, var: &TVar<T>) -> T {
        for entry in self.log.iter().rev() {
            if entry.var == var.cell.id {
                return entry
                    .value
                    .downcast_ref::<T>()
                    .expect("write log entry type matches its variable")
                    .clone();
            }
        }
        var.cell.value.lock().clone()
    }

    /// Writes a variable; visible to later reads in this transaction,
    /// applied to the cell only on commit.
    pub fn write<T: Clone + Send + 'static>(&mut self, var: &TVar<T>, value: T) {
        let cell = Arc::clone(&var.cell);
        self.log.push(LogEntry {
            var: cell.id,
            value: Box::new(value),
            store: Box::new(move |boxed| {
                let value = boxed
                    .downcast::<T>()
                    .expect("write log entry type matches its variable");
                *cell.value.lock() = *value;
            }),
        });
    }

    /// Tries `first`; if it retries, rolls its writes back and tries
    /// `second`. The whole choice retries only if both do.
    pub fn or_else<T>(
        &mut self,
        first: impl FnOnce(&mut Self) -> StmResult<T>,
        second: impl FnOnce(&mut Self) -> StmResult<T>,
    ) -> StmResult<T> {
        let savepoint = self.log.len();
        match first(self) {
            StmResult::Retry => {
                self.log.truncate(savepoint);
                second(self)
            }
            done => done,
        }
    }

    /// Applies the write log. Returns whether anything was written.
    fn commit(self) -> bool {
        let wrote = !self.log.is_empty();
        for entry in self.log {
            (entry.store)(entry.value);
        }
        wrote
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx").field("writes", &self.log.len()).finish()
    }
}

/// Runs `f` as one atomic transaction, blocking on [`retry`] until another
/// commit changes something.
///
/// This is an interruptible blocking point while the transaction is parked
/// in a retry.
pub fn atomically<T>(mut f: impl FnMut(&mut Tx) -> StmResult<T>) -> T {
    signal::poll_interrupts(PollSite::Checkpoint);
    let me = signal::current();
    loop {
        let mut waiters = commit_lock().lock();
        let mut tx = Tx::default();
        match f(&mut tx) {
            StmResult::Success(value) => {
                if tx.commit() {
                    let sleepers = std::mem::take(&mut *waiters);
                    drop(waiters);
                    for sleeper in &sleepers {
                        sleeper.notify();
                    }
                }
                return value;
            }
            StmResult::Retry => {
                // Snapshot the wake sequence before releasing the commit
                // lock: a commit that lands after the release finds us
                // registered and moves the sequence past the snapshot.
                let seen = me.wake_seq();
                waiters.push(me.clone());
                drop(waiters);
                me.park(seen);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn read_sees_initial_value() {
        let var = TVar::new(7);
        let got = atomically(|tx| StmResult::Success(tx.read(&var)));
        assert_eq!(got, 7);
    }

    #[test]
    fn writes_apply_on_commit_only() {
        let var = TVar::new(0);
        atomically(|tx| {
            tx.write(&var, 1);
            assert_eq!(tx.read(&var), 1, "read-your-writes");
            StmResult::Success(())
        });
        let got = atomically(|tx| StmResult::Success(tx.read(&var)));
        assert_eq!(got, 1);
    }

    #[test]
    fn or_else_rolls_back_the_first_branch() {
        let var = TVar::new(10);
        let picked = atomically(|tx| {
            tx.or_else(
                |tx| {
                    tx.write(&var, 99);
                    retry()
                },
                |tx| StmResult::Success(tx.read(&var)),
            )
        });
        assert_eq!(picked, 10, "the aborted branch's write must not be visible");
    }

    #[test]
    fn retry_blocks_until_another_commit() {
        let flag = TVar::new(false);
        let setter = {
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                atomically(|tx| {
                    tx.write(&flag, true);
                    StmResult::Success(())
                });
            })
        };
        atomically(|tx| {
            if tx.read(&flag) {
                StmResult::Success(())
            } else {
                retry()
            }
        });
        setter.join().unwrap();
    }

    #[test]
    fn increments_from_many_threads_are_not_lost() {
        let counter = TVar::new(0u32);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        atomically(|tx| {
                            let n = tx.read(&counter);
                            tx.write(&counter, n + 1);
                            StmResult::Success(())
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let total = atomically(|tx| StmResult::Success(tx.read(&counter)));
        assert_eq!(total, 800);
    }
}
