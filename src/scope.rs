//! Scope lifecycle: open, spawn, close, wait.
//!
//! A scope is opened by [`scoped`], which runs its body, then *closes*:
//! no further spawns are admitted, every remaining child is sent a
//! scope-closing interrupt, and the call blocks until all children are gone
//! before the body's outcome (or the first failure observed) is surfaced.
//!
//! # Close sequence
//!
//! ```text
//! body returns/unwinds
//!   → freeze   (admission: Open{starting: 0} → Closed, snapshot children)
//!   → signal   (scope-closing interrupt to each child, creation order)
//!   → drain    (block until the children map is empty)
//!   → reconcile (body failure ≻ first stray interrupt ≻ body value)
//! ```
//!
//! The freeze waits for `starting` to reach zero first, so a spawn that has
//! committed to creating a worker is always visible to close: between its
//! reservation and its recording, the freeze cannot proceed.

use crate::alarm::Alarm;
use crate::error::{Error, ErrorKind, Result};
use crate::signal::{self, Failure, Interrupt, Unmask, WorkerHandle};
use crate::stm::{atomically, retry, StmResult, TVar, Tx};
use crate::thread::{Thread, ThreadResult};
use crate::tracing_compat::{debug, trace};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-scope child identifier; minted monotonically, never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
struct ChildId(u64);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Whether the scope still admits spawns, and how many are mid-flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    /// Spawns are admitted; `starting` counts those that have reserved a
    /// worker but not yet recorded its identity.
    Open {
        /// Reserved-but-unrecorded spawns.
        starting: u64,
    },
    /// The scope is closing or closed; spawns fail.
    Closed,
}

/// A live entry in the children map.
#[derive(Clone)]
enum ChildSlot {
    /// The spawner recorded the child's worker.
    Running(WorkerHandle),
    /// The child finished before the spawner recorded it; retired by the
    /// spawner, never signalled, never dereferenced.
    Finished,
}

struct ScopeInner {
    children: TVar<BTreeMap<ChildId, ChildSlot>>,
    admission: TVar<Admission>,
    next_child_id: AtomicU64,
}

/// A region owning a set of concurrent children.
///
/// Obtained from [`scoped`]; clonable and freely shareable, including out of
/// the body. A scope that escapes is simply closed, and spawning on it
/// fails.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").finish_non_exhaustive()
    }
}

/// Runs `body` with a fresh scope, closes the scope, and returns the body's
/// value or re-raises the first failure observed.
///
/// The call is masked uninterruptibly; the body itself runs at the caller's
/// mask, so user code can be interrupted normally. Failures of propagating
/// children arrive at the body as interrupts; `scoped` unwraps the carrier
/// so the caller sees the child's original failure.
pub fn scoped<T>(f: impl FnOnce(&Scope) -> T) -> T {
    let scope = Scope::new();
    signal::uninterruptible_mask(|restore| {
        let body = signal::catch(|| restore.run(|| f(&scope)));
        let stray = scope.close();
        match body {
            Ok(value) => match stray {
                None => {
                    // A propagation can race past the kill walk: a child that
                    // left the running set just before the freeze may still
                    // have its failure in flight while we drained. Accept it
                    // here, at the caller's mask, instead of letting the
                    // carrier unwind the caller at some arbitrary later
                    // point.
                    match signal::catch(|| restore.run(|| ())) {
                        Ok(()) => value,
                        Err(failure) => unwrap_child_failure(failure).raise(),
                    }
                }
                Some(failure) => unwrap_child_failure(failure).raise(),
            },
            Err(failure) => unwrap_child_failure(failure).raise(),
        }
    })
}

/// Strips the child-failure carrier so callers see the original failure.
fn unwrap_child_failure(failure: Failure) -> Failure {
    match failure {
        Failure::Interrupted(interrupt) => match interrupt.into_child_failure() {
            Ok(original) => original,
            Err(interrupt) => Failure::Interrupted(interrupt),
        },
        other => other,
    }
}

impl Scope {
    fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                children: TVar::new(BTreeMap::new()),
                admission: TVar::new(Admission::Open { starting: 0 }),
                next_child_id: AtomicU64::new(0),
            }),
        }
    }

    // =========================================================================
    // Spawning
    // =========================================================================

    /// Spawns a child whose failure is propagated to the parent; the handle
    /// re-raises it on join.
    pub fn spawn<T>(&self, action: impl FnOnce() -> T + Send + 'static) -> Result<Thread<T>>
    where
        T: Clone + Send + 'static,
    {
        self.spawn_with_unmask(move |_| action())
    }

    /// [`Self::spawn`], with the action handed an [`Unmask`] token.
    pub fn spawn_with_unmask<T>(
        &self,
        action: impl FnOnce(&Unmask) -> T + Send + 'static,
    ) -> Result<Thread<T>>
    where
        T: Clone + Send + 'static,
    {
        let slot = TVar::new(None);
        let parent = signal::current();
        let completion_slot = slot.clone();
        let worker = self.spawn_raw(action, move |outcome| {
            let (stored, escalate) = match outcome {
                Ok(value) => (ThreadResult::Produced(value), None),
                Err(failure) => {
                    let escalate = (!failure.is_scope_closing()).then(|| failure.clone());
                    (ThreadResult::Failed(failure), escalate)
                }
            };
            atomically(|tx| {
                tx.write(&completion_slot, Some(stored.clone()));
                StmResult::Success(())
            });
            propagate(&parent, escalate);
        })?;
        Ok(Thread::new(worker, slot))
    }

    /// Spawns a child whose failure is captured in the handle instead of
    /// propagated, unless the failure is asynchronous, in which case the
    /// parent is interrupted as well: an interrupt delivered from outside
    /// means the child could not finish its intended work, and a silent
    /// variant must not swallow that entirely.
    pub fn spawn_catch<T>(
        &self,
        action: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Thread<std::result::Result<T, Failure>>>
    where
        T: Clone + Send + 'static,
    {
        self.spawn_catch_with_unmask(move |_| action())
    }

    /// [`Self::spawn_catch`], with the action handed an [`Unmask`] token.
    pub fn spawn_catch_with_unmask<T>(
        &self,
        action: impl FnOnce(&Unmask) -> T + Send + 'static,
    ) -> Result<Thread<std::result::Result<T, Failure>>>
    where
        T: Clone + Send + 'static,
    {
        let slot = TVar::new(None);
        let parent = signal::current();
        let completion_slot = slot.clone();
        let worker = self.spawn_raw(action, move |outcome| {
            let (stored, escalate) = match outcome {
                Ok(value) => (ThreadResult::Produced(Ok(value)), None),
                Err(failure) => {
                    let escalate = (failure.is_asynchronous() && !failure.is_scope_closing())
                        .then(|| failure.clone());
                    (ThreadResult::Produced(Err(failure)), escalate)
                }
            };
            atomically(|tx| {
                tx.write(&completion_slot, Some(stored.clone()));
                StmResult::Success(())
            });
            propagate(&parent, escalate);
        })?;
        Ok(Thread::new(worker, slot))
    }

    /// Spawns a child without a handle; failures are propagated to the
    /// parent exactly as for [`Self::spawn`].
    pub fn spawn_detached(&self, action: impl FnOnce() + Send + 'static) -> Result<()> {
        self.spawn_detached_with_unmask(move |_| action())
    }

    /// [`Self::spawn_detached`], with the action handed an [`Unmask`] token.
    pub fn spawn_detached_with_unmask(
        &self,
        action: impl FnOnce(&Unmask) + Send + 'static,
    ) -> Result<()> {
        let parent = signal::current();
        self.spawn_raw(action, move |outcome| {
            let escalate = match outcome {
                Ok(()) => None,
                Err(failure) => (!failure.is_scope_closing()).then_some(failure),
            };
            propagate(&parent, escalate);
        })?;
        Ok(())
    }

    /// The spawn core: reserve, mint, create, record.
    ///
    /// The child's mask mode is inherited from the spawner. The whole
    /// procedure runs uninterruptibly masked: an interrupt between the
    /// reservation and the recording would leak the reservation and wedge
    /// the close freeze forever.
    fn spawn_raw<T, A, C>(&self, action: A, completion: C) -> Result<WorkerHandle>
    where
        T: Send + 'static,
        A: FnOnce(&Unmask) -> T + Send + 'static,
        C: FnOnce(std::result::Result<T, Failure>) + Send + 'static,
    {
        let child_mask = signal::current_mask();
        signal::uninterruptible_mask(|_| {
            // 1. Reservation: hold the close freeze back before anything else.
            let admitted = atomically(|tx| match tx.read(&self.inner.admission) {
                Admission::Closed => StmResult::Success(false),
                Admission::Open { starting } => {
                    tx.write(
                        &self.inner.admission,
                        Admission::Open {
                            starting: starting + 1,
                        },
                    );
                    StmResult::Success(true)
                }
            });
            if !admitted {
                return Err(
                    Error::new(ErrorKind::ScopeClosed).with_context("spawn on a closed scope")
                );
            }

            // 2. Mint the child identifier.
            let child = ChildId(self.inner.next_child_id.fetch_add(1, Ordering::Relaxed));
            trace!(child = %child, "spawning child");

            // 3. Create the worker.
            let inner = Arc::clone(&self.inner);
            let created = signal::spawn_worker(child_mask, move || {
                let unmask = Unmask::token();
                let outcome = signal::catch(|| action(&unmask));
                // Interruptible, not uninterruptible: a child blocked
                // propagating its failure must remain abortable by the
                // parent's scope-closing interrupt, or close could deadlock.
                signal::mask(|_| {
                    atomically(|tx| {
                        let mut children = tx.read(&inner.children);
                        if children.remove(&child).is_none() {
                            // Finished before the spawner recorded us; leave
                            // the placeholder for the spawner to retire.
                            children.insert(child, ChildSlot::Finished);
                        }
                        tx.write(&inner.children, children);
                        StmResult::Success(())
                    });
                    completion(outcome);
                });
            });
            let worker = match created {
                Ok(worker) => worker,
                Err(io_error) => {
                    // Surrender the reservation so the close freeze can
                    // proceed; the child never existed.
                    atomically(|tx| {
                        if let Admission::Open { starting } = tx.read(&self.inner.admission) {
                            tx.write(
                                &self.inner.admission,
                                Admission::Open {
                                    starting: starting - 1,
                                },
                            );
                        }
                        StmResult::Success(())
                    });
                    return Err(Error::new(ErrorKind::WorkerSpawn).with_source(io_error));
                }
            };

            // 4. Record started: release the reservation and enter the child
            // in the running set, in one transaction.
            atomically(|tx| {
                match tx.read(&self.inner.admission) {
                    Admission::Open { starting } => tx.write(
                        &self.inner.admission,
                        Admission::Open {
                            starting: starting - 1,
                        },
                    ),
                    // The freeze waits for starting = 0, and our reservation
                    // is still counted, so the scope cannot be closed here.
                    Admission::Closed => {}
                }
                let mut children = tx.read(&self.inner.children);
                match children.get(&child) {
                    None => {
                        children.insert(child, ChildSlot::Running(worker.clone()));
                    }
                    Some(ChildSlot::Finished) => {
                        // Quick death: the child beat us to the map.
                        children.remove(&child);
                    }
                    // Only this spawner records this child.
                    Some(ChildSlot::Running(_)) => {}
                }
                tx.write(&self.inner.children, children);
                StmResult::Success(())
            });
            Ok(worker)
        })
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Freeze, signal, drain. Returns the first stray interrupt that unwound
    /// the caller out of a delivery, if any.
    fn close(&self) -> Option<Failure> {
        // Freeze: wait out mid-flight spawns, stop admitting, and snapshot
        // the children in the same transaction; nothing slips in between.
        let snapshot = atomically(|tx| match tx.read(&self.inner.admission) {
            Admission::Open { starting: 0 } | Admission::Closed => {
                tx.write(&self.inner.admission, Admission::Closed);
                StmResult::Success(tx.read(&self.inner.children))
            }
            Admission::Open { .. } => retry(),
        });
        debug!(children = snapshot.len(), "scope closing");

        // Signal, in creation order. Delivery happens fully unmasked so a
        // child blocked interrupting *us* gets through; if that unwinds us
        // out of a delivery, keep the first such failure and redeliver to
        // the same child, which may not have received its interrupt yet.
        let mut stray: Option<Failure> = None;
        // BTreeMap values iterate in ascending child id: creation order.
        for slot in snapshot.values() {
            let ChildSlot::Running(worker) = slot else {
                // A placeholder cannot survive the freeze (its spawner's
                // recording is gated by starting = 0), and is never a
                // delivery target regardless.
                continue;
            };
            trace!(worker = %worker, "terminating child");
            loop {
                let delivered = signal::catch(|| {
                    signal::unmasked(|| signal::interrupt(worker, Interrupt::scope_closing()));
                });
                match delivered {
                    Ok(()) => break,
                    Err(failure) => {
                        if stray.is_none() {
                            stray = Some(failure);
                        }
                    }
                }
            }
        }

        // Drain: children respecting the interrupt leave the map on their
        // way out. A child that masks forever blocks close forever.
        atomically(|tx| {
            if tx.read(&self.inner.children).is_empty() {
                StmResult::Success(())
            } else {
                retry()
            }
        });
        debug!(stray = stray.is_some(), "scope drained");
        stray
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Blocks until every child of the scope has finished and no spawn is
    /// mid-flight. Never fails; interruptible.
    pub fn wait(&self) {
        atomically(|tx| self.wait_tx(tx));
    }

    /// Bounded [`Self::wait`]; returns whether the scope quiesced within
    /// `timeout`.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let alarm = Alarm::after(timeout);
        atomically(|tx| {
            tx.or_else(
                |tx| match self.wait_tx(tx) {
                    StmResult::Success(()) => StmResult::Success(true),
                    StmResult::Retry => retry(),
                },
                |tx| {
                    if alarm.elapsed_tx(tx) {
                        StmResult::Success(false)
                    } else {
                        retry()
                    }
                },
            )
        })
    }

    /// Transactional form of [`Self::wait`], composable with other
    /// transactional waits.
    ///
    /// Two conditions, not one: a freshly reserved spawn whose worker is not
    /// yet recorded counts as alive.
    pub fn wait_tx(&self, tx: &mut Tx) -> StmResult<()> {
        let children_done = tx.read(&self.inner.children).is_empty();
        let spawning_done = match tx.read(&self.inner.admission) {
            Admission::Open { starting } => starting == 0,
            Admission::Closed => true,
        };
        if children_done && spawning_done {
            StmResult::Success(())
        } else {
            retry()
        }
    }
}

/// Interrupts the parent with the child-failure carrier, if there is
/// anything to escalate.
fn propagate(parent: &WorkerHandle, escalate: Option<Failure>) {
    if let Some(failure) = escalate {
        trace!(parent = %parent, failure = %failure, "propagating child failure");
        signal::interrupt(parent, Interrupt::child_failed(failure));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn empty_scope_returns_immediately() {
        scoped(|_| ());
    }

    #[test]
    fn body_value_is_returned() {
        assert_eq!(scoped(|_| 27), 27);
    }

    #[test]
    fn detached_child_runs_before_wait_returns() {
        let flag = Arc::new(AtomicBool::new(false));
        scoped(|scope| {
            let flag = Arc::clone(&flag);
            scope
                .spawn_detached(move || flag.store(true, Ordering::SeqCst))
                .expect("scope open");
            scope.wait();
        });
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn spawning_on_an_escaped_scope_fails_synchronously() {
        let escaped = scoped(Scope::clone);
        let err = escaped.spawn_detached(|| ()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScopeClosed);
    }

    #[test]
    fn children_get_distinct_workers() {
        scoped(|scope| {
            let a = scope.spawn(|| ()).expect("scope open");
            let b = scope.spawn(|| ()).expect("scope open");
            assert!(a.worker() != b.worker());
            a.join();
            b.join();
        });
    }
}
