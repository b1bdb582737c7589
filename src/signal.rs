//! Worker identity, asynchronous interrupts, and masking.
//!
//! Rust's standard concurrency has no targeted asynchronous interruption, so
//! this module models one: every participating thread is a *worker* with a
//! pending-interrupt queue, and the queue is consulted at every blocking
//! operation in this crate. An accepted interrupt aborts the worker's current
//! computation by unwinding.
//!
//! # Masking
//!
//! A worker is always in one of three mask modes:
//!
//! - [`Mask::Unmasked`]: pending interrupts are raised at any poll point
//! - [`Mask::Interruptible`]: raised only while blocked in an interruptible
//!   operation
//! - [`Mask::Uninterruptible`]: never raised
//!
//! Mask mode is inherited by workers spawned from [`crate::scope`].
//!
//! # Delivery
//!
//! [`interrupt`] blocks until the target worker accepts the interrupt or
//! terminates. A worker that keeps interrupts masked therefore blocks its
//! interrupters; the scope close sequence relies on exactly this to sequence
//! itself against failing children.

use crate::tracing_compat::trace;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<WorkerHandle>> = const { RefCell::new(None) };
    static MASK: Cell<Mask> = const { Cell::new(Mask::Unmasked) };
}

// ---------------------------------------------------------------------------
// Masking
// ---------------------------------------------------------------------------

/// The mask mode of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mask {
    /// Interrupts are raised at any poll point.
    Unmasked,
    /// Interrupts are raised only while blocked in an interruptible
    /// operation.
    Interruptible,
    /// Interrupts are never raised.
    Uninterruptible,
}

/// Where a pending-interrupt poll happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollSite {
    /// A non-blocking checkpoint (entry to an operation, unmask boundary).
    Checkpoint,
    /// Blocked inside an interruptible operation.
    Blocking,
}

impl Mask {
    pub(crate) const fn admits(self, site: PollSite) -> bool {
        match self {
            Self::Unmasked => true,
            Self::Interruptible => matches!(site, PollSite::Blocking),
            Self::Uninterruptible => false,
        }
    }
}

/// Returns the current worker's mask mode.
#[must_use]
pub fn current_mask() -> Mask {
    MASK.with(Cell::get)
}

/// Restores the mask saved when a masked region was entered; obtained from
/// [`mask`] or [`uninterruptible_mask`].
#[derive(Debug)]
pub struct Restore {
    saved: Mask,
}

impl Restore {
    /// Runs `f` at the mask mode that was in effect outside the enclosing
    /// masked region, then reinstates the region's mask.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = MaskGuard::set(self.saved);
        poll_interrupts(PollSite::Checkpoint);
        f()
    }
}

/// A full unmask token handed to `*_with_unmask` child actions.
#[derive(Debug)]
pub struct Unmask(());

impl Unmask {
    pub(crate) const fn token() -> Self {
        Self(())
    }

    /// Runs `f` fully unmasked, then reinstates the previous mask.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        unmasked(f)
    }
}

struct MaskGuard {
    prev: Mask,
}

impl MaskGuard {
    fn set(mode: Mask) -> Self {
        let prev = MASK.with(|m| m.replace(mode));
        Self { prev }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        // No polling here: this runs during unwinds as well, and raising a
        // second interrupt out of a Drop would abort the process.
        MASK.with(|m| m.set(self.prev));
    }
}

/// Runs `f` under interruptible masking. Pending interrupts are deferred
/// except while `f` is blocked in an interruptible operation; the [`Restore`]
/// argument reinstates the caller's mask for a sub-region.
pub fn mask<T>(f: impl FnOnce(&Restore) -> T) -> T {
    let saved = current_mask();
    let _guard = MaskGuard::set(Mask::Interruptible);
    f(&Restore { saved })
}

/// Runs `f` under uninterruptible masking. Pending interrupts are deferred
/// even across blocking operations.
pub fn uninterruptible_mask<T>(f: impl FnOnce(&Restore) -> T) -> T {
    let saved = current_mask();
    let _guard = MaskGuard::set(Mask::Uninterruptible);
    f(&Restore { saved })
}

/// Runs `f` fully unmasked regardless of nesting depth.
pub(crate) fn unmasked<T>(f: impl FnOnce() -> T) -> T {
    let _guard = MaskGuard::set(Mask::Unmasked);
    poll_interrupts(PollSite::Checkpoint);
    f()
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

struct Inbox {
    pending: VecDeque<PendingInterrupt>,
    /// Bumped on every wakeup-worthy event; parking compares against a
    /// snapshot to avoid lost wakeups.
    wake_seq: u64,
    terminated: bool,
}

struct PendingInterrupt {
    interrupt: Interrupt,
    receipt: Arc<Receipt>,
}

/// Shared between an interrupter and its target: flipped when the target
/// accepts (or dies), unblocking the interrupter.
struct Receipt {
    delivered: AtomicBool,
    interrupter: WorkerHandle,
}

impl Receipt {
    fn accept(&self) {
        self.delivered.store(true, Ordering::Release);
        self.interrupter.notify();
    }
}

struct WorkerShared {
    id: u64,
    inbox: Mutex<Inbox>,
    cond: Condvar,
}

/// The identity of a worker thread.
///
/// Handles compare, order, and hash by worker identity. Holding a handle
/// does not keep the worker alive; it is an address for [`interrupt`].
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    fn fresh() -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
                inbox: Mutex::new(Inbox {
                    pending: VecDeque::new(),
                    wake_seq: 0,
                    terminated: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Returns the worker's numeric identity.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Snapshots the wake sequence; pass to [`Self::park`] to sleep until
    /// the next wakeup-worthy event.
    pub(crate) fn wake_seq(&self) -> u64 {
        self.shared.inbox.lock().wake_seq
    }

    /// Wakes the worker if it is parked.
    pub(crate) fn notify(&self) {
        let mut inbox = self.shared.inbox.lock();
        inbox.wake_seq = inbox.wake_seq.wrapping_add(1);
        self.shared.cond.notify_all();
    }

    /// Blocks the calling thread (which must be this worker) until the wake
    /// sequence moves past `seen`. This is an interruptible blocking point:
    /// pending interrupts are raised here when the mask admits them.
    pub(crate) fn park(&self, seen: u64) {
        let mask = current_mask();
        loop {
            let deliverable = {
                let mut inbox = self.shared.inbox.lock();
                if mask.admits(PollSite::Blocking) && !inbox.pending.is_empty() {
                    inbox.pending.pop_front()
                } else if inbox.wake_seq == seen {
                    self.shared.cond.wait(&mut inbox);
                    None
                } else {
                    return;
                }
            };
            if let Some(pending) = deliverable {
                pending.receipt.accept();
                raise(pending.interrupt);
            }
        }
    }

    fn terminate(&self) {
        let drained: Vec<PendingInterrupt> = {
            let mut inbox = self.shared.inbox.lock();
            inbox.terminated = true;
            inbox.pending.drain(..).collect()
        };
        // Interrupting a dead worker succeeds as a no-op; unblock everyone.
        for pending in drained {
            pending.receipt.accept();
        }
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for WorkerHandle {}

impl PartialOrd for WorkerHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkerHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.shared.id.cmp(&other.shared.id)
    }
}

impl std::hash::Hash for WorkerHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerHandle({})", self.shared.id)
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.shared.id)
    }
}

/// Returns the calling thread's worker identity, registering the thread on
/// first use.
#[must_use]
pub fn current() -> WorkerHandle {
    CURRENT.with(|c| c.borrow_mut().get_or_insert_with(WorkerHandle::fresh).clone())
}

fn install(handle: WorkerHandle, initial_mask: Mask) {
    CURRENT.with(|c| *c.borrow_mut() = Some(handle));
    MASK.with(|m| m.set(initial_mask));
}

/// Ensures worker teardown runs on every exit path of a worker thread.
struct Teardown(WorkerHandle);

impl Drop for Teardown {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

/// Spawns an OS thread registered as a worker starting at `initial_mask`.
///
/// The handle is valid immediately, before the thread first runs: interrupts
/// delivered early stay pending until the worker reaches a poll point.
pub(crate) fn spawn_worker(
    initial_mask: Mask,
    body: impl FnOnce() + Send + 'static,
) -> std::io::Result<WorkerHandle> {
    let handle = WorkerHandle::fresh();
    let inner = handle.clone();
    std::thread::Builder::new()
        .name(format!("tether-worker-{}", handle.id()))
        .spawn(move || {
            install(inner.clone(), initial_mask);
            let _teardown = Teardown(inner);
            body();
        })?;
    Ok(handle)
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum InterruptKind {
    ScopeClosing,
    ChildFailed(Box<Failure>),
    StuckWait,
    External(Arc<dyn Any + Send + Sync>),
}

/// An asynchronous interrupt: a typed payload delivered from one worker to
/// another, raised in the target by unwinding.
///
/// The two library-internal kinds (scope-closing and child-failed) cannot be
/// constructed outside this crate, so handlers that match on them cannot be
/// spoofed by user interrupts.
#[derive(Clone)]
pub struct Interrupt {
    kind: InterruptKind,
}

impl Interrupt {
    pub(crate) const fn scope_closing() -> Self {
        Self {
            kind: InterruptKind::ScopeClosing,
        }
    }

    pub(crate) fn child_failed(failure: Failure) -> Self {
        Self {
            kind: InterruptKind::ChildFailed(Box::new(failure)),
        }
    }

    /// An interruption whose meaning is supplied by the caller.
    #[must_use]
    pub fn external(payload: impl Any + Send + Sync) -> Self {
        Self {
            kind: InterruptKind::External(Arc::new(payload)),
        }
    }

    /// The substrate's "this transactional wait is known to be stuck"
    /// wakeup. [`crate::thread::Thread::join`] tolerates one of these.
    #[must_use]
    pub const fn stuck_wait() -> Self {
        Self {
            kind: InterruptKind::StuckWait,
        }
    }

    /// True for the scope-close termination request.
    #[must_use]
    pub const fn is_scope_closing(&self) -> bool {
        matches!(self.kind, InterruptKind::ScopeClosing)
    }

    /// True for the stuck-wait wakeup.
    #[must_use]
    pub const fn is_stuck_wait(&self) -> bool {
        matches!(self.kind, InterruptKind::StuckWait)
    }

    /// True for a child-failure carrier.
    #[must_use]
    pub const fn is_child_failed(&self) -> bool {
        matches!(self.kind, InterruptKind::ChildFailed(_))
    }

    /// The payload of an external interrupt, if this is one.
    #[must_use]
    pub fn external_payload(&self) -> Option<&(dyn Any + Send + Sync)> {
        match &self.kind {
            InterruptKind::External(payload) => Some(&**payload),
            _ => None,
        }
    }

    /// Unwraps a child-failure carrier into the child's original failure.
    pub(crate) fn into_child_failure(self) -> std::result::Result<Failure, Self> {
        match self.kind {
            InterruptKind::ChildFailed(failure) => Ok(*failure),
            kind => Err(Self { kind }),
        }
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InterruptKind::ScopeClosing => write!(f, "Interrupt::ScopeClosing"),
            InterruptKind::ChildFailed(failure) => {
                write!(f, "Interrupt::ChildFailed({failure:?})")
            }
            InterruptKind::StuckWait => write!(f, "Interrupt::StuckWait"),
            InterruptKind::External(_) => write!(f, "Interrupt::External(..)"),
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InterruptKind::ScopeClosing => write!(f, "scope closing"),
            InterruptKind::ChildFailed(failure) => write!(f, "child failed: {failure}"),
            InterruptKind::StuckWait => write!(f, "stuck transactional wait"),
            InterruptKind::External(_) => write!(f, "external interrupt"),
        }
    }
}

/// Delivers `interrupt` to `target`, blocking until the target accepts it or
/// terminates. Delivery to the calling worker raises immediately.
///
/// This is itself an interruptible blocking point: an interrupt arriving at
/// the *caller* while it waits aborts the delivery (the payload stays queued
/// at the target).
pub fn interrupt(target: &WorkerHandle, interrupt: Interrupt) {
    let me = current();
    if me == *target {
        raise(interrupt);
    }
    poll_interrupts(PollSite::Checkpoint);
    trace!(worker = %target, payload = ?interrupt, "delivering interrupt");
    let receipt = {
        let mut inbox = target.shared.inbox.lock();
        if inbox.terminated {
            return;
        }
        let receipt = Arc::new(Receipt {
            delivered: AtomicBool::new(false),
            interrupter: me.clone(),
        });
        inbox.pending.push_back(PendingInterrupt {
            interrupt,
            receipt: Arc::clone(&receipt),
        });
        inbox.wake_seq = inbox.wake_seq.wrapping_add(1);
        target.shared.cond.notify_all();
        receipt
    };
    loop {
        let seen = me.wake_seq();
        if receipt.delivered.load(Ordering::Acquire) {
            return;
        }
        me.park(seen);
    }
}

/// Polls the current worker's pending interrupts, raising the first one the
/// mask admits at this site. At most one interrupt is raised per poll; the
/// rest stay queued with their interrupters still blocked.
pub(crate) fn poll_interrupts(site: PollSite) {
    if !current_mask().admits(site) {
        return;
    }
    let me = current();
    let deliverable = me.shared.inbox.lock().pending.pop_front();
    if let Some(pending) = deliverable {
        pending.receipt.accept();
        raise(pending.interrupt);
    }
}

// ---------------------------------------------------------------------------
// Failures: captured unwinds
// ---------------------------------------------------------------------------

/// A captured panic, reduced to its message so the value is clonable and
/// transportable across workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    fn from_any(payload: &(dyn Any + Send)) -> Self {
        let message = payload.downcast_ref::<&'static str>().map_or_else(
            || {
                payload
                    .downcast_ref::<String>()
                    .cloned()
                    .unwrap_or_else(|| "opaque panic payload".to_owned())
            },
            |s| (*s).to_owned(),
        );
        Self { message }
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// The terminal failure of a computation: either it panicked on its own, or
/// an asynchronous interrupt unwound it.
///
/// The distinction is the propagation predicate of the silent spawn family:
/// only [`Failure::Interrupted`] carries the asynchronous marker.
#[derive(Debug, Clone)]
pub enum Failure {
    /// The computation panicked.
    Panic(PanicPayload),
    /// An asynchronous interrupt unwound the computation.
    Interrupted(Interrupt),
}

impl Failure {
    /// True when the failure was delivered from outside rather than computed.
    #[must_use]
    pub const fn is_asynchronous(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// True when the failure is this library's own scope-close request.
    #[must_use]
    pub fn is_scope_closing(&self) -> bool {
        matches!(self, Self::Interrupted(i) if i.is_scope_closing())
    }

    /// Re-raises the failure in the calling worker.
    pub fn raise(self) -> ! {
        panic::resume_unwind(Box::new(self))
    }

    pub(crate) fn from_unwind(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Self>() {
            Ok(failure) => return *failure,
            Err(payload) => payload,
        };
        match payload.downcast::<Interrupt>() {
            Ok(interrupt) => Self::Interrupted(*interrupt),
            Err(payload) => Self::Panic(PanicPayload::from_any(payload.as_ref())),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panic(payload) => write!(f, "{payload}"),
            Self::Interrupted(interrupt) => write!(f, "interrupted: {interrupt}"),
        }
    }
}

/// Runs `f`, capturing any unwind (panic or raised interrupt) as a
/// [`Failure`].
pub fn catch<T>(f: impl FnOnce() -> T) -> std::result::Result<T, Failure> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Failure::from_unwind)
}

/// Raises an interrupt in the calling worker by unwinding.
pub(crate) fn raise(interrupt: Interrupt) -> ! {
    panic::resume_unwind(Box::new(interrupt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_stable_within_a_thread() {
        assert_eq!(current(), current());
    }

    #[test]
    fn default_mask_is_unmasked() {
        std::thread::spawn(|| assert_eq!(current_mask(), Mask::Unmasked))
            .join()
            .unwrap();
    }

    #[test]
    fn mask_nests_and_restores() {
        mask(|restore| {
            assert_eq!(current_mask(), Mask::Interruptible);
            uninterruptible_mask(|_| {
                assert_eq!(current_mask(), Mask::Uninterruptible);
            });
            assert_eq!(current_mask(), Mask::Interruptible);
            restore.run(|| {
                // Entered from an unmasked test thread.
                assert_eq!(current_mask(), Mask::Unmasked);
            });
            assert_eq!(current_mask(), Mask::Interruptible);
        });
    }

    #[test]
    fn catch_classifies_a_plain_panic() {
        let failure = catch(|| panic!("boom")).unwrap_err();
        match failure {
            Failure::Panic(payload) => assert_eq!(payload.message(), "boom"),
            Failure::Interrupted(_) => panic!("expected a synchronous classification"),
        }
    }

    #[test]
    fn catch_classifies_a_raised_interrupt() {
        let failure = catch(|| raise(Interrupt::external("stop"))).unwrap_err();
        assert!(failure.is_asynchronous());
        assert!(!failure.is_scope_closing());
    }

    #[test]
    fn catch_passes_a_failure_through_unchanged() {
        let original = Failure::Panic(PanicPayload::new("original"));
        let reraised = catch(|| original.clone().raise()).unwrap_err();
        match reraised {
            Failure::Panic(payload) => assert_eq!(payload.message(), "original"),
            Failure::Interrupted(_) => panic!("classification changed across re-raise"),
        }
    }

    #[test]
    fn self_interrupt_raises_immediately_even_when_masked() {
        let failure = catch(|| {
            uninterruptible_mask(|_| interrupt(&current(), Interrupt::external("now")));
        })
        .unwrap_err();
        assert!(failure.is_asynchronous());
    }

    #[test]
    fn interrupting_a_terminated_worker_returns() {
        let worker = spawn_worker(Mask::Unmasked, || {}).unwrap();
        // Give the worker time to exit; delivery must not block forever.
        std::thread::sleep(std::time::Duration::from_millis(50));
        interrupt(&worker, Interrupt::external("late"));
    }

    #[test]
    fn panic_payload_reads_str_and_string() {
        let failure = catch(|| panic!("{}", String::from("heap message"))).unwrap_err();
        match failure {
            Failure::Panic(payload) => assert_eq!(payload.message(), "heap message"),
            Failure::Interrupted(_) => panic!("expected panic classification"),
        }
    }
}
