//! Tether: structured concurrency for preemptive threads.
//!
//! # Overview
//!
//! Tether bounds the lifetime of concurrently executing work to a lexically
//! delimited region. A [`scoped`] call opens a *scope*; any number of child
//! threads may be spawned into it; the call cannot return while a child is
//! still running, and leaving the scope abnormally terminates every
//! remaining child first. No child outlives its scope under any
//! circumstances.
//!
//! # Core Guarantees
//!
//! - **No orphan threads**: every spawned child is owned by a scope; the
//!   scope's close sequence waits for all of them
//! - **Failures travel up**: a failed child interrupts its parent with the
//!   child's original failure, not a library-internal wrapper
//! - **Spawning is race-free**: a spawn that has committed to creating a
//!   worker is always seen by close, even when the child finishes before the
//!   spawner records it
//! - **Termination is a signal, not a flag**: children are stopped by a
//!   targeted asynchronous interrupt, raised at their next unmasked blocking
//!   point
//!
//! # Module Structure
//!
//! - [`scope`]: scope lifecycle, spawn variants, close protocol, wait
//! - [`thread`]: child handles and join
//! - [`signal`]: worker identity, asynchronous interrupts, masking
//! - [`stm`]: transactional variables used for all shared scope state
//! - [`alarm`]: deadline flags backing the bounded waits
//! - [`error`]: typed error values
//!
//! # Example
//!
//! ```
//! let total = tether::scoped(|scope| {
//!     let a = scope.spawn(|| 1 + 2).expect("scope open");
//!     let b = scope.spawn(|| 3 + 4).expect("scope open");
//!     a.join() + b.join()
//! });
//! assert_eq!(total, 10);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod alarm;
pub mod error;
pub mod scope;
pub mod signal;
pub mod stm;
pub mod thread;
pub mod tracing_compat;

pub use alarm::Alarm;
pub use error::{Error, ErrorKind, Result};
pub use scope::{scoped, Scope};
pub use signal::{
    catch, current, current_mask, interrupt, mask, uninterruptible_mask, Failure, Interrupt, Mask,
    PanicPayload, Restore, Unmask, WorkerHandle,
};
pub use stm::{atomically, retry, StmResult, TVar, Tx};
pub use thread::Thread;
