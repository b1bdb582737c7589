#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::sync::Once;
use tether::{atomically, retry, StmResult, TVar};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging. Safe to call multiple times; only the first
/// call takes effect.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Blocks until `flag` is true.
pub fn await_flag(flag: &TVar<bool>) {
    atomically(|tx| {
        if tx.read(flag) {
            StmResult::Success(())
        } else {
            retry()
        }
    });
}

/// Sets `flag` to true.
pub fn set_flag(flag: &TVar<bool>) {
    atomically(|tx| {
        tx.write(flag, true);
        StmResult::Success(())
    });
}

/// Blocks forever (until interrupted): a transactional wait on a variable
/// nobody else can reach.
pub fn block_forever() {
    let never = TVar::new(false);
    await_flag(&never);
}
