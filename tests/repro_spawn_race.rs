//! Targeted reproductions of the spawn/close races.
//!
//! These tests hammer the two windows the children-map merge rules exist
//! for: a child finishing before its spawner records it (the quick-death
//! placeholder), and close freezing while spawns are mid-flight. A
//! bookkeeping bug in either shows up as a hang (drain never empties) or a
//! scope-closed child slipping through.

mod common;

use common::init_test_logging;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tether::{scoped, Scope};

#[test]
fn quick_deaths_retire_cleanly() {
    init_test_logging();
    // Children that return immediately race their completion against the
    // spawner's recording transaction; both merge orders must retire the
    // map entry, or the drain below hangs.
    let ran = Arc::new(AtomicU32::new(0));
    scoped(|scope| {
        for _ in 0..200 {
            let ran = Arc::clone(&ran);
            scope
                .spawn_detached(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .expect("scope open");
        }
        scope.wait();
    });
    assert_eq!(ran.load(Ordering::SeqCst), 200);
}

#[test]
fn quick_deaths_still_fill_their_slots() {
    init_test_logging();
    scoped(|scope| {
        let handles: Vec<_> = (0..64)
            .map(|i| scope.spawn(move || i).expect("scope open"))
            .collect();
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.join(), i);
        }
    });
}

#[test]
fn closing_races_with_concurrent_spawns() {
    init_test_logging();
    // A second thread spawns through a cloned scope while the body returns
    // and close freezes admission. Every admitted child must be drained by
    // close; the first rejected spawn must report the scope closed.
    let (scope_tx, scope_rx) = mpsc::channel::<Scope>();
    let ran = Arc::new(AtomicU32::new(0));
    let ran_outside = Arc::clone(&ran);
    let spawner = std::thread::spawn(move || {
        let scope = scope_rx.recv().unwrap();
        let mut admitted = 0u32;
        loop {
            let ran = Arc::clone(&ran_outside);
            match scope.spawn_detached(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }) {
                Ok(()) => admitted += 1,
                Err(err) => {
                    assert!(err.is_scope_closed());
                    break;
                }
            }
        }
        admitted
    });
    scoped(|scope| {
        scope_tx.send(scope.clone()).unwrap();
        // Give the outside spawner time to get going, then let the body
        // return so close races the spawn loop.
        std::thread::sleep(Duration::from_millis(20));
    });
    let admitted = spawner.join().unwrap();
    // Close drained every admitted child before scoped returned.
    assert_eq!(ran.load(Ordering::SeqCst), admitted);
    assert!(admitted > 0, "the spawn loop never got in at all");
}

#[test]
fn reclosing_an_escaped_scope_spawns_nothing() {
    init_test_logging();
    let escaped = scoped(|scope| scope.clone());
    for _ in 0..8 {
        assert!(escaped.spawn_detached(|| ()).is_err());
    }
    // Still quiescent: a rejected spawn must leave no trace behind.
    assert!(escaped.wait_for(Duration::from_millis(50)));
}
