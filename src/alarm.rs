//! Deadline flags for the bounded waits.
//!
//! An [`Alarm`] is a registration with the crate's timer thread: after the
//! given duration its *elapsed* flag, a transactional variable, flips to
//! true, waking any transaction parked on it. Dropping the alarm
//! unregisters it.
//!
//! The timer thread keeps a min-heap of `(deadline, registration)` pairs;
//! cancelled registrations are dropped lazily when they surface at the top
//! of the heap.

use crate::stm::{atomically, StmResult, TVar, Tx};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

struct ServiceState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    armed: HashMap<u64, TVar<bool>>,
    next_id: u64,
}

struct AlarmService {
    state: Mutex<ServiceState>,
    cond: Condvar,
}

fn service() -> &'static AlarmService {
    static SERVICE: OnceLock<AlarmService> = OnceLock::new();
    SERVICE.get_or_init(|| {
        std::thread::Builder::new()
            .name("tether-alarm".to_owned())
            .spawn(drive)
            .expect("alarm thread creation");
        AlarmService {
            state: Mutex::new(ServiceState {
                deadlines: BinaryHeap::new(),
                armed: HashMap::new(),
                next_id: 1,
            }),
            cond: Condvar::new(),
        }
    })
}

fn drive() {
    let service = service();
    loop {
        let due: Vec<TVar<bool>> = {
            let mut state = service.state.lock();
            let now = Instant::now();
            let mut fired = Vec::new();
            while let Some(Reverse((deadline, id))) = state.deadlines.peek().copied() {
                if deadline > now {
                    break;
                }
                state.deadlines.pop();
                if let Some(flag) = state.armed.remove(&id) {
                    fired.push(flag);
                }
            }
            if fired.is_empty() {
                match state.deadlines.peek().copied() {
                    Some(Reverse((deadline, _))) => {
                        let _ = service.cond.wait_until(&mut state, deadline);
                    }
                    None => service.cond.wait(&mut state),
                }
                continue;
            }
            fired
        };
        for flag in due {
            atomically(|tx| {
                tx.write(&flag, true);
                StmResult::Success(())
            });
        }
    }
}

/// A one-shot deadline whose elapsed flag is transactional.
#[derive(Debug)]
pub struct Alarm {
    elapsed: TVar<bool>,
    id: u64,
}

impl Alarm {
    /// Registers an alarm that elapses after `duration`.
    #[must_use]
    pub fn after(duration: Duration) -> Self {
        let elapsed = TVar::new(false);
        let deadline = Instant::now() + duration;
        let service = service();
        let id = {
            let mut state = service.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.deadlines.push(Reverse((deadline, id)));
            state.armed.insert(id, elapsed.clone());
            id
        };
        service.cond.notify_one();
        Self { elapsed, id }
    }

    /// Reads the elapsed flag inside a transaction.
    #[must_use]
    pub fn elapsed_tx(&self, tx: &Tx) -> bool {
        tx.read(&self.elapsed)
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        let mut state = service().state.lock();
        state.armed.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stm::retry;

    #[test]
    fn alarm_elapses() {
        let alarm = Alarm::after(Duration::from_millis(20));
        atomically(|tx| {
            if alarm.elapsed_tx(tx) {
                StmResult::Success(())
            } else {
                retry()
            }
        });
    }

    #[test]
    fn dropped_alarm_never_fires() {
        let flag = {
            let alarm = Alarm::after(Duration::from_millis(20));
            alarm.elapsed.clone()
        };
        std::thread::sleep(Duration::from_millis(60));
        let fired = atomically(|tx| StmResult::Success(tx.read(&flag)));
        assert!(!fired);
    }

    #[test]
    fn earlier_alarm_fires_first() {
        let slow = Alarm::after(Duration::from_millis(200));
        let fast = Alarm::after(Duration::from_millis(20));
        atomically(|tx| {
            if fast.elapsed_tx(tx) {
                StmResult::Success(())
            } else {
                retry()
            }
        });
        let slow_fired = atomically(|tx| StmResult::Success(slow.elapsed_tx(tx)));
        assert!(!slow_fired);
    }
}
