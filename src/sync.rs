// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// In-process counting-semaphore-like wakeup primitive.
//
// Queues in this crate live in a single process, so the `wait`/`signal`
// vocabulary is implemented directly on `std::sync::{Mutex, Condvar}`
// instead of a named, cross-process OS object: open-free construction,
// `wait(timeout)` that returns regardless of why it woke, and a
// non-blocking `signal`.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A signal hint, not an event counter: spurious wakes are permitted and
/// real wakes may be coalesced.
pub(crate) struct Semaphore {
    lock: Mutex<u64>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Wake one waiter, coalescing with any pending un-consumed signal.
    pub(crate) fn signal(&self) {
        let mut count = self.lock.lock().unwrap();
        *count = count.saturating_add(1);
        self.cond.notify_all();
    }

    /// Wait until signalled or `timeout` elapses. `None` means wait forever.
    /// Returns regardless of whether it woke due to a signal or a timeout;
    /// the two need not be distinguishable to the caller.
    pub(crate) fn wait(&self, timeout: Option<Duration>) {
        let mut count = self.lock.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            return;
        }
        match timeout {
            None => {
                count = self.cond.wait(count).unwrap();
            }
            Some(d) => {
                let (guard, _timeout_result) = self.cond.wait_timeout(count, d).unwrap();
                count = guard;
            }
        }
        if *count > 0 {
            *count -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_wakes_waiter() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            sem2.wait(Some(Duration::from_secs(5)));
        });
        thread::sleep(Duration::from_millis(20));
        sem.signal();
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_without_signal() {
        let sem = Semaphore::new();
        sem.wait(Some(Duration::from_millis(10)));
    }

    #[test]
    fn signal_before_wait_is_not_lost() {
        let sem = Semaphore::new();
        sem.signal();
        sem.wait(Some(Duration::from_millis(10)));
    }
}
