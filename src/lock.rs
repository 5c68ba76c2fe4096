//! The short-term lock guarding each parking-lot bucket.
//!
//! Critical sections under this lock are a handful of pointer writes, so the
//! lock spins briefly before falling back to a futex wait. Nothing in the
//! crate blocks or calls user code while holding it, other than the parking
//! callbacks that are documented to run under it.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Iterations of pure spinning before a contended locker sleeps.
const SPIN_LIMIT: u32 = 100;

pub(crate) struct Lock {
    state: AtomicU32,
}

impl Lock {
    pub const fn new() -> Lock {
        Lock {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn lock(&self) -> LockGuard<'_> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        LockGuard { lock: self }
    }

    #[cold]
    fn lock_contended(&self) {
        let mut spin = SPIN_LIMIT;
        while self.state.load(Ordering::Relaxed) == LOCKED && spin > 0 {
            spin -= 1;
            spin_loop();
        }

        // Take the lock in the contended state so the unlocker knows to wake
        // us; a woken sleeper that loses the race re-marks it contended.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            atomic_wait::wait(&self.state, CONTENDED);
        }
    }

    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            atomic_wait::wake_one(&self.state);
        }
    }
}

pub(crate) struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended() {
        let lock = Lock::new();
        drop(lock.lock());
        drop(lock.lock());
    }

    #[test]
    fn mutual_exclusion() {
        struct Shared {
            lock: Lock,
            counter: core::cell::UnsafeCell<u64>,
        }
        // The counter is only touched under the lock.
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: Lock::new(),
            counter: core::cell::UnsafeCell::new(0),
        });

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let _guard = shared.lock.lock();
                        unsafe { *shared.counter.get() += 1 };
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let _guard = shared.lock.lock();
        assert_eq!(unsafe { *shared.counter.get() }, 40_000);
    }
}
