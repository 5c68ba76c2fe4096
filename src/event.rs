//! The one-shot event a parked thread sleeps on.

use core::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, Thread};
use std::time::Duration;

use crate::clock;

// -----------------------------------------------------------------------------
// States

/// The event has neither a sleeping waiter nor a pending notification.
const IDLE: u32 = 0;

/// The waiter is sleeping, or about to go to sleep, and needs an unpark.
const PARKED: u32 = 1;

/// The event has fired. Terminal.
const NOTIFIED: u32 = 2;

// -----------------------------------------------------------------------------
// ParkEvent

/// A one-shot blocking primitive tied to the thread that created it.
///
/// Exactly one `notify` may be issued per event. A `wait` that times out
/// leaves the event armed: a second `wait` is permitted and completes on the
/// pending or eventual notify. This is what lets a parked thread that lost
/// the timeout race block again for the wake that is already on its way.
pub(crate) struct ParkEvent {
    state: AtomicU32,
    thread: Thread,
}

impl ParkEvent {
    /// Creates an event owned by the calling thread. Only that thread may
    /// `wait`; any thread may `notify`.
    pub fn new() -> ParkEvent {
        ParkEvent {
            state: AtomicU32::new(IDLE),
            thread: thread::current(),
        }
    }

    /// Blocks until notified or until the `nanotime` deadline passes.
    /// Returns `true` when the notification was received.
    pub fn wait(&self, deadline: Option<u64>) -> bool {
        if self
            .state
            .compare_exchange(IDLE, PARKED, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            // Already notified; the only other writer is `notify`.
            return true;
        }

        loop {
            if self.state.load(Ordering::Acquire) == NOTIFIED {
                return true;
            }
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = clock::nanotime();
                    if now >= deadline {
                        // Withdraw the parked claim. A notify that lands
                        // first wins and the wait reports success.
                        return self.state.swap(IDLE, Ordering::Acquire) == NOTIFIED;
                    }
                    thread::park_timeout(Duration::from_nanos(deadline - now));
                }
            }
        }
    }

    /// Fires the event, waking the owning thread if it is asleep.
    ///
    /// The waiter may return from `wait` and free the event the moment the
    /// notified state is published, so the thread handle is cloned first and
    /// the event memory is never touched after the swap.
    pub fn notify(&self) {
        let thread = self.thread.clone();
        if self.state.swap(NOTIFIED, Ordering::Release) == PARKED {
            thread.unpark();
        }
    }
}
