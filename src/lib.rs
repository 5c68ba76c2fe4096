//! A user-space concurrency runtime built from two tightly coupled pieces:
//! an address-keyed parking lot and a work-stealing task pool.
//!
//! The [parking lot](crate::park) associates blocked threads with arbitrary
//! machine addresses, the way WebKit's `WTF::ParkingLot` and Linux futexes
//! do: a fixed table of wait queues keyed by address, with callbacks that
//! run under the queue lock so higher-level primitives (mutexes, condition
//! variables, events) can keep their own state in a single word. The
//! [`Pool`] multiplexes lightweight intrusive tasks over a bounded set of
//! worker threads, with per-worker run queues in three tiers, work stealing
//! between workers, and idle workers suspended through the parking lot.
//!
//! # Running a pool
//!
//! A pool lives on the stack of [`Pool::run`], whose calling thread becomes
//! the first worker. Additional workers spawn on demand, up to the
//! configured cap, as tasks schedule more work. The pool winds down when a
//! task calls [`Pool::shutdown`]:
//!
//! ```rust,no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use presto::{Config, Pool, Worker};
//!
//! fn countdown(worker: &Worker, counter: Arc<AtomicUsize>) {
//!     if counter.fetch_sub(1, Ordering::AcqRel) == 1 {
//!         worker.pool().shutdown();
//!         return;
//!     }
//!     worker.spawn(move |worker| countdown(worker, counter));
//! }
//!
//! let counter = Arc::new(AtomicUsize::new(10_000));
//! Pool::run(Config::new(), {
//!     let counter = Arc::clone(&counter);
//!     move |worker| countdown(worker, counter)
//! });
//! assert_eq!(counter.load(Ordering::Acquire), 0);
//! ```
//!
//! # Parking
//!
//! The parking lot stands on its own for building synchronization
//! primitives. [`park`] queues the calling thread on an address after a
//! validation callback approves, [`unpark_one`] and [`unpark_all`] dequeue
//! and wake. Wake-ups are FIFO per address and eventually fair: roughly once
//! per millisecond a dequeue carries the `be_fair` flag, telling the caller
//! to hand the protected resource to the woken thread directly instead of
//! letting newcomers barge.

// -----------------------------------------------------------------------------
// Modules

mod clock;
mod event;
mod lock;
mod parking;
mod queue;
mod task;
mod thread_pool;
mod unwind;
mod util;

// -----------------------------------------------------------------------------
// Top-level exports

pub use clock::nanotime;
pub use parking::park;
pub use parking::unpark_all;
pub use parking::unpark_one;
pub use parking::ParkResult;
pub use parking::ParkToken;
pub use parking::UnparkResult;
pub use parking::UnparkToken;
pub use parking::DEFAULT_UNPARK_TOKEN;
pub use task::Batch;
pub use task::Task;
pub use thread_pool::Config;
pub use thread_pool::Pool;
pub use thread_pool::ScheduleHint;
pub use thread_pool::Worker;
