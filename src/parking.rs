//! An address-keyed parking lot.
//!
//! Synchronization primitives built on this module keep their hot state in a
//! single word and offload all thread queuing to a fixed table of wait
//! queues, keyed by arbitrary machine addresses. *Parking* suspends the
//! calling thread on the queue for an address; *unparking* dequeues and wakes
//! one or all threads from that queue. The callbacks passed to [`park`] and
//! [`unpark_one`] run under the queue's lock, which is what lets callers
//! validate predicates and hand off ownership atomically with the queue
//! operation.
//!
//! Waiters are intrusive: each one lives on its parker's stack for the
//! duration of the park call, and the queue links run through the waiter
//! itself. A bucket holds one FIFO sub-queue per distinct address, with the
//! sub-queue heads chained together through a root list.
//!
//! Hand-offs are eventually fair. Most unparks simply dequeue in FIFO order
//! and let the caller's fast path race the woken thread, but at least once
//! per millisecond-scale interval the dequeue is flagged `be_fair`, telling
//! the caller to grant the woken thread the resource directly instead of
//! letting newcomers barge.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::clock;
use crate::event::ParkEvent;
use crate::lock::Lock;
use crate::util::XorShift16;

// -----------------------------------------------------------------------------
// Tokens and results

/// A caller-chosen word stored with a parked thread. It is reported back to
/// the caller's `timed_out` callback if the park expires.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ParkToken(pub usize);

/// A caller-chosen word delivered to a woken thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UnparkToken(pub usize);

/// The token delivered when the unparker has nothing in particular to say.
pub const DEFAULT_UNPARK_TOKEN: UnparkToken = UnparkToken(0);

/// Outcome of a [`park`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParkResult {
    /// Another thread dequeued this one and handed over a token.
    Unparked(UnparkToken),
    /// The validation callback declined; the thread was never queued.
    Invalidated,
    /// The deadline passed before any unparker dequeued this thread.
    TimedOut,
}

/// Description of an [`unpark_one`] operation, passed to its callback while
/// the queue lock is still held.
#[derive(Copy, Clone, Debug, Default)]
pub struct UnparkResult {
    /// Number of threads dequeued: zero or one.
    pub unparked_threads: usize,
    /// True if waiters remain queued on the address afterwards.
    pub has_more: bool,
    /// True if the fairness interval elapsed and the caller should hand the
    /// resource to the woken thread directly.
    pub be_fair: bool,
}

// -----------------------------------------------------------------------------
// Waiters

/// Upper bound on the interval between forced-fair hand-offs, and the
/// modulus for the randomized deadline within it.
const FAIR_INTERVAL_NS: u64 = 1_000_000;

/// A queued thread. Lives on the parking thread's stack for the duration of
/// the park call; every link field is guarded by the owning bucket's lock.
struct Waiter {
    event: ParkEvent,
    address: usize,
    token: ParkToken,
    /// Written by the unparker, under the lock, before the wake.
    unpark_token: Cell<UnparkToken>,
    /// Next waiter parked on the same address.
    next: Cell<Option<NonNull<Waiter>>>,
    /// Previous waiter parked on the same address; `None` on a head.
    prev: Cell<Option<NonNull<Waiter>>>,
    /// Root-list links between the sub-queue heads of one bucket. Only
    /// meaningful on heads.
    root_next: Cell<Option<NonNull<Waiter>>>,
    root_prev: Cell<Option<NonNull<Waiter>>>,
    /// On a head, the last waiter of its sub-queue. `None` once dequeued;
    /// this doubles as the queued flag on every waiter.
    tail: Cell<Option<NonNull<Waiter>>>,
    /// Fairness generator state. Meaningful on heads; migrates to the next
    /// head on dequeue so the state follows the sub-queue.
    prng: Cell<u16>,
    /// Clock value after which the next dequeue is forced fair. Heads only.
    fair_deadline: Cell<u64>,
}

impl Waiter {
    fn new(address: usize, token: ParkToken) -> Waiter {
        Waiter {
            event: ParkEvent::new(),
            address,
            token,
            unpark_token: Cell::new(DEFAULT_UNPARK_TOKEN),
            next: Cell::new(None),
            prev: Cell::new(None),
            root_next: Cell::new(None),
            root_prev: Cell::new(None),
            tail: Cell::new(None),
            prng: Cell::new(0),
            fair_deadline: Cell::new(0),
        }
    }
}

// -----------------------------------------------------------------------------
// Buckets

const BUCKET_COUNT: usize = 256;
const BUCKET_SHIFT: u32 = usize::BITS - 8;

#[cfg(target_pointer_width = "64")]
const FIB_HASH: usize = 0x9E37_79B9_7F4A_7C15;
#[cfg(target_pointer_width = "32")]
const FIB_HASH: usize = 0x9E37_79B9;

struct Bucket {
    lock: Lock,
    /// Packed [`QueueRoot`] word. Mutated under `lock`.
    root: AtomicUsize,
}

impl Bucket {
    const fn new() -> Bucket {
        Bucket {
            lock: Lock::new(),
            root: AtomicUsize::new(0),
        }
    }
}

static BUCKETS: [Bucket; BUCKET_COUNT] = [const { Bucket::new() }; BUCKET_COUNT];

fn bucket_index(address: usize) -> usize {
    address.wrapping_mul(FIB_HASH) >> BUCKET_SHIFT
}

fn bucket_for(address: usize) -> &'static Bucket {
    &BUCKETS[bucket_index(address)]
}

/// The state of a bucket's queue, packed into one word. An empty bucket that
/// once held waiters remembers its fairness seed so re-populated queues
/// continue the same sequence.
#[derive(Copy, Clone)]
enum QueueRoot {
    Empty,
    Seed(u16),
    Head(NonNull<Waiter>),
}

const SEED_TAG: usize = 0b1;

impl QueueRoot {
    fn unpack(word: usize) -> QueueRoot {
        if word == 0 {
            QueueRoot::Empty
        } else if word & SEED_TAG != 0 {
            QueueRoot::Seed((word >> 1) as u16)
        } else {
            // SAFETY: nonzero untagged words are always waiter addresses.
            QueueRoot::Head(unsafe { NonNull::new_unchecked(word as *mut Waiter) })
        }
    }

    fn pack(self) -> usize {
        match self {
            QueueRoot::Empty => 0,
            QueueRoot::Seed(seed) => ((seed as usize) << 1) | SEED_TAG,
            QueueRoot::Head(head) => head.as_ptr() as usize,
        }
    }
}

/// Fallback fairness seed: the low bits of an address, forced odd so the
/// xorshift state is never zero.
fn seed_from(address: usize) -> u16 {
    address as u16 | 1
}

// -----------------------------------------------------------------------------
// Queue maintenance
//
// Every function below requires the bucket's lock to be held; that lock is
// what makes the `Cell` traffic on waiters race-free.

/// Installs `new_head` (or the seed sentinel) in the bucket's root slot,
/// carrying the fairness state across the transition.
unsafe fn set_root(bucket: &Bucket, new_head: Option<NonNull<Waiter>>) {
    let (prng, fair_deadline) = match QueueRoot::unpack(bucket.root.load(Ordering::Relaxed)) {
        QueueRoot::Head(old) => {
            let old = unsafe { old.as_ref() };
            (old.prng.get(), old.fair_deadline.get())
        }
        QueueRoot::Seed(seed) => (seed, 0),
        QueueRoot::Empty => (seed_from(bucket as *const Bucket as usize), 0),
    };
    let root = match new_head {
        Some(head) => {
            let head_ref = unsafe { head.as_ref() };
            head_ref.prng.set(prng);
            head_ref.fair_deadline.set(fair_deadline);
            QueueRoot::Head(head)
        }
        None => QueueRoot::Seed(prng),
    };
    bucket.root.store(root.pack(), Ordering::Relaxed);
}

/// Finds the sub-queue head for `address` by walking the root list.
unsafe fn find_head(bucket: &Bucket, address: usize) -> Option<NonNull<Waiter>> {
    let mut cursor = match QueueRoot::unpack(bucket.root.load(Ordering::Relaxed)) {
        QueueRoot::Head(head) => Some(head),
        _ => None,
    };
    while let Some(head) = cursor {
        let head_ref = unsafe { head.as_ref() };
        if head_ref.address == address {
            return Some(head);
        }
        cursor = head_ref.root_next.get();
    }
    None
}

/// Queues `waiter` behind any existing waiters on its address, or splices it
/// into the root list as a new sub-queue head.
unsafe fn insert(bucket: &Bucket, waiter: NonNull<Waiter>) {
    let waiter_ref = unsafe { waiter.as_ref() };
    waiter_ref.next.set(None);
    waiter_ref.prev.set(None);
    waiter_ref.root_next.set(None);
    waiter_ref.root_prev.set(None);
    waiter_ref.tail.set(Some(waiter));

    let mut last = None;
    let mut cursor = match QueueRoot::unpack(bucket.root.load(Ordering::Relaxed)) {
        QueueRoot::Head(head) => Some(head),
        _ => None,
    };
    while let Some(head) = cursor {
        let head_ref = unsafe { head.as_ref() };
        if head_ref.address == waiter_ref.address {
            // Append to the existing sub-queue.
            let tail = head_ref.tail.get().expect("sub-queue head without a tail");
            unsafe { tail.as_ref() }.next.set(Some(waiter));
            waiter_ref.prev.set(Some(tail));
            head_ref.tail.set(Some(waiter));
            return;
        }
        last = Some(head);
        cursor = head_ref.root_next.get();
    }

    // First waiter for this address in the bucket.
    match last {
        Some(last) => {
            unsafe { last.as_ref() }.root_next.set(Some(waiter));
            waiter_ref.root_prev.set(Some(last));
            waiter_ref.prng.set(seed_from(waiter_ref.address));
            waiter_ref.fair_deadline.set(0);
        }
        None => unsafe { set_root(bucket, Some(waiter)) },
    }
}

/// Detaches a sub-queue head from the root list, leaving the rest of the
/// bucket intact.
unsafe fn unlink_root(bucket: &Bucket, head: NonNull<Waiter>) {
    let head_ref = unsafe { head.as_ref() };
    match (head_ref.root_prev.get(), head_ref.root_next.get()) {
        (Some(root_prev), root_next) => {
            unsafe { root_prev.as_ref() }.root_next.set(root_next);
            if let Some(root_next) = root_next {
                unsafe { root_next.as_ref() }.root_prev.set(Some(root_prev));
            }
        }
        (None, Some(root_next)) => {
            unsafe { root_next.as_ref() }.root_prev.set(None);
            // Adopts the departing head's fairness state.
            unsafe { set_root(bucket, Some(root_next)) };
        }
        (None, None) => unsafe { set_root(bucket, None) },
    }
}

/// Dequeues the head of a sub-queue, promoting its successor and
/// transferring the head-only state to it.
unsafe fn dequeue_head(bucket: &Bucket, head: NonNull<Waiter>) {
    let head_ref = unsafe { head.as_ref() };
    match head_ref.next.get() {
        Some(next) => {
            let next_ref = unsafe { next.as_ref() };
            next_ref.prev.set(None);
            next_ref.tail.set(head_ref.tail.get());
            next_ref.prng.set(head_ref.prng.get());
            next_ref.fair_deadline.set(head_ref.fair_deadline.get());
            next_ref.root_prev.set(head_ref.root_prev.get());
            next_ref.root_next.set(head_ref.root_next.get());
            match head_ref.root_prev.get() {
                Some(root_prev) => unsafe { root_prev.as_ref() }.root_next.set(Some(next)),
                None => bucket
                    .root
                    .store(QueueRoot::Head(next).pack(), Ordering::Relaxed),
            }
            if let Some(root_next) = head_ref.root_next.get() {
                unsafe { root_next.as_ref() }.root_prev.set(Some(next));
            }
        }
        None => unsafe { unlink_root(bucket, head) },
    }
    head_ref.tail.set(None);
}

/// Removes `waiter` from wherever it sits in its sub-queue. Fails if it was
/// already dequeued.
unsafe fn remove(bucket: &Bucket, waiter: NonNull<Waiter>) -> bool {
    let waiter_ref = unsafe { waiter.as_ref() };
    if waiter_ref.tail.get().is_none() {
        return false;
    }

    match waiter_ref.prev.get() {
        None => unsafe { dequeue_head(bucket, waiter) },
        Some(prev) => {
            unsafe { prev.as_ref() }.next.set(waiter_ref.next.get());
            match waiter_ref.next.get() {
                Some(next) => unsafe { next.as_ref() }.prev.set(Some(prev)),
                None => {
                    // Removed the sub-queue tail; walk back to the head to
                    // repair its tail pointer.
                    let mut head = prev;
                    while let Some(earlier) = unsafe { head.as_ref() }.prev.get() {
                        head = earlier;
                    }
                    unsafe { head.as_ref() }.tail.set(Some(prev));
                }
            }
            waiter_ref.tail.set(None);
        }
    }
    true
}

/// Consults the fairness state on a sub-queue head: returns false while the
/// current interval is still running, otherwise draws the next randomized
/// interval (at most [`FAIR_INTERVAL_NS`]) and reports a forced-fair
/// hand-off.
unsafe fn should_be_fair(head: NonNull<Waiter>) -> bool {
    let head_ref = unsafe { head.as_ref() };
    let now = clock::nanotime();
    if now < head_ref.fair_deadline.get() {
        return false;
    }
    let mut prng = XorShift16::new(head_ref.prng.get());
    let jitter = u64::from(prng.gen_u32());
    head_ref.prng.set(prng.state());
    head_ref.fair_deadline.set(now + jitter % FAIR_INTERVAL_NS);
    true
}

// -----------------------------------------------------------------------------
// Parking

/// Parks the current thread on `address` until an unparker wakes it or the
/// `nanotime` deadline passes.
///
/// `validate` runs under the queue lock before anything is queued; returning
/// `None` aborts the park. This is the same lock [`unpark_one`] holds for its
/// callback, so a park whose validation succeeded is always visible to
/// subsequent unparkers. `before_sleep` runs after the waiter is queued,
/// still under the lock. `timed_out` runs under the lock when the deadline
/// expired and the waiter was still queued; its arguments are the park token
/// and whether other waiters remain on the address.
///
/// A timed-out park that lost the race against a concurrent unpark reports
/// [`ParkResult::Unparked`] with the unparker's token, never both outcomes.
pub fn park(
    address: usize,
    validate: impl FnOnce() -> Option<ParkToken>,
    before_sleep: impl FnOnce(),
    timed_out: impl FnOnce(ParkToken, bool),
    deadline: Option<u64>,
) -> ParkResult {
    let bucket = bucket_for(address);
    let guard = bucket.lock.lock();

    let Some(token) = validate() else {
        drop(guard);
        return ParkResult::Invalidated;
    };

    let waiter = Waiter::new(address, token);
    // SAFETY: the bucket lock is held, and the waiter outlives its queued
    // state: this frame does not return until the waiter is dequeued (by an
    // unparker or by the timeout removal below) and any pending wake landed.
    unsafe { insert(bucket, NonNull::from(&waiter)) };
    before_sleep();
    drop(guard);

    if waiter.event.wait(deadline) {
        return ParkResult::Unparked(waiter.unpark_token.get());
    }

    // The deadline passed; take the waiter back out if it is still queued.
    let guard = bucket.lock.lock();
    // SAFETY: lock held; the waiter is ours.
    if unsafe { remove(bucket, NonNull::from(&waiter)) } {
        let has_more = unsafe { find_head(bucket, address) }.is_some();
        timed_out(waiter.token, has_more);
        drop(guard);
        return ParkResult::TimedOut;
    }
    drop(guard);

    // An unparker dequeued the waiter before the removal; its wake is on the
    // way and this wait is guaranteed to finish.
    waiter.event.wait(None);
    ParkResult::Unparked(waiter.unpark_token.get())
}

/// Dequeues and wakes the oldest thread parked on `address`, if any.
///
/// `callback` runs under the queue lock with a description of the dequeue;
/// the token it returns is delivered to the woken thread. It is invoked even
/// when no thread was queued, so callers can release hand-off state
/// atomically either way.
pub fn unpark_one(
    address: usize,
    callback: impl FnOnce(UnparkResult) -> UnparkToken,
) -> UnparkResult {
    let bucket = bucket_for(address);
    let guard = bucket.lock.lock();

    // SAFETY: lock held for all queue access below.
    match unsafe { find_head(bucket, address) } {
        None => {
            let result = UnparkResult::default();
            let _ = callback(result);
            drop(guard);
            result
        }
        Some(head) => {
            let result = UnparkResult {
                unparked_threads: 1,
                has_more: unsafe { head.as_ref() }.next.get().is_some(),
                be_fair: unsafe { should_be_fair(head) },
            };
            unsafe { dequeue_head(bucket, head) };
            let token = callback(result);
            let head_ref = unsafe { head.as_ref() };
            head_ref.unpark_token.set(token);
            drop(guard);
            // The wake happens outside the lock; the waiter's frame stays
            // valid until `notify` publishes the event.
            head_ref.event.notify();
            result
        }
    }
}

/// Dequeues and wakes every thread parked on `address`, delivering `token`
/// to each. Returns the number of threads woken.
pub fn unpark_all(address: usize, token: UnparkToken) -> usize {
    let bucket = bucket_for(address);
    let guard = bucket.lock.lock();

    // SAFETY: lock held for all queue access below.
    let head = unsafe { find_head(bucket, address) };
    if let Some(head) = head {
        unsafe { unlink_root(bucket, head) };
        let mut cursor = Some(head);
        while let Some(waiter) = cursor {
            let waiter_ref = unsafe { waiter.as_ref() };
            waiter_ref.tail.set(None);
            waiter_ref.unpark_token.set(token);
            cursor = waiter_ref.next.get();
        }
    }
    drop(guard);

    // Wake outside the lock. Each waiter may be freed the instant it is
    // notified, so its link is read first.
    let mut unparked = 0;
    let mut cursor = head;
    while let Some(waiter) = cursor {
        let waiter_ref = unsafe { waiter.as_ref() };
        cursor = waiter_ref.next.get();
        waiter_ref.event.notify();
        unparked += 1;
    }
    unparked
}

// -----------------------------------------------------------------------------
// Tests
