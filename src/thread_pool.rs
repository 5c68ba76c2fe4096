//! This module contains the pool and worker halves of the scheduler.
//!
//! A [`Pool`] is stack-allocated by [`Pool::run`] and multiplexes tasks over
//! a bounded set of worker threads. Each [`Worker`] keeps four tiers of local
//! storage (a next slot, a LIFO slot, a bounded FIFO ring, and an unbounded
//! overflow queue) and falls back to the pool's global queue and to stealing
//! from its peers. Worker lifecycle, wake-ups, and shutdown are coordinated
//! through a single packed atomic word, `Pool::sync`, with idle workers
//! parked on that word's address in the parking lot.

use core::cell::Cell;
use core::num::NonZeroU16;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::thread;

use tracing::{debug, error, trace};

use crate::parking::{self, ParkToken};
use crate::queue::{Buffer, Injector, Popped};
use crate::task::{Batch, HeapTask, StackTask, Task};
use crate::unwind;

// -----------------------------------------------------------------------------
// Configuration

const DEFAULT_STACK_SIZE: u32 = 1 << 20;
const MIN_STACK_SIZE: u32 = 16 * 1024;

/// Pool configuration. The defaults run one worker per logical CPU with
/// 1 MiB thread stacks.
#[derive(Copy, Clone, Debug, Default)]
pub struct Config {
    max_threads: Option<NonZeroU16>,
    stack_size: Option<u32>,
}

impl Config {
    pub const fn new() -> Config {
        Config {
            max_threads: None,
            stack_size: None,
        }
    }

    /// Caps the number of worker threads.
    pub fn max_threads(mut self, max_threads: NonZeroU16) -> Config {
        self.max_threads = Some(max_threads);
        self
    }

    /// Sets the stack size of spawned workers, in bytes. Clamped to at least
    /// 16 KiB.
    pub fn stack_size(mut self, stack_size: u32) -> Config {
        self.stack_size = Some(stack_size);
        self
    }
}

fn resolved_max_threads(config: &Config) -> u16 {
    let requested = config.max_threads.map(NonZeroU16::get).unwrap_or_else(|| {
        thread::available_parallelism()
            .map(|count| count.get().min(usize::from(u16::MAX)) as u16)
            .unwrap_or(1)
    });
    requested.clamp(1, SyncState::COUNT_MASK as u16)
}

fn resolved_stack_size(config: &Config) -> usize {
    config
        .stack_size
        .unwrap_or(DEFAULT_STACK_SIZE)
        .max(MIN_STACK_SIZE) as usize
}

// -----------------------------------------------------------------------------
// The packed coordination word

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SyncStatus {
    /// Normal operation; no wake pending.
    Pending,
    /// A wake was posted with no waking worker to hand it to.
    Notified,
    /// Exactly one worker holds the waking role and will promote another.
    Waking,
    /// A wake was posted while a waker was already active.
    WakerNotified,
    /// Terminal.
    Shutdown,
}

/// Worker lifecycle state, packed into one `u32`: three state bits, the
/// in-flight notification flag, and two 14-bit counters.
#[derive(Copy, Clone, Debug)]
struct SyncState {
    state: SyncStatus,
    /// An unpark of the idle queue is in flight and has not been claimed.
    notified: bool,
    /// Workers currently parked on the idle queue.
    idle: u16,
    /// Worker threads alive (or reserved for an in-progress spawn).
    spawned: u16,
}

impl SyncState {
    const COUNT_BITS: u32 = 14;
    const COUNT_MASK: u32 = (1 << Self::COUNT_BITS) - 1;
}

impl From<u32> for SyncState {
    fn from(word: u32) -> SyncState {
        SyncState {
            state: match word & 0b111 {
                0 => SyncStatus::Pending,
                1 => SyncStatus::Notified,
                2 => SyncStatus::Waking,
                3 => SyncStatus::WakerNotified,
                4 => SyncStatus::Shutdown,
                _ => unreachable!("invalid sync state"),
            },
            notified: word & 0b1000 != 0,
            spawned: ((word >> 4) & Self::COUNT_MASK) as u16,
            idle: ((word >> (4 + Self::COUNT_BITS)) & Self::COUNT_MASK) as u16,
        }
    }
}

impl From<SyncState> for u32 {
    fn from(sync: SyncState) -> u32 {
        debug_assert!(u32::from(sync.idle) <= SyncState::COUNT_MASK);
        debug_assert!(u32::from(sync.spawned) <= SyncState::COUNT_MASK);

        let mut word = u32::from(sync.idle) << (4 + SyncState::COUNT_BITS);
        word |= u32::from(sync.spawned) << 4;
        if sync.notified {
            word |= 0b1000;
        }
        word | match sync.state {
            SyncStatus::Pending => 0,
            SyncStatus::Notified => 1,
            SyncStatus::Waking => 2,
            SyncStatus::WakerNotified => 3,
            SyncStatus::Shutdown => 4,
        }
    }
}

// -----------------------------------------------------------------------------
// Pool

/// A work-stealing task pool.
///
/// Pools are stack-allocated by [`Pool::run`] and live exactly as long as
/// that call: the calling thread becomes the first worker, additional
/// workers are spawned on demand up to the configured cap, and `run` returns
/// once [`Pool::shutdown`] has been observed by every worker.
pub struct Pool {
    max_threads: u16,
    stack_size: usize,
    /// The packed [`SyncState`] word. Its address doubles as the parking-lot key
    /// for idle workers.
    sync: AtomicU32,
    /// Global queue; the injection point for batches and overflow of last
    /// resort.
    run_queue: Injector,
    /// Every worker that ever registered, most recent first. Append-only,
    /// traversed concurrently by stealers.
    active_queue: AtomicPtr<Worker>,
}

impl Pool {
    /// Runs `f` as the first task of a new pool, on the calling thread, and
    /// returns once the pool has shut down and every worker has unwound.
    ///
    /// `f` does not need to be `'static`: the shutdown barrier guarantees it
    /// has finished (and every worker has stopped touching this frame)
    /// before `run` returns. Something must eventually call
    /// [`Pool::shutdown`], typically a task that knows the work is done.
    pub fn run<F>(config: Config, f: F)
    where
        F: FnOnce(&Worker) + Send,
    {
        let pool = Pool {
            max_threads: resolved_max_threads(&config),
            stack_size: resolved_stack_size(&config),
            sync: AtomicU32::new(0),
            run_queue: Injector::new(),
            active_queue: AtomicPtr::new(ptr::null_mut()),
        };
        debug!(max_threads = pool.max_threads, "pool starting");

        let root = StackTask::new(f);
        let mut batch = Batch::new();
        // SAFETY: the root task lives in this frame, is scheduled once, and
        // `run` does not return until the pool has executed it and every
        // worker has passed the shutdown barrier.
        unsafe { batch.push(root.as_task()) };
        // The first notify consumes the calling thread as the root worker
        // and only returns once the pool is torn down.
        unsafe { pool.schedule(batch) };
        debug!("pool finished");
    }

    /// Schedules a batch through the global queue and wakes a worker for it.
    ///
    /// # Safety
    ///
    /// The batched tasks must stay valid until executed, and each must have
    /// been scheduled exactly once.
    pub unsafe fn schedule(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        unsafe { self.run_queue.push(batch) };
        self.notify(false);
    }

    /// Requests shutdown: wakes every parked worker and lets the pool drain.
    /// Tasks still queued when the workers observe the request are never
    /// executed. Idempotent.
    pub fn shutdown(&self) {
        let transitioned = self
            .sync
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |word| {
                let mut sync = SyncState::from(word);
                if sync.state == SyncStatus::Shutdown {
                    return None;
                }
                sync.state = SyncStatus::Shutdown;
                sync.notified = false;
                Some(sync.into())
            });
        if transitioned.is_ok() {
            debug!("pool shutting down");
            parking::unpark_all(self.sync_address(), parking::DEFAULT_UNPARK_TOKEN);
        }
    }

    fn sync_address(&self) -> usize {
        &self.sync as *const AtomicU32 as usize
    }

    /// Ensures a worker is awake (or newly spawned) to pick up posted work.
    /// Returns `false` once the pool has shut down.
    ///
    /// `is_waking` marks the caller as the current waking worker, which may
    /// always promote a successor; other callers only wake someone from the
    /// `Pending` state and otherwise leave an annotation for the next
    /// lifecycle transition to claim.
    pub(crate) fn notify(&self, is_waking: bool) -> bool {
        let update = self
            .sync
            .fetch_update(Ordering::Release, Ordering::Relaxed, |word| {
                let mut sync = SyncState::from(word);
                if sync.state == SyncStatus::Shutdown {
                    return None;
                }
                if is_waking {
                    debug_assert!(matches!(
                        sync.state,
                        SyncStatus::Waking | SyncStatus::WakerNotified
                    ));
                }

                let can_wake = sync.idle > 0 || sync.spawned < self.max_threads;
                if can_wake && (is_waking || sync.state == SyncStatus::Pending) {
                    sync.state = SyncStatus::Waking;
                    if sync.idle > 0 {
                        sync.idle -= 1;
                        sync.notified = true;
                    } else {
                        sync.spawned += 1;
                    }
                } else if is_waking {
                    // Nothing to promote; the waking role retires.
                    sync.state = match sync.state {
                        SyncStatus::WakerNotified => SyncStatus::Notified,
                        _ => SyncStatus::Pending,
                    };
                } else {
                    sync.state = match sync.state {
                        SyncStatus::Pending => SyncStatus::Notified,
                        SyncStatus::Waking => SyncStatus::WakerNotified,
                        other => other,
                    };
                }
                Some(sync.into())
            });

        let Ok(word) = update else {
            return false;
        };

        let sync = SyncState::from(word);
        let can_wake = sync.idle > 0 || sync.spawned < self.max_threads;
        if can_wake && (is_waking || sync.state == SyncStatus::Pending) {
            if sync.idle > 0 {
                parking::unpark_one(self.sync_address(), |_| parking::DEFAULT_UNPARK_TOKEN);
            } else if sync.spawned == 0 {
                // The very first worker runs on the calling thread.
                Worker::run(self);
            } else {
                self.spawn_worker();
            }
        }
        true
    }

    /// Parks the worker until new work is signalled. Returns the worker's
    /// next waking role, or `None` once the pool has shut down (after the
    /// quiescence barrier has completed).
    pub(crate) fn wait(&self, worker: &Worker, is_waking: bool) -> Option<bool> {
        let mut is_waking = is_waking;
        loop {
            // Try to consume a posted notification.
            let consumed = self
                .sync
                .fetch_update(Ordering::Acquire, Ordering::Relaxed, |word| {
                    let mut sync = SyncState::from(word);
                    if sync.state == SyncStatus::Shutdown {
                        return None;
                    }
                    let notified = sync.notified
                        || sync.state == SyncStatus::Notified
                        || (sync.state == SyncStatus::WakerNotified && is_waking);
                    if !notified {
                        return None;
                    }
                    sync.notified = false;
                    sync.state = match sync.state {
                        SyncStatus::Notified | SyncStatus::WakerNotified => SyncStatus::Waking,
                        other => other,
                    };
                    Some(sync.into())
                });

            match consumed {
                Ok(word) => {
                    let sync = SyncState::from(word);
                    // Claiming a posted wake takes over the waking role.
                    let waking = is_waking
                        || matches!(sync.state, SyncStatus::Notified | SyncStatus::WakerNotified)
                        || (sync.notified && sync.state == SyncStatus::Waking);
                    return Some(waking);
                }
                Err(word) if SyncState::from(word).state == SyncStatus::Shutdown => {
                    self.join_shutdown(worker);
                    return None;
                }
                Err(_) => {}
            }

            // Nothing posted; advertise idleness and park. The waking role,
            // if held, is relinquished here.
            let advertised = self
                .sync
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |word| {
                    let mut sync = SyncState::from(word);
                    if sync.state == SyncStatus::Shutdown {
                        return None;
                    }
                    if sync.notified
                        || sync.state == SyncStatus::Notified
                        || (sync.state == SyncStatus::WakerNotified && is_waking)
                    {
                        // A notification landed since the consume attempt.
                        return None;
                    }
                    if is_waking {
                        let can_wake = sync.idle > 0 || sync.spawned < self.max_threads;
                        sync.state = if can_wake {
                            SyncStatus::Pending
                        } else {
                            SyncStatus::Notified
                        };
                    }
                    sync.idle += 1;
                    Some(sync.into())
                });

            match advertised {
                Ok(_) => {
                    is_waking = false;
                    self.idle_wait();
                }
                Err(word) if SyncState::from(word).state == SyncStatus::Shutdown => {
                    self.join_shutdown(worker);
                    return None;
                }
                Err(_) => {}
            }
        }
    }

    /// Parks on the sync word's address. The validation aborts the park when
    /// a shutdown or an unclaimed notification is already posted, closing
    /// the window between advertising idleness and actually sleeping.
    #[cold]
    fn idle_wait(&self) {
        parking::park(
            self.sync_address(),
            || {
                let sync = SyncState::from(self.sync.load(Ordering::Relaxed));
                if sync.state == SyncStatus::Shutdown
                    || sync.state == SyncStatus::Notified
                    || sync.notified
                {
                    None
                } else {
                    Some(ParkToken(0))
                }
            },
            || {},
            |_, _| {},
            None,
        );
    }

    /// The two-phase quiescence barrier. Non-root workers check out and then
    /// hold their frames until the root confirms every worker has checked
    /// out; the root waits for that, then releases them. This keeps the
    /// pool's (and every worker's) stack frame alive until nothing can
    /// reference it anymore.
    #[cold]
    fn join_shutdown(&self, worker: &Worker) {
        trace!("worker joining shutdown barrier");
        let word = self
            .sync
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |word| {
                let mut sync = SyncState::from(word);
                sync.spawned -= 1;
                Some(sync.into())
            })
            .unwrap_or_else(|word| word);
        if SyncState::from(word).spawned == 1 {
            // Last one out wakes whoever waits on the barrier.
            parking::unpark_all(self.sync_address(), parking::DEFAULT_UNPARK_TOKEN);
        }

        if worker.is_root() {
            loop {
                let sync = SyncState::from(self.sync.load(Ordering::Acquire));
                if sync.spawned == 0 {
                    break;
                }
                parking::park(
                    self.sync_address(),
                    || {
                        let sync = SyncState::from(self.sync.load(Ordering::Relaxed));
                        if sync.spawned == 0 {
                            None
                        } else {
                            Some(ParkToken(0))
                        }
                    },
                    || {},
                    |_, _| {},
                    None,
                );
            }
            // Release the non-root workers still pinning this frame.
            let _ = self
                .sync
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |word| {
                    let mut sync = SyncState::from(word);
                    sync.notified = true;
                    Some(sync.into())
                });
            parking::unpark_all(self.sync_address(), parking::DEFAULT_UNPARK_TOKEN);
        } else {
            loop {
                let sync = SyncState::from(self.sync.load(Ordering::Acquire));
                if sync.notified {
                    break;
                }
                parking::park(
                    self.sync_address(),
                    || {
                        let sync = SyncState::from(self.sync.load(Ordering::Relaxed));
                        if sync.notified {
                            None
                        } else {
                            Some(ParkToken(0))
                        }
                    },
                    || {},
                    |_, _| {},
                    None,
                );
            }
        }
    }

    /// Spawns a worker thread for an already-reserved `spawned` slot,
    /// retrying with pause back-off. If every attempt fails, the slot is
    /// returned and queued work waits for the next schedule.
    #[cold]
    fn spawn_worker(&self) {
        #[derive(Copy, Clone)]
        struct PoolRef(NonNull<Pool>);
        // SAFETY: the pointee outlives the worker thread; workers hold the
        // shutdown barrier open until they stop touching the pool.
        unsafe impl Send for PoolRef {}

        const SPAWN_ATTEMPTS: u32 = 5;

        let pool_ref = PoolRef(NonNull::from(self));
        for attempt in 0..SPAWN_ATTEMPTS {
            let spawned = thread::Builder::new()
                .name("presto-worker".into())
                .stack_size(self.stack_size)
                .spawn(move || {
                    let pool_ref = pool_ref;
                    // SAFETY: see `PoolRef`.
                    Worker::run(unsafe { pool_ref.0.as_ref() });
                });
            match spawned {
                Ok(handle) => {
                    // Workers are joined through the shutdown barrier, not
                    // the thread handle.
                    drop(handle);
                    return;
                }
                Err(error) => {
                    debug!(%error, attempt, "worker thread spawn failed");
                    for _ in 0..(1u32 << attempt) {
                        core::hint::spin_loop();
                    }
                }
            }
        }

        let _ = self
            .sync
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |word| {
                let mut sync = SyncState::from(word);
                sync.spawned -= 1;
                if sync.state == SyncStatus::Waking {
                    sync.state = SyncStatus::Pending;
                }
                Some(sync.into())
            });
    }
}

// -----------------------------------------------------------------------------
// Worker

/// Polling cadence for the global queue: every 61st poll starts from the
/// global end so injected work cannot starve behind local queues.
const GLOBAL_POLL_INTERVAL: usize = 61;

/// Scheduling hints for [`Worker::schedule`] and [`Worker::spawn_with`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScheduleHint {
    /// Run before anything else on this worker. A displaced occupant of the
    /// next slot moves to the FIFO queue.
    Next,
    /// Run next unless another worker steals it first; good for cache-hot
    /// continuations.
    Lifo,
    /// Join the back of this worker's queue.
    Fifo,
    /// Let one already-queued task go first, then run.
    Yield,
}

/// A worker thread's execution context, handed to every task it runs.
///
/// Workers own their local queues; other workers see them only to steal.
pub struct Worker {
    pool: NonNull<Pool>,
    /// Bounded FIFO ring.
    run_queue: Buffer,
    /// Owner-only slot for `ScheduleHint::Next`.
    run_queue_next: Cell<Option<NonNull<Task>>>,
    /// Stealable slot for `ScheduleHint::Lifo`.
    run_queue_lifo: AtomicPtr<Task>,
    /// Overflow for the bounded ring.
    run_queue_overflow: Injector,
    /// Link in the pool's active list. Null on the first-registered worker.
    active_next: AtomicPtr<Worker>,
    /// Persistent cursor into the active list for stealing.
    steal_target: Cell<*const Worker>,
}

// SAFETY: stealers traverse the active list and touch only the atomic
// queues; the `Cell` fields belong to the owning thread alone.
unsafe impl Sync for Worker {}

impl Worker {
    /// Registers a worker on `pool` and polls until shutdown. The worker
    /// lives on this thread's stack; the shutdown barrier keeps it valid for
    /// as long as any other worker might steal from it.
    pub(crate) fn run(pool: &Pool) {
        let worker = Worker {
            pool: NonNull::from(pool),
            run_queue: Buffer::new(),
            run_queue_next: Cell::new(None),
            run_queue_lifo: AtomicPtr::new(ptr::null_mut()),
            run_queue_overflow: Injector::new(),
            active_next: AtomicPtr::new(ptr::null_mut()),
            steal_target: Cell::new(ptr::null()),
        };
        worker.register(pool);
        trace!("worker running");

        let mut tick = 0usize;
        // Whoever resumed this worker moved the state machine to `Waking` on
        // its behalf.
        let mut is_waking = true;
        loop {
            match worker.poll(tick) {
                Some(popped) => {
                    if is_waking || popped.pushed > 0 {
                        // Found work: promote a successor before running it.
                        pool.notify(is_waking);
                        is_waking = false;
                    }
                    tick = tick.wrapping_add(1);
                    worker.execute(popped.task);
                }
                None => match pool.wait(&worker, is_waking) {
                    Some(waking) => is_waking = waking,
                    None => break,
                },
            }
        }
        trace!("worker exiting");
    }

    fn register(&self, pool: &Pool) {
        let mut head = pool.active_queue.load(Ordering::Relaxed);
        loop {
            self.active_next.store(head, Ordering::Relaxed);
            let this = self as *const Worker as *mut Worker;
            match pool.active_queue.compare_exchange_weak(
                head,
                this,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(new_head) => head = new_head,
            }
        }
    }

    /// The first-registered worker anchors the active list and plays the
    /// root role in the shutdown barrier.
    fn is_root(&self) -> bool {
        self.active_next.load(Ordering::Relaxed).is_null()
    }

    /// The pool this worker belongs to.
    pub fn pool(&self) -> &Pool {
        // SAFETY: workers only exist within `Pool::run`, whose shutdown
        // barrier keeps the pool frame alive until every worker is gone.
        unsafe { self.pool.as_ref() }
    }

    /// Spawns a closure onto this worker's FIFO queue.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        self.spawn_with(ScheduleHint::Fifo, f)
    }

    /// Spawns a closure with an explicit scheduling hint.
    pub fn spawn_with<F>(&self, hint: ScheduleHint, f: F)
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        let task = HeapTask::spawn(f);
        // SAFETY: the heap task stays valid until executed and is scheduled
        // exactly once, here.
        unsafe { self.schedule(hint, task) };
    }

    /// Schedules an embedded task on this worker.
    ///
    /// # Safety
    ///
    /// `task` must stay valid until executed, must be scheduled exactly
    /// once, and must not be queued anywhere else.
    pub unsafe fn schedule(&self, hint: ScheduleHint, task: NonNull<Task>) {
        unsafe { self.enqueue(hint, task) };
        self.pool().notify(false);
    }

    /// Schedules a batch of embedded tasks FIFO on this worker.
    ///
    /// # Safety
    ///
    /// As for [`Worker::schedule`], for every task in the batch.
    pub unsafe fn schedule_batch(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        unsafe { self.push_batch(batch) };
        self.pool().notify(false);
    }

    unsafe fn enqueue(&self, hint: ScheduleHint, task: NonNull<Task>) {
        match hint {
            ScheduleHint::Next => {
                if let Some(displaced) = self.run_queue_next.replace(Some(task)) {
                    unsafe { self.push_fifo(displaced) };
                }
            }
            ScheduleHint::Lifo => {
                let displaced = self.run_queue_lifo.swap(task.as_ptr(), Ordering::AcqRel);
                if let Some(displaced) = NonNull::new(displaced) {
                    unsafe { self.push_fifo(displaced) };
                }
            }
            ScheduleHint::Fifo => unsafe { self.push_fifo(task) },
            ScheduleHint::Yield => match self.run_queue.pop() {
                // Let one queued task go first; the yielded task lines up
                // behind it.
                Some(front) => {
                    unsafe { self.push_fifo(task) };
                    unsafe { self.enqueue(ScheduleHint::Next, front) };
                }
                None => unsafe { self.enqueue(ScheduleHint::Next, task) },
            },
        }
    }

    unsafe fn push_fifo(&self, task: NonNull<Task>) {
        let mut batch = Batch::new();
        unsafe { batch.push(task) };
        unsafe { self.push_batch(batch) };
    }

    unsafe fn push_batch(&self, mut batch: Batch) {
        // SAFETY: this worker is the ring's single producer.
        if let Some(overflow) = unsafe { self.run_queue.push(&mut batch) } {
            unsafe { self.run_queue_overflow.push(overflow) };
        }
    }

    /// Finds the next task to run, in priority order: (periodically) the
    /// global end, the next slot, the LIFO slot, the local ring, local
    /// overflow, the global queue, stealing, and the global queue once more.
    fn poll(&self, tick: usize) -> Option<Popped> {
        let pool = self.pool();

        if tick % GLOBAL_POLL_INTERVAL == 0 {
            if let Some(popped) = self.run_queue.consume(&pool.run_queue) {
                return Some(popped);
            }
            if let Some(popped) = self.run_queue.consume(&self.run_queue_overflow) {
                return Some(popped);
            }
        }

        if let Some(task) = self.run_queue_next.take() {
            return Some(Popped { task, pushed: 0 });
        }

        if !self.run_queue_lifo.load(Ordering::Relaxed).is_null() {
            let task = self.run_queue_lifo.swap(ptr::null_mut(), Ordering::Acquire);
            if let Some(task) = NonNull::new(task) {
                return Some(Popped { task, pushed: 0 });
            }
        }

        if let Some(task) = self.run_queue.pop() {
            return Some(Popped { task, pushed: 0 });
        }

        if let Some(popped) = self.run_queue.consume(&self.run_queue_overflow) {
            return Some(popped);
        }
        if let Some(popped) = self.run_queue.consume(&pool.run_queue) {
            return Some(popped);
        }

        if let Some(popped) = self.steal(pool) {
            return Some(popped);
        }

        self.run_queue.consume(&pool.run_queue)
    }

    /// Walks the active list from the persistent cursor, skipping this
    /// worker, trying each victim's ring, overflow queue, and LIFO slot.
    #[cold]
    fn steal(&self, pool: &Pool) -> Option<Popped> {
        let head = pool.active_queue.load(Ordering::Acquire);
        let mut start = self.steal_target.get();
        if start.is_null() {
            start = head;
        }

        let mut cursor = start;
        let mut wrapped = false;
        loop {
            if cursor.is_null() {
                if wrapped {
                    break;
                }
                wrapped = true;
                cursor = head;
                continue;
            }
            if wrapped && ptr::eq(cursor, start) {
                break;
            }

            // SAFETY: the active list holds only workers that have not yet
            // passed the shutdown barrier; polling stops before it.
            let victim = unsafe { &*cursor };
            if !ptr::eq(victim, self) {
                let popped = self
                    .run_queue
                    .steal(&victim.run_queue)
                    .or_else(|| self.run_queue.consume(&victim.run_queue_overflow))
                    .or_else(|| self.steal_lifo(victim));
                if let Some(popped) = popped {
                    self.steal_target.set(cursor);
                    return Some(popped);
                }
            }
            cursor = victim.active_next.load(Ordering::Acquire);
        }

        self.steal_target.set(ptr::null());
        None
    }

    fn steal_lifo(&self, victim: &Worker) -> Option<Popped> {
        if victim.run_queue_lifo.load(Ordering::Relaxed).is_null() {
            return None;
        }
        let task = victim.run_queue_lifo.swap(ptr::null_mut(), Ordering::Acquire);
        let task = NonNull::new(task)?;
        Some(Popped { task, pushed: 0 })
    }

    fn execute(&self, task: NonNull<Task>) {
        // SAFETY: the queues hand out every scheduled task exactly once.
        if let Err(payload) = unwind::halt_unwinding(|| unsafe { Task::run(task, self) }) {
            // A panicking task must not take its worker down with it.
            error!(
                panic = unwind::payload_message(&*payload),
                "task panicked"
            );
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_word_roundtrip() {
        let cases = [
            SyncState {
                state: SyncStatus::Pending,
                notified: false,
                idle: 0,
                spawned: 0,
            },
            SyncState {
                state: SyncStatus::Notified,
                notified: true,
                idle: 3,
                spawned: 7,
            },
            SyncState {
                state: SyncStatus::Waking,
                notified: false,
                idle: SyncState::COUNT_MASK as u16,
                spawned: 1,
            },
            SyncState {
                state: SyncStatus::WakerNotified,
                notified: true,
                idle: 0,
                spawned: SyncState::COUNT_MASK as u16,
            },
            SyncState {
                state: SyncStatus::Shutdown,
                notified: false,
                idle: 11,
                spawned: 12,
            },
        ];
        for case in cases {
            let word: u32 = case.into();
            let back = SyncState::from(word);
            assert_eq!(back.state, case.state);
            assert_eq!(back.notified, case.notified);
            assert_eq!(back.idle, case.idle);
            assert_eq!(back.spawned, case.spawned);
        }
    }

    #[test]
    fn config_clamps() {
        let config = Config::new();
        assert!(resolved_max_threads(&config) >= 1);
        assert_eq!(resolved_stack_size(&config), DEFAULT_STACK_SIZE as usize);

        let config = Config::new().stack_size(1);
        assert_eq!(resolved_stack_size(&config), MIN_STACK_SIZE as usize);

        let config = Config::new().max_threads(NonZeroU16::new(4).unwrap());
        assert_eq!(resolved_max_threads(&config), 4);
    }
}
