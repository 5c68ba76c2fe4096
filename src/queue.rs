//! Worker run queues: a bounded single-producer ring that other workers can
//! steal from, and an unbounded multi-producer list used for overflow and
//! global injection.
//!
//! The ring indices are free-running `usize` counters compared with wrapping
//! arithmetic; occupancy is `tail - head` under modular subtraction and a
//! slot index is the counter modulo the capacity. Stealers may observe stale
//! sizes, but every transfer is committed with a compare-and-swap on the
//! victim's head, so a task pointer is never handed out twice.

use core::hint::spin_loop;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::task::{Batch, Task};
use crate::thread_pool::Worker;

/// A task dequeued from any of the queues, along with how many extra tasks
/// the operation moved into the caller's buffer. A nonzero count means the
/// caller now has work worth advertising.
pub(crate) struct Popped {
    pub task: NonNull<Task>,
    pub pushed: usize,
}

// -----------------------------------------------------------------------------
// Bounded ring

pub(crate) struct Buffer {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: [AtomicPtr<Task>; Self::CAPACITY],
}

impl Buffer {
    pub const CAPACITY: usize = 256;

    pub const fn new() -> Buffer {
        Buffer {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots: [const { AtomicPtr::new(ptr::null_mut()) }; Self::CAPACITY],
        }
    }

    #[cfg(test)]
    fn with_start_index(index: usize) -> Buffer {
        let buffer = Buffer::new();
        buffer.head.store(index, Ordering::Relaxed);
        buffer.tail.store(index, Ordering::Relaxed);
        buffer
    }

    fn write(&self, index: usize, task: NonNull<Task>) {
        self.slots[index % Self::CAPACITY].store(task.as_ptr(), Ordering::Relaxed);
    }

    fn read(&self, index: usize) -> NonNull<Task> {
        let task = self.slots[index % Self::CAPACITY].load(Ordering::Relaxed);
        NonNull::new(task).expect("empty run queue slot")
    }

    /// Pushes a batch of tasks, consuming as many as fit. When the ring is
    /// full, half of it is migrated out and returned, spliced together with
    /// whatever remains of `batch`; the caller forwards that overflow to its
    /// unbounded queue.
    ///
    /// # Safety
    ///
    /// Only the owning worker may call this.
    pub unsafe fn push(&self, batch: &mut Batch) -> Option<Batch> {
        loop {
            if batch.is_empty() {
                return None;
            }

            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Relaxed);
            let size = tail.wrapping_sub(head);
            debug_assert!(size <= Self::CAPACITY);

            if size < Self::CAPACITY {
                let mut new_tail = tail;
                while new_tail.wrapping_sub(head) < Self::CAPACITY {
                    let Some(task) = batch.pop() else { break };
                    self.write(new_tail, task);
                    new_tail = new_tail.wrapping_add(1);
                }
                if new_tail != tail {
                    self.tail.store(new_tail, Ordering::Release);
                }
                continue;
            }

            // Full. Claim the older half; the acquire pairs with stealers'
            // head updates so the slot reads below see settled pointers.
            let migrate = Self::CAPACITY / 2;
            if self
                .head
                .compare_exchange(
                    head,
                    head.wrapping_add(migrate),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                // A stealer freed space; retry the fast path.
                continue;
            }

            let mut overflow = Batch::new();
            for offset in 0..migrate {
                // SAFETY: the head CAS transferred these slots to us.
                unsafe { overflow.push(self.read(head.wrapping_add(offset))) };
            }
            overflow.append(mem::take(batch));
            return Some(overflow);
        }
    }

    /// Owner-side pop of the oldest task.
    pub fn pop(&self) -> Option<NonNull<Task>> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            if tail.wrapping_sub(head) == 0 {
                return None;
            }
            match self.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(self.read(head)),
                Err(new_head) => head = new_head,
            }
        }
    }

    /// Steals half of `victim`'s tasks into this (empty) buffer, returning
    /// the first directly. A single steal moves at most half the victim's
    /// size and at most half the local capacity.
    pub fn steal(&self, victim: &Buffer) -> Option<Popped> {
        loop {
            let victim_head = victim.head.load(Ordering::Acquire);
            let victim_tail = victim.tail.load(Ordering::Acquire);

            let size = victim_tail.wrapping_sub(victim_head);
            if size == 0 {
                return None;
            }
            if size > Self::CAPACITY {
                // Torn read while the victim migrates; try again.
                spin_loop();
                continue;
            }

            let grab = (size - size / 2).min(Self::CAPACITY / 2);

            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Relaxed);
            debug_assert_eq!(tail.wrapping_sub(head), 0);

            let new_tail = (0..grab).fold(tail, |new_tail, offset| {
                self.write(new_tail, victim.read(victim_head.wrapping_add(offset)));
                new_tail.wrapping_add(1)
            });

            if victim
                .head
                .compare_exchange(
                    victim_head,
                    victim_head.wrapping_add(grab),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                spin_loop();
                continue;
            }

            // The newest copied task is returned directly instead of being
            // published in the buffer.
            let new_tail = new_tail.wrapping_sub(1);
            if new_tail != tail {
                self.tail.store(new_tail, Ordering::Release);
            }
            return Some(Popped {
                task: self.read(new_tail),
                pushed: new_tail.wrapping_sub(tail),
            });
        }
    }

    /// Drains an unbounded queue into this buffer's free space, returning the
    /// first task directly. Fails when another thread holds the queue's
    /// consumer token or the queue is empty.
    pub fn consume(&self, injector: &Injector) -> Option<Popped> {
        let mut consumer = injector.try_consume()?;
        let first = consumer.pop()?;

        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let size = tail.wrapping_sub(head);
        debug_assert!(size <= Self::CAPACITY);

        let mut new_tail = tail;
        let mut free = Self::CAPACITY - size;
        while free > 0 {
            let Some(task) = consumer.pop() else { break };
            self.write(new_tail, task);
            new_tail = new_tail.wrapping_add(1);
            free -= 1;
        }
        if new_tail != tail {
            self.tail.store(new_tail, Ordering::Release);
        }
        Some(Popped {
            task: first,
            pushed: new_tail.wrapping_sub(tail),
        })
    }
}

// -----------------------------------------------------------------------------
// Unbounded injector

/// An intrusive multi-producer queue with an embedded stub node and a single
/// consumer at a time, enforced by a flag bit carried in the head word.
pub(crate) struct Injector {
    /// Consumer-side cursor, tagged with [`Injector::CONSUMING`] while a
    /// consumer holds the queue. Zero means "start from the stub".
    head: AtomicUsize,
    /// Producer-side pointer to the most recently pushed task.
    tail: AtomicPtr<Task>,
    stub: Task,
}

unsafe fn stub_run(_: NonNull<Task>, _: &Worker) {
    unreachable!("stub task executed")
}

impl Injector {
    const CONSUMING: usize = 0b1;

    pub const fn new() -> Injector {
        Injector {
            head: AtomicUsize::new(0),
            tail: AtomicPtr::new(ptr::null_mut()),
            stub: Task::new(stub_run),
        }
    }

    fn stub(&self) -> NonNull<Task> {
        NonNull::from(&self.stub)
    }

    /// Appends a batch. Safe to call from any number of threads at once.
    ///
    /// # Safety
    ///
    /// The batched tasks must remain valid until executed. The queue must not
    /// have been moved since it was first pushed to; the stub node's address
    /// is part of the queue structure.
    pub unsafe fn push(&self, batch: Batch) {
        let Some((head, tail)) = batch.ends() else {
            return;
        };
        unsafe { self.push_run(head, tail) };
    }

    unsafe fn push_run(&self, head: NonNull<Task>, tail: NonNull<Task>) {
        unsafe { tail.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed) };
        let prev = self.tail.swap(tail.as_ptr(), Ordering::AcqRel);
        let prev = NonNull::new(prev).unwrap_or_else(|| self.stub());
        unsafe { prev.as_ref().next.store(head.as_ptr(), Ordering::Release) };
    }

    /// Claims the consumer side, failing if it is already held or the queue
    /// is observably empty.
    pub fn try_consume(&self) -> Option<Consumer<'_>> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail.is_null() || ptr::eq(tail, &self.stub) {
                return None;
            }

            let head = self.head.load(Ordering::Relaxed);
            if head & Self::CONSUMING != 0 {
                return None;
            }

            if self
                .head
                .compare_exchange(
                    head,
                    head | Self::CONSUMING,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let head = NonNull::new(head as *mut Task).unwrap_or_else(|| self.stub());
                return Some(Consumer {
                    injector: self,
                    head,
                });
            }
        }
    }
}

/// Exclusive consumer access to an [`Injector`]. Dropping it releases the
/// queue for the next consumer.
pub(crate) struct Consumer<'a> {
    injector: &'a Injector,
    head: NonNull<Task>,
}

impl Consumer<'_> {
    /// Pops the oldest task. `None` means the queue is drained, up to a
    /// transient window where a producer has swapped the tail but not yet
    /// linked its run.
    pub fn pop(&mut self) -> Option<NonNull<Task>> {
        unsafe {
            let stub = self.injector.stub();
            if self.head == stub {
                let next = self.head.as_ref().next.load(Ordering::Acquire);
                self.head = NonNull::new(next)?;
            }

            let next = self.head.as_ref().next.load(Ordering::Acquire);
            if let Some(next) = NonNull::new(next) {
                return Some(mem::replace(&mut self.head, next));
            }

            // The cursor is on the last linked node. Only take it once the
            // tail agrees it is the final one, and close the ring with the
            // stub first so producers always have a predecessor.
            let tail = self.injector.tail.load(Ordering::Acquire);
            if Some(self.head) != NonNull::new(tail) {
                return None;
            }

            self.injector.push_run(stub, stub);

            let next = self.head.as_ref().next.load(Ordering::Acquire);
            let next = NonNull::new(next)?;
            Some(mem::replace(&mut self.head, next))
        }
    }
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        let head = self.head.as_ptr() as usize;
        debug_assert_eq!(head & Injector::CONSUMING, 0);
        self.injector.head.store(head, Ordering::Release);
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn nop(_: NonNull<Task>, _: &Worker) {}

    fn tasks(count: usize) -> Vec<Task> {
        (0..count).map(|_| Task::new(nop)).collect()
    }

    fn batch_of(tasks: &[Task]) -> Batch {
        let mut batch = Batch::new();
        for task in tasks {
            unsafe { batch.push(NonNull::from(task)) };
        }
        batch
    }

    #[test]
    fn buffer_push_then_pop() {
        let tasks = tasks(3);
        let buffer = Buffer::new();
        let mut batch = batch_of(&tasks);
        assert!(unsafe { buffer.push(&mut batch) }.is_none());

        for task in &tasks {
            assert_eq!(buffer.pop(), Some(NonNull::from(task)));
        }
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn buffer_overflows_half() {
        let tasks = tasks(512);
        let buffer = Buffer::new();
        let mut batch = batch_of(&tasks);

        let mut overflow = unsafe { buffer.push(&mut batch) }.expect("push must overflow");
        assert!(batch.is_empty());

        // Half the ring migrates out, followed by everything that never fit.
        assert_eq!(overflow.len(), 128 + 256);
        for task in tasks.iter().take(128) {
            assert_eq!(overflow.pop(), Some(NonNull::from(task)));
        }
        for task in tasks.iter().skip(256) {
            assert_eq!(overflow.pop(), Some(NonNull::from(task)));
        }

        // The ring keeps the newer half of what it held.
        for task in tasks.iter().skip(128).take(128) {
            assert_eq!(buffer.pop(), Some(NonNull::from(task)));
        }
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn buffer_indices_wrap() {
        let tasks = tasks(Buffer::CAPACITY);
        let buffer = Buffer::with_start_index(usize::MAX - 64);
        let mut batch = batch_of(&tasks);
        assert!(unsafe { buffer.push(&mut batch) }.is_none());

        for task in &tasks {
            assert_eq!(buffer.pop(), Some(NonNull::from(task)));
        }
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn steal_takes_half() {
        let tasks = tasks(8);
        let victim = Buffer::new();
        let thief = Buffer::new();
        let mut batch = batch_of(&tasks);
        assert!(unsafe { victim.push(&mut batch) }.is_none());

        let popped = thief.steal(&victim).expect("victim is non-empty");
        assert_eq!(popped.task, NonNull::from(&tasks[3]));
        assert_eq!(popped.pushed, 3);

        for task in tasks.iter().take(3) {
            assert_eq!(thief.pop(), Some(NonNull::from(task)));
        }
        assert!(thief.pop().is_none());
        for task in tasks.iter().skip(4) {
            assert_eq!(victim.pop(), Some(NonNull::from(task)));
        }
        assert!(victim.pop().is_none());
    }

    #[test]
    fn steal_respects_ceiling() {
        let tasks = tasks(Buffer::CAPACITY);
        let victim = Buffer::new();
        let thief = Buffer::new();
        let mut batch = batch_of(&tasks);
        assert!(unsafe { victim.push(&mut batch) }.is_none());

        let popped = thief.steal(&victim).expect("victim is non-empty");
        assert_eq!(popped.pushed + 1, Buffer::CAPACITY / 2);
    }

    #[test]
    fn steal_empty_victim() {
        let victim = Buffer::new();
        let thief = Buffer::new();
        assert!(thief.steal(&victim).is_none());
    }

    #[test]
    fn injector_is_fifo() {
        let tasks = tasks(3);
        let injector = Injector::new();
        unsafe { injector.push(batch_of(&tasks[..2])) };
        unsafe { injector.push(batch_of(&tasks[2..])) };

        let mut consumer = injector.try_consume().expect("queue is non-empty");
        for task in &tasks {
            assert_eq!(consumer.pop(), Some(NonNull::from(task)));
        }
        assert!(consumer.pop().is_none());
        drop(consumer);

        assert!(injector.try_consume().is_none());
    }

    #[test]
    fn injector_single_consumer() {
        let tasks = tasks(2);
        let injector = Injector::new();
        unsafe { injector.push(batch_of(&tasks)) };

        let mut first = injector.try_consume().expect("queue is non-empty");
        assert!(first.pop().is_some());
        assert!(injector.try_consume().is_none());
        drop(first);

        let mut second = injector.try_consume().expect("one task remains");
        assert_eq!(second.pop(), Some(NonNull::from(&tasks[1])));
    }

    #[test]
    fn injector_refills_after_drain() {
        let tasks = tasks(4);
        let injector = Injector::new();
        unsafe { injector.push(batch_of(&tasks[..2])) };
        {
            let mut consumer = injector.try_consume().unwrap();
            while consumer.pop().is_some() {}
        }
        unsafe { injector.push(batch_of(&tasks[2..])) };
        let mut consumer = injector.try_consume().expect("refilled");
        assert_eq!(consumer.pop(), Some(NonNull::from(&tasks[2])));
        assert_eq!(consumer.pop(), Some(NonNull::from(&tasks[3])));
        assert!(consumer.pop().is_none());
    }

    #[test]
    fn buffer_consumes_injector() {
        let tasks = tasks(5);
        let injector = Injector::new();
        let buffer = Buffer::new();
        unsafe { injector.push(batch_of(&tasks)) };

        let popped = buffer.consume(&injector).expect("queue is non-empty");
        assert_eq!(popped.task, NonNull::from(&tasks[0]));
        assert_eq!(popped.pushed, 4);
        for task in tasks.iter().skip(1) {
            assert_eq!(buffer.pop(), Some(NonNull::from(task)));
        }
    }
}
