//! Multi-threaded behavior tests for the parking lot.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use presto::{nanotime, park, unpark_all, unpark_one, ParkResult, ParkToken, UnparkToken};

fn wait_for(flag: &AtomicBool) {
    while !flag.load(Ordering::Acquire) {
        thread::yield_now();
    }
}

/// Parks a thread on `address` and reports through `queued` once the waiter
/// is in the queue.
fn spawn_parker(address: usize, queued: &Arc<AtomicBool>) -> thread::JoinHandle<ParkResult> {
    let queued = Arc::clone(queued);
    thread::spawn(move || {
        park(
            address,
            || Some(ParkToken(0)),
            move || queued.store(true, Ordering::Release),
            |_, _| {},
            None,
        )
    })
}

#[test]
fn invalidated_park_never_queues() {
    static TARGET: AtomicUsize = AtomicUsize::new(0);
    let address = &TARGET as *const _ as usize;

    let result = park(
        address,
        || None,
        || panic!("before_sleep ran after failed validation"),
        |_, _| panic!("timed_out ran after failed validation"),
        None,
    );
    assert_eq!(result, ParkResult::Invalidated);
}

#[test]
fn park_times_out() {
    static TARGET: AtomicUsize = AtomicUsize::new(0);
    let address = &TARGET as *const _ as usize;

    let observed = std::cell::Cell::new(None);
    let start = nanotime();
    let result = park(
        address,
        || Some(ParkToken(5)),
        || {},
        |token, has_more| observed.set(Some((token, has_more))),
        Some(start + 1_000_000),
    );
    assert_eq!(result, ParkResult::TimedOut);
    assert!(nanotime() - start >= 1_000_000);
    assert_eq!(observed.get(), Some((ParkToken(5), false)));
}

#[test]
fn unpark_delivers_tokens_in_fifo_order() {
    static TARGET: AtomicUsize = AtomicUsize::new(0);
    let address = &TARGET as *const _ as usize;

    let queued_a = Arc::new(AtomicBool::new(false));
    let parker_a = spawn_parker(address, &queued_a);
    wait_for(&queued_a);

    let queued_b = Arc::new(AtomicBool::new(false));
    let parker_b = spawn_parker(address, &queued_b);
    wait_for(&queued_b);

    let first = unpark_one(address, |result| {
        assert_eq!(result.unparked_threads, 1);
        assert!(result.has_more);
        UnparkToken(7)
    });
    assert_eq!(first.unparked_threads, 1);

    let second = unpark_one(address, |result| {
        assert_eq!(result.unparked_threads, 1);
        assert!(!result.has_more);
        UnparkToken(9)
    });
    assert_eq!(second.unparked_threads, 1);

    assert_eq!(parker_a.join().unwrap(), ParkResult::Unparked(UnparkToken(7)));
    assert_eq!(parker_b.join().unwrap(), ParkResult::Unparked(UnparkToken(9)));
}

#[test]
fn wake_order_matches_park_order() {
    static TARGET: AtomicUsize = AtomicUsize::new(0);
    let address = &TARGET as *const _ as usize;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut parkers = Vec::new();
    for index in 0..4usize {
        let queued = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&queued);
        let order = Arc::clone(&order);
        parkers.push(thread::spawn(move || {
            let result = park(
                address,
                || Some(ParkToken(index)),
                move || flag.store(true, Ordering::Release),
                |_, _| {},
                None,
            );
            order.lock().unwrap().push(index);
            result
        }));
        wait_for(&queued);
    }

    for woken in 1..=4usize {
        assert_eq!(
            unpark_one(address, |_| UnparkToken(0)).unparked_threads,
            1
        );
        // Wait for the wake to land before issuing the next one, so the
        // recorded order reflects the dequeue order.
        while order.lock().unwrap().len() < woken {
            thread::yield_now();
        }
    }

    for parker in parkers {
        parker.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn unpark_all_wakes_everyone() {
    static TARGET: AtomicUsize = AtomicUsize::new(0);
    let address = &TARGET as *const _ as usize;

    let mut parkers = Vec::new();
    for _ in 0..5 {
        let queued = Arc::new(AtomicBool::new(false));
        parkers.push(spawn_parker(address, &queued));
        wait_for(&queued);
    }

    assert_eq!(unpark_all(address, UnparkToken(3)), 5);
    for parker in parkers {
        assert_eq!(parker.join().unwrap(), ParkResult::Unparked(UnparkToken(3)));
    }
}

#[test]
fn distinct_addresses_are_independent() {
    static TARGET_A: AtomicUsize = AtomicUsize::new(0);
    static TARGET_B: AtomicUsize = AtomicUsize::new(0);
    let address_a = &TARGET_A as *const _ as usize;
    let address_b = &TARGET_B as *const _ as usize;

    let queued = Arc::new(AtomicBool::new(false));
    let parker = spawn_parker(address_a, &queued);
    wait_for(&queued);

    let missed = unpark_one(address_b, |result| {
        assert_eq!(result.unparked_threads, 0);
        assert!(!result.has_more);
        UnparkToken(0)
    });
    assert_eq!(missed.unparked_threads, 0);

    assert_eq!(unpark_one(address_a, |_| UnparkToken(1)).unparked_threads, 1);
    assert_eq!(parker.join().unwrap(), ParkResult::Unparked(UnparkToken(1)));
}

#[test]
fn handoff_becomes_fair_within_interval() {
    static TARGET: AtomicUsize = AtomicUsize::new(0);
    let address = &TARGET as *const _ as usize;

    let stop = Arc::new(AtomicBool::new(false));
    let parker = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                park(
                    address,
                    || Some(ParkToken(0)),
                    || {},
                    |_, _| {},
                    Some(nanotime() + 200_000),
                );
            }
        })
    };

    // Under continuous unparking, a forced-fair hand-off must show up
    // within the millisecond-scale fairness interval.
    let mut fair = 0u32;
    let deadline = Instant::now() + Duration::from_secs(2);
    while fair == 0 && Instant::now() < deadline {
        let result = unpark_one(address, |_| UnparkToken(0));
        if result.unparked_threads == 1 && result.be_fair {
            fair += 1;
        }
    }
    stop.store(true, Ordering::Release);
    while !parker.is_finished() {
        unpark_one(address, |_| UnparkToken(0));
        thread::yield_now();
    }
    parker.join().unwrap();

    assert!(fair >= 1, "no fair hand-off within two seconds");
}

#[test]
fn many_addresses_wake_independently() {
    // 80 waiters on 80 distinct addresses: with 256 buckets, several of
    // them are guaranteed to share a bucket and exercise the root list.
    const PARKERS: usize = 80;

    let slots: Arc<Vec<AtomicUsize>> = Arc::new((0..PARKERS).map(|_| AtomicUsize::new(0)).collect());
    let mut parkers = Vec::new();
    for index in 0..PARKERS {
        let queued = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&queued);
        let slots = Arc::clone(&slots);
        parkers.push(thread::spawn(move || {
            let address = &slots[index] as *const _ as usize;
            park(
                address,
                || Some(ParkToken(index)),
                move || flag.store(true, Ordering::Release),
                |_, _| {},
                None,
            )
        }));
        wait_for(&queued);
    }

    // Wake in reverse registration order so both ends of each bucket's root
    // list get unlinked.
    for index in (0..PARKERS).rev() {
        let address = &slots[index] as *const _ as usize;
        let result = unpark_one(address, |_| UnparkToken(index));
        assert_eq!(result.unparked_threads, 1, "waiter {index} missing");
    }

    for (index, parker) in parkers.into_iter().enumerate() {
        assert_eq!(
            parker.join().unwrap(),
            ParkResult::Unparked(UnparkToken(index))
        );
    }
}
