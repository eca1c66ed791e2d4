//! Multi-member, multi-thread lock scenarios.

#![cfg(test)]

use super::{TestAssertions, TestGrid};
use crate::error::Error;
use crate::locks::Lock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_waiters_granted_in_request_order() {
    let grid = TestGrid::new(1);
    let lock = grid.member(1).exclusive_lock("fifo");
    let order = Arc::new(Mutex::new(Vec::new()));

    lock.lock().unwrap();

    let spawn_waiter = |tag: u32| {
        let lock = lock.clone();
        let order = order.clone();
        thread::spawn(move || {
            lock.lock().unwrap();
            order.lock().push(tag);
            thread::sleep(Duration::from_millis(20));
            lock.unlock().unwrap();
        })
    };

    let t2 = spawn_waiter(2);
    TestAssertions::assert_eventually(|| lock.pending_owners().len() == 1, WAIT, "T2 queued");
    let t3 = spawn_waiter(3);
    TestAssertions::assert_eventually(|| lock.pending_owners().len() == 2, WAIT, "T3 queued");

    lock.unlock().unwrap();
    t2.join().unwrap();
    t3.join().unwrap();

    assert_eq!(*order.lock(), vec![2, 3]);
    assert!(!lock.is_locked());
    assert!(grid.service.exclusive_map().is_empty());
}

#[test]
fn test_release_wakes_waiter_on_other_member() {
    let grid = TestGrid::new(2);
    let held = grid.member(1).exclusive_lock("orders");
    let wanted = grid.member(2).exclusive_lock("orders");

    held.lock().unwrap();

    let waiter = {
        let wanted = wanted.clone();
        thread::spawn(move || {
            let acquired = wanted.try_lock_for(WAIT).unwrap();
            let owner = wanted.owner();
            wanted.unlock().unwrap();
            (acquired, owner.map(|o| o.member_id()))
        })
    };

    TestAssertions::assert_eventually(|| wanted.has_queued_threads(), WAIT, "member 2 waiting");
    assert!(!held.has_queued_threads());
    held.unlock().unwrap();

    assert_eq!(waiter.join().unwrap(), (true, Some(2)));
    assert!(grid.member(2).metrics().contended.get() >= 1);
}

#[test]
fn test_failed_member_lock_passes_to_waiter() {
    let grid = TestGrid::new(3);
    let dead = grid.member(2).exclusive_lock("leader");
    let alive = grid.member(3).exclusive_lock("leader");

    dead.lock().unwrap();

    let waiter = {
        let alive = alive.clone();
        thread::spawn(move || {
            alive.lock().unwrap();
            let owner = alive.owner();
            alive.unlock().unwrap();
            owner.map(|o| o.member_id())
        })
    };

    TestAssertions::assert_eventually(|| alive.pending_owners().len() == 1, WAIT, "waiter queued");
    grid.fail_member(2);

    assert_eq!(waiter.join().unwrap(), Some(3));

    // the failed member's handle still believes it holds the lock
    assert!(matches!(dead.unlock(), Err(Error::IllegalMonitorState(_))));
    assert!(grid.service.metrics().member_cleanups.get() >= 1);
}

#[test]
fn test_timed_out_request_is_withdrawn() {
    let grid = TestGrid::new(2);
    let held = grid.member(1).exclusive_lock("report");
    let wanted = grid.member(2).exclusive_lock("report");
    held.lock().unwrap();

    let before = held.holder().unwrap();
    let attempt = {
        let wanted = wanted.clone();
        thread::spawn(move || wanted.try_lock_for(Duration::from_millis(60)).unwrap())
    };
    assert!(!attempt.join().unwrap());

    assert_eq!(held.holder().unwrap(), before);
    assert_eq!(grid.member(2).metrics().timeouts.get(), 1);
    held.unlock().unwrap();
    assert!(grid.service.exclusive_map().is_empty());
}

#[test]
fn test_interrupted_request_is_withdrawn() {
    let grid = TestGrid::new(2);
    let held = grid.member(1).exclusive_lock("report");
    let wanted = grid.member(2).exclusive_lock("report");
    held.lock().unwrap();

    let cancel = CancellationToken::new();
    let attempt = {
        let wanted = wanted.clone();
        let cancel = cancel.clone();
        thread::spawn(move || wanted.lock_interruptibly(&cancel))
    };

    TestAssertions::assert_eventually(|| wanted.queue_length() == 1, WAIT, "waiter queued");
    cancel.cancel();

    assert!(matches!(attempt.join().unwrap(), Err(Error::Interrupted)));
    assert!(held.pending_owners().is_empty());
    assert_eq!(grid.member(2).metrics().interruptions.get(), 1);
    held.unlock().unwrap();
}

#[test]
fn test_write_release_admits_all_readers_together() {
    let grid = TestGrid::new(3);
    let writer = grid.member(1).read_write_lock("catalog");
    writer.write_lock().lock().unwrap();

    let readers = 3;
    let all_holding = Arc::new(Barrier::new(readers));
    let handles: Vec<_> = (0..readers)
        .map(|i| {
            let lock = grid.member(2 + (i as u64 % 2)).read_write_lock("catalog");
            let all_holding = all_holding.clone();
            thread::spawn(move || {
                lock.read_lock().lock().unwrap();
                // only returns once every reader holds the lock at once
                all_holding.wait();
                lock.read_lock().unlock().unwrap();
            })
        })
        .collect();

    TestAssertions::assert_eventually(
        || writer.holder().map_or(0, |h| h.pending_read().count()) == readers,
        WAIT,
        "readers queued",
    );
    writer.write_lock().unlock().unwrap();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(grid.service.read_write_map().is_empty());
}

#[test]
fn test_writer_waits_for_last_reader() {
    let grid = TestGrid::new(2);
    let reader = grid.member(1).read_write_lock("config");
    let writer = grid.member(2).read_write_lock("config");

    reader.read_lock().lock().unwrap();
    reader.read_lock().lock().unwrap();

    let handle = {
        let writer = writer.clone();
        thread::spawn(move || {
            writer.write_lock().lock().unwrap();
            let locked = writer.is_write_locked_by_current_thread();
            writer.write_lock().unlock().unwrap();
            locked
        })
    };

    TestAssertions::assert_eventually(|| writer.has_queued_threads(), WAIT, "writer queued");
    reader.read_lock().unlock().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());

    reader.read_lock().unlock().unwrap();
    assert!(handle.join().unwrap());
}

#[test]
fn test_mutual_exclusion_across_members() {
    let grid = TestGrid::new(4);
    let counter = Arc::new(AtomicU64::new(0));
    let rounds = 25;

    let handles: Vec<_> = grid
        .member_ids()
        .into_iter()
        .flat_map(|member_id| {
            let lock = grid.member(member_id).exclusive_lock("counter");
            let counter = counter.clone();
            (0..2).map(move |_| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..rounds {
                        let _guard = lock.guard().unwrap();
                        // split read and write so overlapping holders lose updates
                        let value = counter.load(Ordering::SeqCst);
                        thread::yield_now();
                        counter.store(value + 1, Ordering::SeqCst);
                    }
                })
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 4 * 2 * rounds);
    assert!(grid.service.exclusive_map().is_empty());
}
