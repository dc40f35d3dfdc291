//! Multi-threaded tests for [`VersionWord`].

use super::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn test_concurrent_lock_unlock() {
    let version = Arc::new(VersionWord::new(true));
    let counter = Arc::new(AtomicU64::new(0));
    let iterations: u64 = 1000;
    let num_threads: u64 = 4;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let v = Arc::clone(&version);
            let c = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..iterations {
                    let mut guard = v.lock();
                    guard.mark_inserting();
                    // Not an atomic increment: the lock is what makes it exact.
                    let n = c.load(Ordering::Relaxed);
                    c.store(n + 1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    assert_eq!(counter.load(Ordering::Relaxed), iterations * num_threads);
    assert!(!version.is_locked());
    assert!(!version.is_dirty());
}

#[test]
fn test_stable_waits_for_writer() {
    let version = Arc::new(VersionWord::new(true));
    let writer_done = Arc::new(AtomicBool::new(false));

    let v_writer = Arc::clone(&version);
    let done = Arc::clone(&writer_done);
    let writer = thread::spawn(move || {
        let mut guard = v_writer.lock();
        guard.mark_inserting();
        thread::sleep(Duration::from_millis(30));
        done.store(true, Ordering::Release);
        drop(guard);
    });

    thread::sleep(Duration::from_millis(5));

    let v_reader = Arc::clone(&version);
    let reader = thread::spawn(move || {
        let seen = v_reader.stable();
        assert_eq!(seen & DIRTY_MASK, 0);
    });

    writer.join().expect("writer panicked");
    reader.join().expect("reader panicked");
    assert!(writer_done.load(Ordering::Acquire));
}

#[test]
fn test_validated_reads_see_consistent_pairs() {
    let version = Arc::new(VersionWord::new(true));
    let pair = Arc::new([AtomicU64::new(0), AtomicU64::new(0)]);
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let v = Arc::clone(&version);
        let p = Arc::clone(&pair);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut n: u64 = 0;
            while !stop.load(Ordering::Relaxed) {
                n += 1;
                let mut guard = v.lock();
                guard.mark_inserting();
                p[0].store(n, Ordering::Relaxed);
                p[1].store(n, Ordering::Relaxed);
            }
        })
    };

    for _ in 0..20_000 {
        let before = version.stable();
        let a = pair[0].load(Ordering::Relaxed);
        let b = pair[1].load(Ordering::Relaxed);
        if !version.has_changed(before) {
            assert_eq!(a, b);
        }
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().expect("writer panicked");
}
