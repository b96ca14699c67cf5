//! A transaction that touches a frame already held by another transaction
//! conflicts and retries. Once the holder commits, the retrying
//! transaction's next attempt observes the committed value rather than a
//! stale one — a concurrent variant of the `store(a, v); load(a)`
//! read-your-own-writes law, but across transactions instead of within
//! one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

#[test]
fn a_transaction_that_conflicts_on_a_held_frame_retries_and_sees_the_committed_value() {
    picotm_harness::init_test_tracing();

    let counter = Box::leak(Box::new(0u32));
    let addr = std::ptr::from_mut(counter) as usize;
    let barrier = Arc::new(Barrier::new(2));
    let retries = Arc::new(AtomicUsize::new(0));

    let writer = {
        let barrier = Arc::clone(&barrier);
        std::thread::spawn(move || {
            picotm::atomically(|| {
                let mut buf = [0u8; 4];
                picotm::tm::load(addr, &mut buf)?;
                barrier.wait();
                // hold the frame lock open for a while so the reader's
                // first attempt is guaranteed to land while we're active.
                std::thread::sleep(Duration::from_millis(40));
                let value = u32::from_ne_bytes(buf);
                picotm::tm::store(addr, &(value + 1).to_ne_bytes())
            })
            .unwrap();
        })
    };

    let reader = {
        let barrier = Arc::clone(&barrier);
        let retries = Arc::clone(&retries);
        std::thread::spawn(move || {
            barrier.wait();
            picotm::atomically(|| {
                let mut buf = [0u8; 4];
                let outcome = picotm::tm::load(addr, &mut buf);
                if outcome.is_err() {
                    retries.fetch_add(1, Ordering::SeqCst);
                }
                outcome?;
                Ok(u32::from_ne_bytes(buf))
            })
            .unwrap()
        })
    };

    writer.join().unwrap();
    let seen = reader.join().unwrap();

    assert_eq!(seen, 1, "the retrying transaction must observe the writer's committed value");
    assert!(
        retries.load(Ordering::SeqCst) >= 1,
        "the reader's first attempt must have conflicted while the writer was still active"
    );
}
